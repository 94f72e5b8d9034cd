//! End-to-end tests for the cross-connect forwarder.
//!
//! Each test drives a full `Forwarder` (or a hand-built chain) against an
//! in-memory device and inspects the documents it received.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use xconnect_chain::{
    CommitStage, Device, DeviceError, Forwarder, ForwarderConfig, Handler, HandlerChain,
    IngressNegotiator, Kernel, LegDown, LocalDownstream, Memif, Next, PreferenceList,
    RecordingDevice, RouteReconciler,
};
use xconnect_types::{
    CommitOp, ConfigDocument, Connection, ConnectionContext, ConnectionRequest, Env,
    InterfaceLink, IpContext, IpRoute, Mechanism, MechanismClass, RouteScope, Traversal,
    XconnectError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(base_dir: &std::path::Path) -> ForwarderConfig {
    ForwarderConfig {
        name: "fwd-test".into(),
        base_dir: base_dir.to_path_buf(),
        tunnel_ip: "192.0.2.10".parse().unwrap(),
        device_url: None,
    }
}

/// A request arriving over a kernel interface named `vppKernel0`.
fn kernel_request(id: &str) -> ConnectionRequest {
    ConnectionRequest::new(
        Connection::new(id)
            .with_mechanism(
                Mechanism::new(MechanismClass::Local, "KERNEL")
                    .with_parameter("name", "vppKernel0")
                    .with_parameter("netnsURL", "file:///proc/4242/ns/net"),
            )
            .with_context(ConnectionContext {
                ip_context: IpContext {
                    src_ip_addr: "10.0.0.1/24".into(),
                    dst_ip_addr: "8.8.8.8/32".into(),
                    src_routes: vec![IpRoute::new("192.168.0.0/16")],
                    dst_routes: Vec::new(),
                },
                ethernet_context: None,
            }),
    )
}

fn forwarder(dir: &tempfile::TempDir, device: Arc<dyn Device>) -> Forwarder {
    Forwarder::new(&config(dir.path()), device, Arc::new(LocalDownstream))
}

// ---------------------------------------------------------------------------
// Test 1: Kernel in, memif out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn kernel_to_memif_commits_one_complete_document() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(RecordingDevice::new());
    let fwd = forwarder(&dir, device.clone());

    let conn = fwd.establish(kernel_request("conn-1")).await.unwrap();

    // The returned connection carries the outgoing leg the next hop chose.
    let downstream = conn.downstream.as_deref().expect("outgoing leg recorded");
    assert_eq!(downstream.id, "conn-1-egress");
    assert_eq!(downstream.mechanism_type(), Some("MEMIF"));

    let transactions = device.transactions().await;
    assert_eq!(transactions.len(), 1, "exactly one commit per establish");
    let (op, doc) = &transactions[0];
    assert_eq!(*op, CommitOp::Update);

    let names: Vec<_> = doc.interfaces.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["server-tap-conn-1", "client-memif-conn-1-egress"]);
    assert!(matches!(
        doc.interfaces[1].link,
        InterfaceLink::Memif { master: false, .. }
    ));

    assert_eq!(doc.kernel_interfaces.len(), 1);
    assert_eq!(doc.kernel_interfaces[0].name, "vppKernel0");
    assert_eq!(
        doc.kernel_interfaces[0].namespace.as_deref(),
        Some("file:///proc/4242/ns/net")
    );
    assert_eq!(doc.kernel_interfaces[0].ip_addresses, vec!["10.0.0.1/24".to_string()]);

    assert_eq!(doc.routes.len(), 2);
    assert_eq!(doc.routes[0].dst_network, "192.168.0.0/16");
    assert_eq!(doc.routes[0].gw_addr.as_deref(), Some("8.8.8.8"));
    assert_eq!(doc.routes[1].dst_network, "8.8.8.8/32");
    assert_eq!(doc.routes[1].scope, RouteScope::Link);
    assert_eq!(doc.routes[1].outgoing_interface, "vppKernel0");

    let pairs: Vec<_> = doc
        .cross_connects
        .iter()
        .map(|x| (x.receive_interface.as_str(), x.transmit_interface.as_str()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("server-tap-conn-1", "client-memif-conn-1-egress"),
            ("client-memif-conn-1-egress", "server-tap-conn-1"),
        ]
    );
    assert!(fwd.healer().is_remembered("conn-1").await);
}

// ---------------------------------------------------------------------------
// Test 2: Teardown describes exactly what Establish installed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn teardown_deletes_the_same_document() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(RecordingDevice::new());
    let fwd = forwarder(&dir, device.clone());

    let conn = fwd.establish(kernel_request("conn-1")).await.unwrap();
    fwd.teardown(&conn).await.unwrap();

    let transactions = device.transactions().await;
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0].0, CommitOp::Update);
    assert_eq!(transactions[1].0, CommitOp::Delete);
    assert_eq!(transactions[0].1, transactions[1].1);
    assert!(!fwd.healer().is_remembered("conn-1").await);
}

// ---------------------------------------------------------------------------
// Test 3: Memif in, the forwarder owns the socket directory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memif_ingress_creates_socket_directory_and_skips_routes() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(RecordingDevice::new());
    let fwd = forwarder(&dir, device.clone());

    let mut request = ConnectionRequest::new(Connection::new("conn-2"));
    request
        .mechanism_preferences
        .push(Mechanism::new(MechanismClass::Local, "MEMIF"));
    request.connection.context.ip_context = IpContext {
        src_ip_addr: "10.0.0.1/24".into(),
        dst_ip_addr: "8.8.8.8/32".into(),
        src_routes: vec![IpRoute::new("192.168.0.0/16")],
        dst_routes: Vec::new(),
    };

    let conn = fwd.establish(request).await.unwrap();
    assert_eq!(
        conn.mechanism.as_ref().unwrap().parameter("socketfile"),
        Some("conn-2/memif.sock")
    );
    assert!(dir.path().join("conn-2").is_dir());

    let (_, doc) = device.last().await.unwrap();
    assert!(doc.routes.is_empty(), "routes apply to kernel legs only");
    assert!(doc.kernel_interfaces.is_empty());
}

// ---------------------------------------------------------------------------
// Test 4: Ingress negotiation failure never reaches the device
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsupported_mechanism_fails_without_commit() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(RecordingDevice::new());
    let fwd = forwarder(&dir, device.clone());

    let request = ConnectionRequest::new(
        Connection::new("conn-3").with_mechanism(Mechanism::new(MechanismClass::Local, "SRIOV")),
    );
    let err = fwd.establish(request).await.unwrap_err();

    assert!(err.is_negotiation_failure(), "got: {err}");
    assert!(device.transactions().await.is_empty());
    assert!(!fwd.healer().is_remembered("conn-3").await);
}

// ---------------------------------------------------------------------------
// Test 5: An aborting handler stops the chain before commit
// ---------------------------------------------------------------------------

struct Abort;

#[async_trait]
impl Handler for Abort {
    fn name(&self) -> &str {
        "abort"
    }

    async fn establish(
        &self,
        _env: &mut Env,
        _request: ConnectionRequest,
        _next: Next<'_>,
    ) -> xconnect_types::Result<xconnect_types::Connection> {
        Err(XconnectError::ChainAbort {
            handler: "abort".into(),
            message: "stop here".into(),
        })
    }

    async fn teardown(
        &self,
        _env: &mut Env,
        _connection: &Connection,
        _next: Next<'_>,
    ) -> xconnect_types::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn chain_abort_prevents_commit() {
    let device = Arc::new(RecordingDevice::new());
    let chain = HandlerChain::new()
        .with(IngressNegotiator::new(PreferenceList::new().with(Kernel)))
        .with(RouteReconciler)
        .with(Abort)
        .with(CommitStage::new(device.clone()));

    let mut env = Env::new(Traversal::Establish);
    let err = chain
        .establish(&mut env, kernel_request("conn-4"))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "Handler 'abort' aborted the chain: stop here");
    assert!(device.transactions().await.is_empty());
    assert!(!env.config().is_committed());
    // Work staged ahead of the abort is discarded with the environment.
    assert_eq!(env.config().routes().len(), 2);
}

// ---------------------------------------------------------------------------
// Test 6: Commit failures surface as such
// ---------------------------------------------------------------------------

struct Unavailable;

#[async_trait]
impl Device for Unavailable {
    async fn commit(&self, _op: CommitOp, _document: &ConfigDocument) -> Result<(), DeviceError> {
        Err(DeviceError::Other("agent unavailable".into()))
    }
}

#[tokio::test]
async fn device_failure_is_reported_as_commit_failure() {
    let dir = tempfile::tempdir().unwrap();
    let fwd = forwarder(&dir, Arc::new(Unavailable));

    let err = fwd.establish(kernel_request("conn-5")).await.unwrap_err();
    assert!(err.is_commit_failure());
    assert_eq!(err.to_string(), "Commit (update) to device failed: agent unavailable");

    // A connection that never reached the device is not healed later.
    assert!(!fwd.healer().is_remembered("conn-5").await);
    let err = fwd.heal("conn-5").await.unwrap_err();
    assert!(matches!(err, XconnectError::UnknownConnection { .. }));
}

// ---------------------------------------------------------------------------
// Test 7: Heal is serialized with an in-flight establish
// ---------------------------------------------------------------------------

/// Blocks every commit until the test releases it.
struct GatedDevice {
    started: mpsc::UnboundedSender<()>,
    release: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    committed: Mutex<Vec<CommitOp>>,
}

impl GatedDevice {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (started, rx) = mpsc::unbounded_channel();
        let device = Arc::new(Self {
            started,
            release: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            committed: Mutex::new(Vec::new()),
        });
        (device, rx)
    }
}

#[async_trait]
impl Device for GatedDevice {
    async fn commit(&self, op: CommitOp, _document: &ConfigDocument) -> Result<(), DeviceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _ = self.started.send(());

        let permit = self
            .release
            .acquire()
            .await
            .map_err(|e| DeviceError::Other(e.to_string()))?;
        permit.forget();

        self.committed.lock().unwrap().push(op);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn heal_waits_for_in_flight_establish() {
    let dir = tempfile::tempdir().unwrap();
    let (device, mut started) = GatedDevice::new();
    let fwd = Arc::new(forwarder(&dir, device.clone()));

    let first = {
        let fwd = fwd.clone();
        tokio::spawn(async move { fwd.establish(kernel_request("conn-1")).await })
    };
    started.recv().await.unwrap();

    // The heal queues behind conn-1 and reads the request once establish is done.
    let heal = {
        let fwd = fwd.clone();
        tokio::spawn(async move { fwd.heal("conn-1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        started.try_recv().is_err(),
        "heal must not reach the device while establish holds conn-1"
    );

    device.release.add_permits(1);
    first.await.unwrap().unwrap();

    started.recv().await.unwrap();
    device.release.add_permits(1);
    let healed = heal.await.unwrap().unwrap();

    assert_eq!(healed.id, "conn-1");
    assert_eq!(healed.mechanism_type(), Some("KERNEL"));
    assert_eq!(
        *device.committed.lock().unwrap(),
        vec![CommitOp::Update, CommitOp::Update]
    );
    assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn heal_queued_behind_teardown_does_not_reopen_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (device, mut started) = GatedDevice::new();
    let fwd = Arc::new(forwarder(&dir, device.clone()));

    device.release.add_permits(1);
    let conn = fwd.establish(kernel_request("conn-1")).await.unwrap();
    started.recv().await.unwrap();

    // A second establish holds conn-1 at the device.
    let again = {
        let fwd = fwd.clone();
        tokio::spawn(async move { fwd.establish(kernel_request("conn-1")).await })
    };
    started.recv().await.unwrap();

    // Teardown queues first, heal after it.
    let teardown = {
        let fwd = fwd.clone();
        let conn = conn.clone();
        tokio::spawn(async move { fwd.teardown(&conn).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let heal = {
        let fwd = fwd.clone();
        tokio::spawn(async move { fwd.heal("conn-1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    device.release.add_permits(3);
    again.await.unwrap().unwrap();
    teardown.await.unwrap().unwrap();
    let err = heal.await.unwrap().unwrap_err();

    assert!(matches!(err, XconnectError::UnknownConnection { ref id } if id == "conn-1"));
    assert_eq!(
        *device.committed.lock().unwrap(),
        vec![CommitOp::Update, CommitOp::Update, CommitOp::Delete]
    );
    assert!(!fwd.healer().is_remembered("conn-1").await);
    assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Test 8: Heal loop driven by leg-down events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heal_loop_reestablishes_reported_connections() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(RecordingDevice::new());
    let fwd = forwarder(&dir, device.clone());

    fwd.establish(kernel_request("conn-1")).await.unwrap();

    let (tx, rx) = mpsc::channel(8);
    let task = fwd.spawn_heal_loop(rx);
    tx.send(LegDown::new("conn-1")).await.unwrap();
    tx.send(LegDown::new("never-established")).await.unwrap();
    drop(tx);
    task.await.unwrap();

    let transactions = device.transactions().await;
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0].1, transactions[1].1);
}

#[tokio::test]
async fn heal_of_closed_connection_is_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(RecordingDevice::new());
    let fwd = forwarder(&dir, device.clone());

    let conn = fwd.establish(kernel_request("conn-1")).await.unwrap();
    fwd.teardown(&conn).await.unwrap();

    let err = fwd.heal("conn-1").await.unwrap_err();
    assert!(matches!(err, XconnectError::UnknownConnection { .. }));
}

// ---------------------------------------------------------------------------
// Test 9: Memif directly with a custom chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn preference_order_picks_first_supported_proposal() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(RecordingDevice::new());
    let chain = HandlerChain::new()
        .with(IngressNegotiator::new(
            PreferenceList::new().with(Kernel).with(Memif::new(dir.path())),
        ))
        .with(CommitStage::new(device.clone()));

    let mut request = ConnectionRequest::new(Connection::new("conn-6"));
    request
        .mechanism_preferences
        .push(Mechanism::new(MechanismClass::Local, "MEMIF"));
    request
        .mechanism_preferences
        .push(Mechanism::new(MechanismClass::Local, "KERNEL"));

    let mut env = Env::new(Traversal::Establish);
    let conn = chain.establish(&mut env, request).await.unwrap();

    // The forwarder's own order wins over the requester's.
    assert_eq!(conn.mechanism_type(), Some("KERNEL"));
    assert_eq!(device.last().await.unwrap().1.kernel_interfaces.len(), 1);
}
