//! Assembly of the default cross-connect forwarder.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use xconnect_types::{Connection, ConnectionRequest, Result};

use crate::address::{AddressAssigner, MacAssigner};
use crate::commit::CommitStage;
use crate::connect::{ConnectStage, Downstream, DownstreamStage};
use crate::device::Device;
use crate::endpoint::Endpoint;
use crate::handler::HandlerChain;
use crate::heal::{Establisher, ForwardRef, Healer, LegDown};
use crate::mechanisms::{EgressNegotiator, IngressNegotiator, Kernel, Memif, PreferenceList, Vxlan};
use crate::routes::RouteReconciler;
use crate::xconnect::CrossConnectStage;

/// Settings for one forwarder instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    pub name: String,
    /// Directory under which memif sockets are created.
    pub base_dir: PathBuf,
    /// Local address used as the VXLAN tunnel endpoint.
    pub tunnel_ip: IpAddr,
    /// Base URL of the dataplane agent's transaction API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_url: Option<String>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            name: "xconnect".into(),
            base_dir: PathBuf::from("/var/lib/xconnect/memif"),
            tunnel_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            device_url: None,
        }
    }
}

/// Mechanisms in the order both legs prefer them.
fn preferences(config: &ForwarderConfig) -> PreferenceList {
    PreferenceList::new()
        .with(Memif::new(config.base_dir.clone()))
        .with(Kernel)
        .with(Vxlan::new(config.tunnel_ip))
}

/// The cross-connect forwarder: an [`Endpoint`] over the default chain plus
/// the healer that re-enters it.
pub struct Forwarder {
    endpoint: Arc<Endpoint>,
    healer: Arc<Healer>,
}

impl Forwarder {
    /// Build the chain
    /// `ingress -> mac -> connect(cross-connect -> egress -> downstream) -> ip -> routes -> commit`.
    pub fn new(
        config: &ForwarderConfig,
        device: Arc<dyn Device>,
        downstream: Arc<dyn Downstream>,
    ) -> Self {
        let heal_target = ForwardRef::new();
        let healer = Arc::new(Healer::new(heal_target.clone()));

        let client = HandlerChain::new()
            .with(CrossConnectStage)
            .with(EgressNegotiator::new(preferences(config)))
            .with(DownstreamStage::new(downstream));

        let chain = HandlerChain::new()
            .with(IngressNegotiator::new(preferences(config)))
            .with(MacAssigner)
            .with(ConnectStage::new(client))
            .with(AddressAssigner)
            .with(RouteReconciler)
            .with(CommitStage::new(device));

        let endpoint = Arc::new(Endpoint::new(config.name.clone(), chain).with_healer(healer.clone()));
        let target: Arc<dyn Establisher> = endpoint.clone();
        heal_target.bind(&target);

        tracing::info!(
            forwarder = %config.name,
            handlers = ?endpoint.chain().names(),
            "Forwarder assembled"
        );
        Self { endpoint, healer }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn healer(&self) -> &Arc<Healer> {
        &self.healer
    }

    pub async fn establish(&self, request: ConnectionRequest) -> Result<Connection> {
        self.endpoint.establish(request).await
    }

    pub async fn teardown(&self, connection: &Connection) -> Result<()> {
        self.endpoint.teardown(connection).await
    }

    /// Re-run Establish for a live connection with its remembered request.
    pub async fn heal(&self, connection_id: &str) -> Result<Connection> {
        self.healer.heal(connection_id).await
    }

    /// Heal connections as their outgoing legs are reported down.
    ///
    /// The sender belongs to whatever monitors the next hop; a
    /// [`Downstream`] that watches its connections reports a lost leg as a
    /// [`LegDown`] for the incoming connection id. The one-shot CLI commands
    /// have no such monitor and never start this loop.
    pub fn spawn_heal_loop(&self, events: mpsc::Receiver<LegDown>) -> JoinHandle<()> {
        tokio::spawn(self.healer.clone().run(events))
    }
}
