//! Re-establishing a connection whose outgoing leg went down.
//!
//! The healer lives inside the chain it re-enters, so it reaches the chain's
//! endpoint through a [`ForwardRef`] that is bound after the endpoint exists.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use xconnect_types::{Connection, ConnectionRequest, Result, XconnectError};

/// Anything that can run a full Establish for a request.
#[async_trait]
pub trait Establisher: Send + Sync {
    async fn establish(&self, request: ConnectionRequest) -> Result<Connection>;

    /// Establish `connection_id` again from its remembered request. The
    /// request is looked up only once no other traversal of the id is
    /// running, so a completed Teardown is never undone.
    async fn heal(&self, connection_id: &str) -> Result<Connection>;
}

// ---------------------------------------------------------------------------
// ForwardRef
// ---------------------------------------------------------------------------

/// Write-once, late-bound reference to an [`Establisher`].
///
/// Holds only a weak reference, so binding never keeps the target alive.
#[derive(Clone, Default)]
pub struct ForwardRef {
    cell: Arc<OnceLock<Weak<dyn Establisher>>>,
}

impl ForwardRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the target. Returns `false` if it was already bound.
    pub fn bind(&self, target: &Arc<dyn Establisher>) -> bool {
        self.cell.set(Arc::downgrade(target)).is_ok()
    }

    pub fn is_bound(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The target, if bound and still alive.
    pub fn get(&self) -> Option<Arc<dyn Establisher>> {
        self.cell.get().and_then(Weak::upgrade)
    }
}

// ---------------------------------------------------------------------------
// Healer
// ---------------------------------------------------------------------------

/// Notification that the outgoing leg of a connection was lost.
///
/// Produced by whatever watches the next hop, usually the [`Downstream`]
/// implementation's connection monitor, and fed to [`Healer::run`].
///
/// [`Downstream`]: crate::connect::Downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegDown {
    /// Identifier of the incoming connection.
    pub connection_id: String,
}

impl LegDown {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
        }
    }
}

/// Remembers the incoming request of every live connection and replays it
/// through the bound endpoint on demand.
pub struct Healer {
    target: ForwardRef,
    remembered: Mutex<HashMap<String, ConnectionRequest>>,
}

impl Healer {
    pub fn new(target: ForwardRef) -> Self {
        Self {
            target,
            remembered: Mutex::new(HashMap::new()),
        }
    }

    pub async fn remember(&self, request: ConnectionRequest) {
        tracing::trace!(connection = %request.id(), "Remembering request for heal");
        self.remembered
            .lock()
            .await
            .insert(request.id().to_string(), request);
    }

    pub async fn forget(&self, connection_id: &str) {
        self.remembered.lock().await.remove(connection_id);
    }

    pub async fn is_remembered(&self, connection_id: &str) -> bool {
        self.remembered.lock().await.contains_key(connection_id)
    }

    pub async fn recall(&self, connection_id: &str) -> Option<ConnectionRequest> {
        self.remembered.lock().await.get(connection_id).cloned()
    }

    /// Re-establish `connection_id` through the bound endpoint. The incoming
    /// mechanism is reused, only the outgoing leg is negotiated again.
    ///
    /// The remembered request is read by the endpoint under the connection's
    /// lock, so a heal queued behind an Establish sees that Establish's result.
    pub async fn heal(&self, connection_id: &str) -> Result<Connection> {
        let target = self.target.get().ok_or(XconnectError::HealUnavailable)?;

        tracing::info!(connection = %connection_id, "Healing connection");
        target.heal(connection_id).await
    }

    /// Heal every connection reported on `events` until the sender side closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<LegDown>) {
        while let Some(event) = events.recv().await {
            match self.heal(&event.connection_id).await {
                Ok(_) => {
                    tracing::info!(connection = %event.connection_id, "Connection healed")
                }
                Err(e) => tracing::warn!(
                    connection = %event.connection_id,
                    error = %e,
                    "Heal failed"
                ),
            }
        }
        tracing::debug!("Heal event stream closed");
    }
}
