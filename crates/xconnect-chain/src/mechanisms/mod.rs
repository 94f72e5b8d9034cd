//! Mechanism negotiation for the incoming and outgoing legs.
//!
//! Both negotiators walk a [`PreferenceList`] front to back; the first entry
//! that accepts wins, so ties are broken by position only.

pub mod kernel;
pub mod memif;
pub mod vxlan;

pub use kernel::Kernel;
pub use memif::Memif;
pub use vxlan::Vxlan;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use xconnect_types::{
    slots, Connection, ConnectionRequest, Env, Leg, Mechanism, Result, Traversal, XconnectError,
};

use crate::handler::{Handler, Next};

// ---------------------------------------------------------------------------
// MechanismHandler trait
// ---------------------------------------------------------------------------

/// One way of realizing a leg (shared-memory ring, kernel interface, tunnel).
#[async_trait]
pub trait MechanismHandler: Send + Sync {
    /// Mechanism type this handler realizes (e.g. "MEMIF").
    fn mechanism_type(&self) -> &str;

    fn accepts(&self, mechanism: &Mechanism) -> bool {
        mechanism.is_type(self.mechanism_type())
    }

    /// Mechanism offered to the next hop for an outgoing leg.
    fn preference(&self, request: &ConnectionRequest) -> Mechanism;

    /// Fill in server-side parameters of a mechanism accepted on the incoming leg.
    fn complete(&self, _connection_id: &str, _mechanism: &mut Mechanism) -> Result<()> {
        Ok(())
    }

    /// Register the interface(s) realizing `connection` on `leg`.
    ///
    /// Implementations validate everything before the first append so a
    /// failure leaves nothing registered.
    async fn attach(&self, env: &mut Env, leg: Leg, connection: &Connection) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PreferenceList
// ---------------------------------------------------------------------------

/// Ordered mechanism handlers. Position is the only tie-breaker.
#[derive(Default)]
pub struct PreferenceList {
    entries: Vec<Box<dyn MechanismHandler>>,
}

impl PreferenceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl MechanismHandler + 'static) -> Self {
        self.entries.push(Box::new(handler));
        self
    }

    pub fn types(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.mechanism_type().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry accepting any of `proposals`, scanning entries in list order.
    pub fn select<'a>(
        &self,
        proposals: &[&'a Mechanism],
    ) -> Option<(&dyn MechanismHandler, &'a Mechanism)> {
        self.entries.iter().find_map(|entry| {
            proposals
                .iter()
                .find(|p| entry.accepts(p))
                .map(|p| (entry.as_ref(), *p))
        })
    }

    /// First entry accepting `mechanism`.
    pub fn find(&self, mechanism: &Mechanism) -> Option<&dyn MechanismHandler> {
        self.entries
            .iter()
            .find(|e| e.accepts(mechanism))
            .map(|e| e.as_ref())
    }

    fn iter(&self) -> impl Iterator<Item = &dyn MechanismHandler> {
        self.entries.iter().map(|e| e.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Naming helpers
// ---------------------------------------------------------------------------

/// Linux caps interface names at 15 bytes.
const MAX_KERNEL_IF_NAME: usize = 15;

/// Dataplane interface name for one leg of a connection.
pub(crate) fn dataplane_name(leg: Leg, kind: &str, connection_id: &str) -> String {
    let side = match leg {
        Leg::Ingress => "server",
        Leg::Egress => "client",
    };
    format!("{side}-{kind}-{connection_id}")
}

/// Kernel interface name derived from a connection id: `nsm` plus the first
/// hex digits of the id's SHA-256, so distinct ids get distinct names.
pub(crate) fn kernel_name(connection_id: &str) -> String {
    let digest = Sha256::digest(connection_id.as_bytes());
    let mut name = String::with_capacity(MAX_KERNEL_IF_NAME);
    name.push_str("nsm");
    for byte in digest.iter().take((MAX_KERNEL_IF_NAME - 3) / 2) {
        name.push_str(&format!("{byte:02x}"));
    }
    name
}

// ---------------------------------------------------------------------------
// IngressNegotiator
// ---------------------------------------------------------------------------

/// Picks the mechanism for the incoming leg and registers its interface
/// before the rest of the chain runs.
pub struct IngressNegotiator {
    preferences: PreferenceList,
}

impl IngressNegotiator {
    pub fn new(preferences: PreferenceList) -> Self {
        Self { preferences }
    }
}

#[async_trait]
impl Handler for IngressNegotiator {
    fn name(&self) -> &str {
        "ingress-mechanism"
    }

    async fn establish(
        &self,
        env: &mut Env,
        mut request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let (entry, mut mechanism) = {
            let proposals = request.proposals();
            let (entry, proposal) =
                self.preferences
                    .select(&proposals)
                    .ok_or_else(|| XconnectError::NegotiationFailure {
                        leg: Leg::Ingress,
                        connection: request.id().to_string(),
                        offered: proposals.iter().map(|m| m.mechanism_type.clone()).collect(),
                    })?;
            (entry, proposal.clone())
        };
        entry.complete(request.id(), &mut mechanism)?;
        tracing::debug!(
            connection = %request.id(),
            mechanism = %mechanism.mechanism_type,
            "Selected ingress mechanism"
        );
        request.connection.mechanism = Some(mechanism);
        entry.attach(env, Leg::Ingress, &request.connection).await?;

        next.establish(env, request).await
    }

    async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        let entry = negotiated_entry(&self.preferences, Leg::Ingress, connection, self.name())?;
        entry.attach(env, Leg::Ingress, connection).await?;
        next.teardown(env, connection).await
    }
}

// ---------------------------------------------------------------------------
// EgressNegotiator
// ---------------------------------------------------------------------------

/// Offers every preferred mechanism to the next hop, then realizes whichever
/// one it chose. Once the leg is realized the incoming request is published
/// as the connection's heal request.
pub struct EgressNegotiator {
    preferences: PreferenceList,
}

impl EgressNegotiator {
    pub fn new(preferences: PreferenceList) -> Self {
        Self { preferences }
    }

    async fn realize(
        &self,
        env: &mut Env,
        connection: &Connection,
        offered: Vec<String>,
    ) -> Result<()> {
        let entry = connection
            .mechanism
            .as_ref()
            .and_then(|m| self.preferences.find(m))
            .ok_or_else(|| XconnectError::NegotiationFailure {
                leg: Leg::Egress,
                connection: connection.id.clone(),
                offered,
            })?;
        tracing::debug!(
            connection = %connection.id,
            mechanism = entry.mechanism_type(),
            "Next hop selected egress mechanism"
        );
        entry.attach(env, Leg::Egress, connection).await
    }
}

#[async_trait]
impl Handler for EgressNegotiator {
    fn name(&self) -> &str {
        "egress-mechanism"
    }

    async fn establish(
        &self,
        env: &mut Env,
        mut request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        for entry in self.preferences.iter() {
            let offer = entry.preference(&request);
            request.mechanism_preferences.push(offer);
        }
        let offered = self.preferences.types();

        let connection = next.establish(env, request).await?;

        if let Err(e) = self.realize(env, &connection, offered).await {
            // The next hop already granted the leg; give it back.
            if let Err(close) = next.teardown(env, &connection).await {
                tracing::warn!(
                    connection = %connection.id,
                    error = %close,
                    "Failed to close unusable outgoing leg"
                );
            }
            return Err(e);
        }

        if let Some(incoming) = env.slot(&slots::INCOMING_REQUEST).cloned() {
            env.publish(&slots::HEAL_REQUEST, incoming);
        }
        Ok(connection)
    }

    async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        let entry = negotiated_entry(&self.preferences, Leg::Egress, connection, self.name())?;
        entry.attach(env, Leg::Egress, connection).await?;
        next.teardown(env, connection).await
    }
}

/// Entry matching the mechanism a connection already carries.
fn negotiated_entry<'a>(
    preferences: &'a PreferenceList,
    leg: Leg,
    connection: &Connection,
    handler: &str,
) -> Result<&'a dyn MechanismHandler> {
    let mechanism = connection
        .mechanism
        .as_ref()
        .ok_or_else(|| XconnectError::ChainAbort {
            handler: handler.to_string(),
            message: format!("connection '{}' has no mechanism", connection.id),
        })?;
    preferences
        .find(mechanism)
        .ok_or_else(|| XconnectError::NegotiationFailure {
            leg,
            connection: connection.id.clone(),
            offered: vec![mechanism.mechanism_type.clone()],
        })
}

/// Whether this traversal sets things up (as opposed to describing them for removal).
pub(crate) fn is_establish(env: &Env) -> bool {
    env.traversal() == Traversal::Establish
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
