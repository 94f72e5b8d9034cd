//! Building the outgoing leg toward the next hop.

use std::sync::Arc;

use async_trait::async_trait;

use xconnect_types::{
    slots, Connection, ConnectionRequest, Env, Leg, MechanismClass, Result, XconnectError,
};

use crate::handler::{Handler, HandlerChain, Next};

/// Identifier of the outgoing connection built for `incoming_id`.
pub fn outgoing_id(incoming_id: &str) -> String {
    format!("{incoming_id}-egress")
}

// ---------------------------------------------------------------------------
// Downstream
// ---------------------------------------------------------------------------

/// The next hop the outgoing leg is requested from.
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Ask the next hop for a connection; it answers with the mechanism it chose.
    async fn request(&self, request: ConnectionRequest) -> Result<Connection>;

    async fn close(&self, connection: &Connection) -> Result<()>;
}

/// A next hop on the same node that takes the first local mechanism offered.
#[derive(Debug, Default)]
pub struct LocalDownstream;

#[async_trait]
impl Downstream for LocalDownstream {
    async fn request(&self, request: ConnectionRequest) -> Result<Connection> {
        let mechanism = request
            .mechanism_preferences
            .iter()
            .find(|m| m.cls == MechanismClass::Local)
            .cloned()
            .ok_or_else(|| XconnectError::NegotiationFailure {
                leg: Leg::Egress,
                connection: request.id().to_string(),
                offered: request
                    .mechanism_preferences
                    .iter()
                    .map(|m| m.mechanism_type.clone())
                    .collect(),
            })?;
        Ok(request.connection.with_mechanism(mechanism))
    }

    async fn close(&self, _connection: &Connection) -> Result<()> {
        Ok(())
    }
}

/// Last handler of the outgoing chain: hands the request to the next hop.
pub struct DownstreamStage {
    downstream: Arc<dyn Downstream>,
}

impl DownstreamStage {
    pub fn new(downstream: Arc<dyn Downstream>) -> Self {
        Self { downstream }
    }
}

#[async_trait]
impl Handler for DownstreamStage {
    fn name(&self) -> &str {
        "downstream"
    }

    async fn establish(
        &self,
        _env: &mut Env,
        request: ConnectionRequest,
        _next: Next<'_>,
    ) -> Result<Connection> {
        self.downstream.request(request).await
    }

    async fn teardown(
        &self,
        _env: &mut Env,
        connection: &Connection,
        _next: Next<'_>,
    ) -> Result<()> {
        self.downstream.close(connection).await
    }
}

// ---------------------------------------------------------------------------
// ConnectStage
// ---------------------------------------------------------------------------

/// Runs the outgoing chain inside the incoming traversal, sharing its
/// environment so both legs land in one staged configuration.
pub struct ConnectStage {
    client: HandlerChain,
}

impl ConnectStage {
    pub fn new(client: HandlerChain) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Handler for ConnectStage {
    fn name(&self) -> &str {
        "connect"
    }

    async fn establish(
        &self,
        env: &mut Env,
        mut request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        env.publish(&slots::INCOMING_REQUEST, request.clone());

        let mut outgoing = Connection::new(outgoing_id(request.id()));
        outgoing.context = request.connection.context.clone();
        let downstream = self
            .client
            .establish(env, ConnectionRequest::new(outgoing))
            .await?;
        tracing::info!(
            connection = %request.id(),
            downstream = %downstream.id,
            mechanism = downstream.mechanism_type().unwrap_or("none"),
            "Outgoing leg established"
        );

        request.connection.downstream = Some(Box::new(downstream));
        next.establish(env, request).await
    }

    async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        env.publish(
            &slots::INCOMING_REQUEST,
            ConnectionRequest::new(connection.clone()),
        );
        match connection.downstream.as_deref() {
            Some(downstream) => self.client.teardown(env, downstream).await?,
            None => tracing::warn!(
                connection = %connection.id,
                "No outgoing leg recorded; skipping its teardown"
            ),
        }
        next.teardown(env, connection).await
    }
}
