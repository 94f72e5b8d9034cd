//! L2 splice between the incoming and outgoing dataplane interfaces.

use async_trait::async_trait;

use xconnect_types::{slots, Connection, ConnectionRequest, CrossConnect, Env, Result};

use crate::handler::{Handler, Next};

/// First handler of the outgoing chain. Once the rest of that chain has
/// registered the outgoing interface, cross-connects it with the incoming one
/// in both directions.
#[derive(Debug, Default)]
pub struct CrossConnectStage;

impl CrossConnectStage {
    fn splice(env: &mut Env, outgoing_id: &str) {
        let Some(incoming_id) = env
            .slot(&slots::INCOMING_REQUEST)
            .map(|r| r.id().to_string())
        else {
            tracing::warn!(connection = %outgoing_id, "No incoming request to cross-connect with");
            return;
        };

        let config = env.config();
        let (Some(incoming), Some(outgoing)) = (
            config.interface_for(&incoming_id).map(|i| i.name.clone()),
            config.interface_for(outgoing_id).map(|i| i.name.clone()),
        ) else {
            tracing::warn!(
                incoming = %incoming_id,
                outgoing = %outgoing_id,
                "Missing interface for cross-connect"
            );
            return;
        };

        let config = env.config_mut();
        config.add_cross_connect(CrossConnect {
            receive_interface: incoming.clone(),
            transmit_interface: outgoing.clone(),
        });
        config.add_cross_connect(CrossConnect {
            receive_interface: outgoing,
            transmit_interface: incoming,
        });
    }
}

#[async_trait]
impl Handler for CrossConnectStage {
    fn name(&self) -> &str {
        "cross-connect"
    }

    async fn establish(
        &self,
        env: &mut Env,
        request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let connection = next.establish(env, request).await?;
        Self::splice(env, &connection.id);
        Ok(connection)
    }

    async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        next.teardown(env, connection).await?;
        Self::splice(env, &connection.id);
        Ok(())
    }
}
