//! The single device commit at the end of every traversal.

use std::sync::Arc;

use async_trait::async_trait;

use xconnect_types::{CommitOp, Connection, ConnectionRequest, Env, Result, XconnectError};

use crate::device::Device;
use crate::handler::{Handler, Next};

/// Sends the staged configuration to the device once the rest of the chain
/// has returned: Update on Establish, Delete on Teardown.
pub struct CommitStage {
    device: Arc<dyn Device>,
}

impl CommitStage {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device }
    }

    async fn flush(&self, env: &mut Env, op: CommitOp) -> Result<()> {
        let document = env
            .config_mut()
            .take_for_commit()
            .ok_or_else(|| XconnectError::ChainAbort {
                handler: self.name().to_string(),
                message: "staged configuration was already committed".into(),
            })?;

        tracing::info!(
            %op,
            interfaces = document.interfaces.len(),
            kernel_interfaces = document.kernel_interfaces.len(),
            routes = document.routes.len(),
            cross_connects = document.cross_connects.len(),
            "Committing configuration"
        );
        self.device
            .commit(op, &document)
            .await
            .map_err(|e| XconnectError::CommitFailure {
                op,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl Handler for CommitStage {
    fn name(&self) -> &str {
        "commit"
    }

    async fn establish(
        &self,
        env: &mut Env,
        request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        let connection = next.establish(env, request).await?;
        self.flush(env, CommitOp::Update).await?;
        Ok(connection)
    }

    async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        next.teardown(env, connection).await?;
        self.flush(env, CommitOp::Delete).await
    }
}
