//! Layer-2 and layer-3 addressing of the incoming leg.

use async_trait::async_trait;

use xconnect_types::{slots, Connection, ConnectionRequest, Env, Result};

use crate::handler::{Handler, Next};

// ---------------------------------------------------------------------------
// AddressAssigner
// ---------------------------------------------------------------------------

/// Gives the server-side kernel interface the connection's source address.
#[derive(Debug, Default)]
pub struct AddressAssigner;

impl AddressAssigner {
    fn assign(env: &mut Env, connection: &Connection) {
        let src = &connection.ip_context().src_ip_addr;
        if src.is_empty() {
            return;
        }
        let Some(id) = env.slot(&slots::SERVER_INTERFACE).copied() else {
            return;
        };
        if let Some(kernel) = env.config_mut().kernel_interface_mut(id) {
            kernel.ip_addresses.push(src.clone());
        }
    }
}

#[async_trait]
impl Handler for AddressAssigner {
    fn name(&self) -> &str {
        "ip-address"
    }

    async fn establish(
        &self,
        env: &mut Env,
        request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        Self::assign(env, &request.connection);
        next.establish(env, request).await
    }

    async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        Self::assign(env, connection);
        next.teardown(env, connection).await
    }
}

// ---------------------------------------------------------------------------
// MacAssigner
// ---------------------------------------------------------------------------

/// Sets the peer-requested hardware address on the incoming dataplane interface.
#[derive(Debug, Default)]
pub struct MacAssigner;

impl MacAssigner {
    fn assign(env: &mut Env, connection: &Connection) {
        let Some(mac) = connection
            .context
            .ethernet_context
            .as_ref()
            .map(|e| e.dst_mac.as_str())
            .filter(|m| !m.is_empty())
        else {
            return;
        };
        let Some(id) = env.config().association(&connection.id) else {
            tracing::debug!(connection = %connection.id, "No incoming interface for MAC address");
            return;
        };
        if let Some(interface) = env.config_mut().interface_mut(id) {
            interface.phys_address = Some(mac.to_string());
        }
    }
}

#[async_trait]
impl Handler for MacAssigner {
    fn name(&self) -> &str {
        "mac-address"
    }

    async fn establish(
        &self,
        env: &mut Env,
        request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        Self::assign(env, &request.connection);
        next.establish(env, request).await
    }

    async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        Self::assign(env, connection);
        next.teardown(env, connection).await
    }
}
