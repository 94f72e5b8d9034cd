//! Kernel routes derived from the connection's IP context.

use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use xconnect_types::{
    slots, Connection, ConnectionRequest, Env, IpContext, KernelRoute, Result, RouteScope,
    XconnectError,
};

use crate::handler::{Handler, Next};
use crate::mechanisms::kernel;

/// Adds routes toward the peer's prefixes when the incoming leg is a kernel
/// interface. Runs before delegating on both traversals so Teardown describes
/// the same routes Establish installed.
#[derive(Debug, Default)]
pub struct RouteReconciler;

impl RouteReconciler {
    /// Append the routes implied by `connection`'s IP context and return how
    /// many were added.
    ///
    /// Source routes go out the first kernel interface with the destination
    /// address as gateway. A link-scope route to the destination network is
    /// added on the server interface when that network is reachable only
    /// through it. Malformed addresses skip the link route and nothing else.
    pub fn reconcile(env: &mut Env, connection: &Connection) -> usize {
        let ip = connection.ip_context();
        let config = env.config();

        let mut seen: HashSet<String> = config
            .routes()
            .iter()
            .map(|r| r.dst_network.clone())
            .collect();
        let primary = config.kernel_interfaces().first().map(|k| k.name.clone());
        let target = env
            .slot(&slots::SERVER_INTERFACE)
            .and_then(|id| config.kernel_interface(*id))
            .map(|k| k.name.clone());

        let mut added = Vec::new();
        match primary {
            Some(primary) => {
                let gw_addr = gateway(&ip.dst_ip_addr);
                for route in &ip.src_routes {
                    if seen.insert(route.prefix.clone()) {
                        added.push(KernelRoute {
                            dst_network: route.prefix.clone(),
                            outgoing_interface: primary.clone(),
                            scope: RouteScope::Global,
                            gw_addr: gw_addr.clone(),
                        });
                    }
                }
            }
            None if !ip.src_routes.is_empty() => {
                tracing::debug!(
                    connection = %connection.id,
                    "No kernel interface staged; skipping source routes"
                );
            }
            None => {}
        }

        match link_route(ip, &seen, target) {
            Ok(Some(route)) => added.push(route),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(connection = %connection.id, error = %e, "Skipping link route")
            }
        }

        let count = added.len();
        for route in added {
            env.config_mut().add_route(route);
        }
        count
    }
}

/// The destination address without its prefix length, or the raw value if it
/// is not in `address/prefix` form.
fn gateway(dst_ip_addr: &str) -> Option<String> {
    if dst_ip_addr.is_empty() {
        return None;
    }
    match parse_cidr("dst_ip_addr", dst_ip_addr) {
        Ok(net) => Some(net.ip().to_string()),
        Err(_) => Some(dst_ip_addr.to_string()),
    }
}

fn link_route(
    ip: &IpContext,
    seen: &HashSet<String>,
    target: Option<String>,
) -> Result<Option<KernelRoute>> {
    let src = parse_cidr("src_ip_addr", &ip.src_ip_addr)?;
    let dst = parse_cidr("dst_ip_addr", &ip.dst_ip_addr)?;
    let dst_network = IpNetwork::new(dst.network(), dst.prefix())
        .map_err(|_| XconnectError::MalformedContext {
            field: "dst_ip_addr",
            value: ip.dst_ip_addr.clone(),
        })?
        .to_string();

    if seen.contains(&dst_network) || src.contains(dst.ip()) || !is_global_unicast(dst.ip()) {
        return Ok(None);
    }
    Ok(target.map(|outgoing_interface| KernelRoute {
        dst_network,
        outgoing_interface,
        scope: RouteScope::Link,
        gw_addr: None,
    }))
}

/// Parse an `address/prefix` string. A bare address is rejected.
pub fn parse_cidr(field: &'static str, value: &str) -> Result<IpNetwork> {
    let malformed = || XconnectError::MalformedContext {
        field,
        value: value.to_string(),
    };
    if !value.contains('/') {
        return Err(malformed());
    }
    value.parse::<IpNetwork>().map_err(|_| malformed())
}

/// Unicast outside loopback, link-local, multicast, broadcast and the
/// unspecified address. Private ranges count as global.
pub fn is_global_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || link_local)
        }
    }
}

fn is_kernel(connection: &Connection) -> bool {
    connection
        .mechanism
        .as_ref()
        .is_some_and(|m| m.is_type(kernel::MECHANISM))
}

#[async_trait]
impl Handler for RouteReconciler {
    fn name(&self) -> &str {
        "routes"
    }

    async fn establish(
        &self,
        env: &mut Env,
        request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        if is_kernel(&request.connection) {
            let added = Self::reconcile(env, &request.connection);
            tracing::debug!(connection = %request.id(), added, "Reconciled routes");
        }
        next.establish(env, request).await
    }

    async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        if is_kernel(connection) {
            Self::reconcile(env, connection);
        }
        next.teardown(env, connection).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
