//! VXLAN tunnel between two forwarders.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use xconnect_types::{
    Connection, ConnectionRequest, Env, Interface, InterfaceLink, Leg, Mechanism, MechanismClass,
    Result, XconnectError,
};

use super::{dataplane_name, MechanismHandler};

pub const MECHANISM: &str = "VXLAN";
pub const SRC_IP: &str = "src_ip";
pub const DST_IP: &str = "dst_ip";
pub const VNI: &str = "vni";

/// VNIs are 24 bits wide.
const MAX_VNI: u32 = 0x00FF_FFFF;

pub struct Vxlan {
    tunnel_ip: IpAddr,
    next_vni: AtomicU32,
}

impl Vxlan {
    pub fn new(tunnel_ip: IpAddr) -> Self {
        Self {
            tunnel_ip,
            next_vni: AtomicU32::new(0),
        }
    }

    fn allocate_vni(&self) -> u32 {
        self.next_vni.fetch_add(1, Ordering::Relaxed) % MAX_VNI + 1
    }
}

fn invalid(message: impl Into<String>) -> XconnectError {
    XconnectError::InvalidMechanism {
        mechanism: MECHANISM.into(),
        message: message.into(),
    }
}

fn required<'a>(mechanism: &'a Mechanism, key: &str) -> Result<&'a str> {
    mechanism
        .parameter(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid(format!("missing {key}")))
}

fn address(mechanism: &Mechanism, key: &str) -> Result<IpAddr> {
    let raw = required(mechanism, key)?;
    raw.parse()
        .map_err(|_| invalid(format!("{key} '{raw}' is not an IP address")))
}

#[async_trait]
impl MechanismHandler for Vxlan {
    fn mechanism_type(&self) -> &str {
        MECHANISM
    }

    fn preference(&self, _request: &ConnectionRequest) -> Mechanism {
        Mechanism::new(MechanismClass::Remote, MECHANISM)
            .with_parameter(SRC_IP, self.tunnel_ip.to_string())
    }

    fn complete(&self, _connection_id: &str, mechanism: &mut Mechanism) -> Result<()> {
        address(mechanism, SRC_IP)?;
        mechanism
            .parameters
            .insert(DST_IP.to_string(), self.tunnel_ip.to_string());
        if mechanism.parameter(VNI).is_none() {
            let vni = self.allocate_vni();
            mechanism.parameters.insert(VNI.to_string(), vni.to_string());
        }
        Ok(())
    }

    async fn attach(&self, env: &mut Env, leg: Leg, connection: &Connection) -> Result<()> {
        let mechanism = connection
            .mechanism
            .as_ref()
            .ok_or_else(|| invalid(format!("connection '{}' carries no mechanism", connection.id)))?;
        let src = address(mechanism, SRC_IP)?;
        let dst = address(mechanism, DST_IP)?;
        let vni_raw = required(mechanism, VNI)?;
        let vni: u32 = vni_raw
            .parse()
            .ok()
            .filter(|v| (1..=MAX_VNI).contains(v))
            .ok_or_else(|| invalid(format!("vni '{vni_raw}' out of range")))?;

        // src/dst are named from the requester's point of view.
        let (local, remote) = match leg {
            Leg::Ingress => (dst, src),
            Leg::Egress => (src, dst),
        };

        let id = env.config_mut().add_interface(Interface::new(
            dataplane_name(leg, "vxlan", &connection.id),
            InterfaceLink::Vxlan {
                src_address: local.to_string(),
                dst_address: remote.to_string(),
                vni,
            },
        ));
        env.config_mut().associate(connection.id.clone(), id);
        tracing::debug!(connection = %connection.id, %leg, vni, "Staged vxlan interface");
        Ok(())
    }
}
