//! Kernel interface in a workload's network namespace, backed by a tap.

use async_trait::async_trait;

use xconnect_types::{
    slots, Connection, ConnectionRequest, Env, Interface, InterfaceLink, KernelInterface, Leg,
    Mechanism, MechanismClass, Result,
};

use super::{dataplane_name, kernel_name, MechanismHandler};

pub const MECHANISM: &str = "KERNEL";

/// Name of the interface inside the namespace.
pub const INTERFACE_NAME: &str = "name";

/// Namespace the interface is moved into.
pub const NETNS_URL: &str = "netnsURL";

#[derive(Debug, Default)]
pub struct Kernel;

#[async_trait]
impl MechanismHandler for Kernel {
    fn mechanism_type(&self) -> &str {
        MECHANISM
    }

    fn preference(&self, request: &ConnectionRequest) -> Mechanism {
        Mechanism::new(MechanismClass::Local, MECHANISM)
            .with_parameter(INTERFACE_NAME, kernel_name(request.id()))
    }

    fn complete(&self, connection_id: &str, mechanism: &mut Mechanism) -> Result<()> {
        mechanism
            .parameters
            .entry(INTERFACE_NAME.to_string())
            .or_insert_with(|| kernel_name(connection_id));
        Ok(())
    }

    async fn attach(&self, env: &mut Env, leg: Leg, connection: &Connection) -> Result<()> {
        let mechanism = connection.mechanism.as_ref();
        let name = mechanism
            .and_then(|m| m.parameter(INTERFACE_NAME))
            .map(str::to_string)
            .unwrap_or_else(|| kernel_name(&connection.id));
        let namespace = mechanism
            .and_then(|m| m.parameter(NETNS_URL))
            .map(str::to_string);

        let tap = Interface::new(
            dataplane_name(leg, "tap", &connection.id),
            InterfaceLink::Tap {
                host_if_name: name.clone(),
            },
        );
        let kernel = KernelInterface {
            name: name.clone(),
            host_if_name: name,
            namespace,
            ip_addresses: Vec::new(),
        };

        let config = env.config_mut();
        let id = config.add_interface(tap);
        config.associate(connection.id.clone(), id);
        let kernel_id = config.add_kernel_interface(kernel);

        let slot = match leg {
            Leg::Ingress => &slots::SERVER_INTERFACE,
            Leg::Egress => &slots::CLIENT_INTERFACE,
        };
        env.publish(slot, kernel_id);
        tracing::debug!(connection = %connection.id, %leg, "Staged kernel interface");
        Ok(())
    }
}
