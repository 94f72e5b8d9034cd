//! Staged device configuration and the document committed to the device.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Configuration fragments
// ---------------------------------------------------------------------------

/// Link-level details of a dataplane interface, one variant per mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterfaceLink {
    Memif {
        socket_filename: PathBuf,
        master: bool,
    },
    Tap {
        host_if_name: String,
    },
    Vxlan {
        src_address: String,
        dst_address: String,
        vni: u32,
    },
}

/// An interface on the dataplane side of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub enabled: bool,
    pub link: InterfaceLink,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phys_address: Option<String>,
}

impl Interface {
    pub fn new(name: impl Into<String>, link: InterfaceLink) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            link,
            ip_addresses: Vec::new(),
            phys_address: None,
        }
    }
}

/// The kernel-side end of a dataplane interface, living in a network namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInterface {
    pub name: String,
    pub host_if_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteScope {
    Global,
    Link,
}

/// A route installed in a kernel network namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRoute {
    pub dst_network: String,
    pub outgoing_interface: String,
    pub scope: RouteScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw_addr: Option<String>,
}

/// One direction of an L2 splice between two dataplane interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossConnect {
    pub receive_interface: String,
    pub transmit_interface: String,
}

/// Position of a dataplane interface in a [`StagedConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId(usize);

/// Position of a kernel interface in a [`StagedConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelInterfaceId(usize);

// ---------------------------------------------------------------------------
// StagedConfig
// ---------------------------------------------------------------------------

/// Per-traversal accumulator of device configuration.
///
/// Every sequence is append-only and keeps insertion order. Handlers refer
/// back to what they registered through the returned ids or the connection
/// lookup, never by searching the sequences by value.
#[derive(Debug, Clone, Default)]
pub struct StagedConfig {
    interfaces: Vec<Interface>,
    kernel_interfaces: Vec<KernelInterface>,
    routes: Vec<KernelRoute>,
    cross_connects: Vec<CrossConnect>,
    associations: HashMap<String, InterfaceId>,
    committed: bool,
}

impl StagedConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interface(&mut self, interface: Interface) -> InterfaceId {
        self.interfaces.push(interface);
        InterfaceId(self.interfaces.len() - 1)
    }

    pub fn add_kernel_interface(&mut self, interface: KernelInterface) -> KernelInterfaceId {
        self.kernel_interfaces.push(interface);
        KernelInterfaceId(self.kernel_interfaces.len() - 1)
    }

    pub fn add_route(&mut self, route: KernelRoute) {
        self.routes.push(route);
    }

    pub fn add_cross_connect(&mut self, cross_connect: CrossConnect) {
        self.cross_connects.push(cross_connect);
    }

    /// Record `id` as the interface most recently registered for `connection_id`.
    pub fn associate(&mut self, connection_id: impl Into<String>, id: InterfaceId) {
        self.associations.insert(connection_id.into(), id);
    }

    /// The interface most recently associated with `connection_id`.
    pub fn interface_for(&self, connection_id: &str) -> Option<&Interface> {
        self.associations
            .get(connection_id)
            .and_then(|id| self.interfaces.get(id.0))
    }

    pub fn association(&self, connection_id: &str) -> Option<InterfaceId> {
        self.associations.get(connection_id).copied()
    }

    pub fn interface(&self, id: InterfaceId) -> Option<&Interface> {
        self.interfaces.get(id.0)
    }

    pub fn interface_mut(&mut self, id: InterfaceId) -> Option<&mut Interface> {
        self.interfaces.get_mut(id.0)
    }

    pub fn kernel_interface(&self, id: KernelInterfaceId) -> Option<&KernelInterface> {
        self.kernel_interfaces.get(id.0)
    }

    pub fn kernel_interface_mut(&mut self, id: KernelInterfaceId) -> Option<&mut KernelInterface> {
        self.kernel_interfaces.get_mut(id.0)
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn kernel_interfaces(&self) -> &[KernelInterface] {
        &self.kernel_interfaces
    }

    pub fn routes(&self) -> &[KernelRoute] {
        &self.routes
    }

    pub fn cross_connects(&self) -> &[CrossConnect] {
        &self.cross_connects
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
            && self.kernel_interfaces.is_empty()
            && self.routes.is_empty()
            && self.cross_connects.is_empty()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Seal the staged configuration for its single commit.
    ///
    /// Returns the document to send, or `None` if it was already taken.
    pub fn take_for_commit(&mut self) -> Option<ConfigDocument> {
        if self.committed {
            return None;
        }
        self.committed = true;
        Some(self.to_document())
    }

    /// Snapshot the staged sequences as a device document.
    pub fn to_document(&self) -> ConfigDocument {
        ConfigDocument {
            interfaces: self.interfaces.clone(),
            kernel_interfaces: self.kernel_interfaces.clone(),
            routes: self.routes.clone(),
            cross_connects: self.cross_connects.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigDocument / CommitOp
// ---------------------------------------------------------------------------

/// The finished configuration sent to the device in one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub kernel_interfaces: Vec<KernelInterface>,
    #[serde(default)]
    pub routes: Vec<KernelRoute>,
    #[serde(default)]
    pub cross_connects: Vec<CrossConnect>,
}

/// What the device should do with a committed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOp {
    /// Make the listed items present (Establish).
    Update,
    /// Remove exactly the listed items (Teardown).
    Delete,
}

impl fmt::Display for CommitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitOp::Update => f.write_str("update"),
            CommitOp::Delete => f.write_str("delete"),
        }
    }
}
