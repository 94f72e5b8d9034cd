//! Connection model: requests, connections, mechanisms and connection context.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Mechanism
// ---------------------------------------------------------------------------

/// Whether a mechanism stays on the node or crosses the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MechanismClass {
    Local,
    Remote,
}

/// How one leg of a connection is physically realized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    pub cls: MechanismClass,
    #[serde(rename = "type")]
    pub mechanism_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Mechanism {
    pub fn new(cls: MechanismClass, mechanism_type: impl Into<String>) -> Self {
        Self {
            cls,
            mechanism_type: mechanism_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn is_type(&self, mechanism_type: &str) -> bool {
        self.mechanism_type == mechanism_type
    }
}

// ---------------------------------------------------------------------------
// Connection context
// ---------------------------------------------------------------------------

/// A route prefix advertised by one of the peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRoute {
    pub prefix: String,
}

impl IpRoute {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

/// Addressing for both endpoints. Addresses are `address/prefix` strings as
/// received from the peers and are only parsed where they are consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpContext {
    #[serde(default)]
    pub src_ip_addr: String,
    #[serde(default)]
    pub dst_ip_addr: String,
    #[serde(default)]
    pub src_routes: Vec<IpRoute>,
    #[serde(default)]
    pub dst_routes: Vec<IpRoute>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetContext {
    #[serde(default)]
    pub src_mac: String,
    #[serde(default)]
    pub dst_mac: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    #[serde(default)]
    pub ip_context: IpContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethernet_context: Option<EthernetContext>,
}

// ---------------------------------------------------------------------------
// Connection / ConnectionRequest
// ---------------------------------------------------------------------------

/// A connection as seen by one forwarder. The identifier is stable for the
/// whole lifetime: Establish, any number of heals, and the final Teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<Mechanism>,
    #[serde(default)]
    pub context: ConnectionContext,
    /// The outgoing leg established on behalf of this connection. Carried on
    /// the returned connection so Teardown can rebuild it without local state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream: Option<Box<Connection>>,
}

impl Connection {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mechanism: None,
            context: ConnectionContext::default(),
            downstream: None,
        }
    }

    pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }

    pub fn with_context(mut self, context: ConnectionContext) -> Self {
        self.context = context;
        self
    }

    pub fn ip_context(&self) -> &IpContext {
        &self.context.ip_context
    }

    /// The negotiated mechanism type, if any.
    pub fn mechanism_type(&self) -> Option<&str> {
        self.mechanism.as_ref().map(|m| m.mechanism_type.as_str())
    }
}

/// A request to establish (or re-establish) a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub connection: Connection,
    /// Ordered mechanisms the requester can use, consulted when the
    /// connection carries no mechanism yet.
    #[serde(default)]
    pub mechanism_preferences: Vec<Mechanism>,
}

impl ConnectionRequest {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            mechanism_preferences: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.connection.id
    }

    /// The proposals an ingress negotiator should consider, in order.
    pub fn proposals(&self) -> Vec<&Mechanism> {
        match self.connection.mechanism {
            Some(ref m) => vec![m],
            None => self.mechanism_preferences.iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Leg
// ---------------------------------------------------------------------------

/// Which side of a forwarded connection a handler is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Ingress,
    Egress,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Ingress => f.write_str("ingress"),
            Leg::Egress => f.write_str("egress"),
        }
    }
}
