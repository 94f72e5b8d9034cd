//! Handler chain, mechanism negotiation, route reconciliation and commit.
//!
//! This crate assembles a cross-connect forwarder out of small handlers:
//! - `HandlerChain`: ordered handlers traversed identically for Establish and Teardown
//! - `IngressNegotiator` / `EgressNegotiator`: mechanism selection for both legs
//! - `RouteReconciler`: kernel routes derived from the connection's IP context
//! - `CommitStage`: the single device commit at the end of each traversal
//! - `Endpoint` / `Healer`: per-connection serialization and self-healing

pub mod address;
pub mod commit;
pub mod connect;
pub mod device;
pub mod endpoint;
pub mod forwarder;
pub mod handler;
pub mod heal;
pub mod mechanisms;
pub mod routes;
pub mod xconnect;

pub use address::{AddressAssigner, MacAssigner};
pub use commit::CommitStage;
pub use connect::{outgoing_id, ConnectStage, Downstream, DownstreamStage, LocalDownstream};
pub use device::{Device, DeviceError, HttpDevice, RecordingDevice};
pub use endpoint::{ConnectionGuard, ConnectionLocks, Endpoint};
pub use forwarder::{Forwarder, ForwarderConfig};
pub use handler::{DynHandler, Handler, HandlerChain, Next};
pub use heal::{Establisher, ForwardRef, Healer, LegDown};
pub use mechanisms::{
    EgressNegotiator, IngressNegotiator, Kernel, MechanismHandler, Memif, PreferenceList, Vxlan,
};
pub use routes::{is_global_unicast, parse_cidr, RouteReconciler};
pub use xconnect::CrossConnectStage;
