//! Shared types, errors, staged configuration and environment for the xconnect forwarder.
//!
//! This crate provides the foundational types used across the other xconnect crates:
//! - `XconnectError`: unified error taxonomy
//! - `Connection` / `ConnectionRequest` / `Mechanism`: the negotiated connection model
//! - `StagedConfig`: per-traversal accumulator of device configuration
//! - `Env`: request-scoped environment with typed side-channel slots

pub mod config;
pub mod env;
pub mod model;

pub use config::{
    CommitOp, ConfigDocument, CrossConnect, Interface, InterfaceId, InterfaceLink,
    KernelInterface, KernelInterfaceId, KernelRoute, RouteScope, StagedConfig,
};
pub use env::{slots, Env, SlotKey, Traversal};
pub use model::{
    Connection, ConnectionContext, ConnectionRequest, EthernetContext, IpContext, IpRoute, Leg,
    Mechanism, MechanismClass,
};

/// Unified error type for the forwarder pipeline.
#[derive(Debug, thiserror::Error)]
pub enum XconnectError {
    // === Negotiation Errors ===
    #[error("No {leg} mechanism accepted for connection '{connection}' (offered: {offered:?})")]
    NegotiationFailure {
        leg: Leg,
        connection: String,
        offered: Vec<String>,
    },

    #[error("Invalid {mechanism} mechanism: {message}")]
    InvalidMechanism { mechanism: String, message: String },

    // === Context Errors ===
    #[error("Malformed {field} '{value}' in connection context")]
    MalformedContext { field: &'static str, value: String },

    // === Pipeline Errors ===
    #[error("Handler '{handler}' aborted the chain: {message}")]
    ChainAbort { handler: String, message: String },

    #[error("Commit ({op}) to device failed: {message}")]
    CommitFailure { op: CommitOp, message: String },

    // === Heal Errors ===
    #[error("No remembered request for connection '{id}'")]
    UnknownConnection { id: String },

    #[error("Heal target is not bound to a running endpoint")]
    HealUnavailable,

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl XconnectError {
    /// Returns `true` if the error came from the device rather than from the pipeline itself.
    pub fn is_commit_failure(&self) -> bool {
        matches!(self, XconnectError::CommitFailure { .. })
    }

    /// Returns `true` if no mechanism could be agreed for one of the legs.
    pub fn is_negotiation_failure(&self) -> bool {
        matches!(
            self,
            XconnectError::NegotiationFailure { .. } | XconnectError::InvalidMechanism { .. }
        )
    }
}

/// A convenience alias for `Result<T, XconnectError>`.
pub type Result<T> = std::result::Result<T, XconnectError>;
