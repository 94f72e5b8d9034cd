//! Request-scoped environment threaded through every handler of one traversal.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use crate::config::StagedConfig;

/// Which operation the current traversal performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Traversal {
    Establish,
    Teardown,
}

impl fmt::Display for Traversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Traversal::Establish => f.write_str("establish"),
            Traversal::Teardown => f.write_str("teardown"),
        }
    }
}

/// Typed key for a side-channel value published by one handler and read by
/// handlers that run later in the same traversal.
pub struct SlotKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SlotKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Well-known slots.
pub mod slots {
    use super::SlotKey;
    use crate::config::KernelInterfaceId;
    use crate::model::ConnectionRequest;

    /// Kernel-side interface created for the incoming leg.
    pub const SERVER_INTERFACE: SlotKey<KernelInterfaceId> = SlotKey::new("kernel.server_interface");

    /// Kernel-side interface created for the outgoing leg.
    pub const CLIENT_INTERFACE: SlotKey<KernelInterfaceId> = SlotKey::new("kernel.client_interface");

    /// The incoming request the outgoing leg is being built for.
    pub const INCOMING_REQUEST: SlotKey<ConnectionRequest> = SlotKey::new("connect.incoming_request");

    /// Request to replay if the outgoing leg goes down. Kept only once the
    /// whole traversal has succeeded.
    pub const HEAL_REQUEST: SlotKey<ConnectionRequest> = SlotKey::new("heal.request");
}

/// Environment for one Establish or Teardown traversal.
///
/// Owns the [`StagedConfig`] for the traversal plus any side-channel values.
/// Never shared across traversals.
pub struct Env {
    traversal: Traversal,
    config: StagedConfig,
    slots: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl Env {
    pub fn new(traversal: Traversal) -> Self {
        Self {
            traversal,
            config: StagedConfig::new(),
            slots: HashMap::new(),
        }
    }

    pub fn traversal(&self) -> Traversal {
        self.traversal
    }

    pub fn config(&self) -> &StagedConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut StagedConfig {
        &mut self.config
    }

    /// Publish `value` under `key`, replacing any earlier value.
    pub fn publish<T: Any + Send + Sync>(&mut self, key: &SlotKey<T>, value: T) {
        tracing::trace!(slot = key.name(), "Publishing slot");
        self.slots.insert(key.name(), Box::new(value));
    }

    pub fn slot<T: Any + Send + Sync>(&self, key: &SlotKey<T>) -> Option<&T> {
        self.slots.get(key.name()).and_then(|v| v.downcast_ref::<T>())
    }

    /// Remove and return the value under `key`. A value of another type stays put.
    pub fn take<T: Any + Send + Sync>(&mut self, key: &SlotKey<T>) -> Option<T> {
        if self.slot(key).is_none() {
            return None;
        }
        self.slots
            .remove(key.name())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("traversal", &self.traversal)
            .field("config", &self.config)
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}
