//! Entry point that runs traversals of one chain, one at a time per connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use xconnect_types::{
    slots, Connection, ConnectionRequest, Env, Result, Traversal, XconnectError,
};

use crate::handler::HandlerChain;
use crate::heal::{Establisher, Healer};

// ---------------------------------------------------------------------------
// ConnectionLocks
// ---------------------------------------------------------------------------

/// Per-connection-id async locks. Entries exist only while someone holds or
/// waits for them.
#[derive(Default)]
pub struct ConnectionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other traversal holds `connection_id`.
    pub async fn acquire(&self, connection_id: &str) -> ConnectionGuard<'_> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(connection_id.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        ConnectionGuard {
            locks: self,
            connection_id: connection_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of connection ids currently held or waited on.
    pub fn active(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct ConnectionGuard<'a> {
    locks: &'a ConnectionLocks,
    connection_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self
            .locks
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Waiters hold a clone of the Arc, so a count of one means nobody is queued.
        if map
            .get(&self.connection_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.connection_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A named chain plus per-connection serialization. Each call gets a fresh
/// environment and staged configuration.
///
/// With a healer attached, a connection is remembered for healing only after
/// its Establish succeeded end to end, and forgotten as soon as its Teardown
/// holds the connection's lock.
pub struct Endpoint {
    name: String,
    chain: HandlerChain,
    locks: ConnectionLocks,
    healer: Option<Arc<Healer>>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, chain: HandlerChain) -> Self {
        Self {
            name: name.into(),
            chain,
            locks: ConnectionLocks::new(),
            healer: None,
        }
    }

    pub fn with_healer(mut self, healer: Arc<Healer>) -> Self {
        self.healer = Some(healer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    pub fn locks(&self) -> &ConnectionLocks {
        &self.locks
    }

    pub async fn establish(&self, request: ConnectionRequest) -> Result<Connection> {
        let _guard = self.locks.acquire(request.id()).await;
        self.establish_locked(request).await
    }

    /// Replay the remembered request for `connection_id`. Returns
    /// `UnknownConnection` if a Teardown got the lock first.
    pub async fn heal(&self, connection_id: &str) -> Result<Connection> {
        let healer = self.healer.as_ref().ok_or(XconnectError::HealUnavailable)?;
        let _guard = self.locks.acquire(connection_id).await;
        let request = healer.recall(connection_id).await.ok_or_else(|| {
            XconnectError::UnknownConnection {
                id: connection_id.to_string(),
            }
        })?;
        tracing::info!(endpoint = %self.name, connection = %connection_id, "Replaying request");
        self.establish_locked(request).await
    }

    async fn establish_locked(&self, request: ConnectionRequest) -> Result<Connection> {
        let id = request.id().to_string();
        tracing::info!(endpoint = %self.name, connection = %id, "Establishing connection");

        let mut env = Env::new(Traversal::Establish);
        let connection = self.chain.establish(&mut env, request).await?;

        if let (Some(healer), Some(heal_request)) =
            (&self.healer, env.take(&slots::HEAL_REQUEST))
        {
            healer.remember(heal_request).await;
        }
        tracing::info!(
            endpoint = %self.name,
            connection = %id,
            mechanism = connection.mechanism_type().unwrap_or("none"),
            "Connection established"
        );
        Ok(connection)
    }

    pub async fn teardown(&self, connection: &Connection) -> Result<()> {
        let _guard = self.locks.acquire(&connection.id).await;
        tracing::info!(endpoint = %self.name, connection = %connection.id, "Tearing down connection");
        if let Some(healer) = &self.healer {
            healer.forget(&connection.id).await;
        }

        let mut env = Env::new(Traversal::Teardown);
        self.chain.teardown(&mut env, connection).await?;

        tracing::info!(endpoint = %self.name, connection = %connection.id, "Connection closed");
        Ok(())
    }
}

#[async_trait]
impl Establisher for Endpoint {
    async fn establish(&self, request: ConnectionRequest) -> Result<Connection> {
        Endpoint::establish(self, request).await
    }

    async fn heal(&self, connection_id: &str) -> Result<Connection> {
        Endpoint::heal(self, connection_id).await
    }
}
