//! Handler trait, dynamic dispatch wrapper, and the ordered handler chain.

use async_trait::async_trait;

use xconnect_types::{Connection, ConnectionRequest, Env, Result};

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// One element of a [`HandlerChain`].
///
/// A handler sees the whole remainder of the chain through `next` and decides
/// for itself whether to act before or after delegating. `teardown` must undo
/// what `establish` did using only what the connection carries.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short identifier used in logs and errors (e.g. "commit", "routes").
    fn name(&self) -> &str;

    async fn establish(
        &self,
        env: &mut Env,
        request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection>;

    async fn teardown(&self, env: &mut Env, connection: &Connection, next: Next<'_>)
        -> Result<()>;
}

// ---------------------------------------------------------------------------
// DynHandler (object-safe wrapper)
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn Handler>);

impl DynHandler {
    pub fn new(handler: impl Handler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn establish(
        &self,
        env: &mut Env,
        request: ConnectionRequest,
        next: Next<'_>,
    ) -> Result<Connection> {
        self.0.establish(env, request, next).await
    }

    pub async fn teardown(
        &self,
        env: &mut Env,
        connection: &Connection,
        next: Next<'_>,
    ) -> Result<()> {
        self.0.teardown(env, connection, next).await
    }
}

// ---------------------------------------------------------------------------
// Next: cursor over the rest of the chain
// ---------------------------------------------------------------------------

/// The handlers that follow the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [DynHandler],
}

impl<'a> Next<'a> {
    pub fn new(handlers: &'a [DynHandler]) -> Self {
        Self { rest: handlers }
    }

    /// Run the remaining handlers. An exhausted chain hands back the request's connection.
    pub async fn establish(self, env: &mut Env, request: ConnectionRequest) -> Result<Connection> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                tracing::debug!(handler = head.name(), connection = %request.id(), "establish");
                head.establish(env, request, Next { rest }).await
            }
            None => Ok(request.connection),
        }
    }

    pub async fn teardown(self, env: &mut Env, connection: &Connection) -> Result<()> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                tracing::debug!(handler = head.name(), connection = %connection.id, "teardown");
                head.teardown(env, connection, Next { rest }).await
            }
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerChain
// ---------------------------------------------------------------------------

/// Fixed, caller-ordered sequence of handlers traversed front to back for
/// both Establish and Teardown.
///
/// The chain never reorders, retries or parallelizes handlers. The first
/// error ends the traversal and is returned unchanged.
#[derive(Default)]
pub struct HandlerChain {
    handlers: Vec<DynHandler>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the end of the chain.
    pub fn with(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(DynHandler::new(handler));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub async fn establish(&self, env: &mut Env, request: ConnectionRequest) -> Result<Connection> {
        let id = request.id().to_string();
        let result = Next::new(&self.handlers).establish(env, request).await;
        if let Err(ref e) = result {
            tracing::warn!(connection = %id, error = %e, "Establish aborted");
        }
        result
    }

    pub async fn teardown(&self, env: &mut Env, connection: &Connection) -> Result<()> {
        let result = Next::new(&self.handlers).teardown(env, connection).await;
        if let Err(ref e) = result {
            tracing::warn!(connection = %connection.id, error = %e, "Teardown aborted");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use xconnect_types::{
        Interface, InterfaceLink, Traversal, XconnectError,
    };

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records entry and exit around delegation and stages one interface.
    struct Recording {
        name: &'static str,
        log: Log,
    }

    #[async_trait]
    impl Handler for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn establish(
            &self,
            env: &mut Env,
            request: ConnectionRequest,
            next: Next<'_>,
        ) -> Result<Connection> {
            self.log.lock().unwrap().push(format!("{}:pre", self.name));
            env.config_mut().add_interface(Interface::new(
                self.name,
                InterfaceLink::Tap {
                    host_if_name: self.name.into(),
                },
            ));
            let conn = next.establish(env, request).await?;
            self.log.lock().unwrap().push(format!("{}:post", self.name));
            Ok(conn)
        }

        async fn teardown(
            &self,
            env: &mut Env,
            connection: &Connection,
            next: Next<'_>,
        ) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:teardown", self.name));
            next.teardown(env, connection).await
        }
    }

    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn establish(
            &self,
            _env: &mut Env,
            _request: ConnectionRequest,
            _next: Next<'_>,
        ) -> Result<Connection> {
            Err(XconnectError::ChainAbort {
                handler: "failing".into(),
                message: "injected".into(),
            })
        }

        async fn teardown(
            &self,
            _env: &mut Env,
            _connection: &Connection,
            _next: Next<'_>,
        ) -> Result<()> {
            Err(XconnectError::ChainAbort {
                handler: "failing".into(),
                message: "injected".into(),
            })
        }
    }

    fn recording(name: &'static str, log: &Log) -> Recording {
        Recording {
            name,
            log: log.clone(),
        }
    }

    #[tokio::test]
    async fn empty_chain_returns_request_connection() {
        let chain = HandlerChain::new();
        let mut env = Env::new(Traversal::Establish);
        let conn = chain
            .establish(&mut env, ConnectionRequest::new(Connection::new("c1")))
            .await
            .unwrap();
        assert_eq!(conn.id, "c1");
        assert!(chain.teardown(&mut env, &conn).await.is_ok());
    }

    #[tokio::test]
    async fn handlers_run_in_order_and_unwind() {
        let log = Log::default();
        let chain = HandlerChain::new()
            .with(recording("a", &log))
            .with(recording("b", &log))
            .with(recording("c", &log));
        assert_eq!(chain.names(), vec!["a", "b", "c"]);

        let mut env = Env::new(Traversal::Establish);
        chain
            .establish(&mut env, ConnectionRequest::new(Connection::new("c1")))
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:pre", "b:pre", "c:pre", "c:post", "b:post", "a:post"]
        );
    }

    #[tokio::test]
    async fn teardown_uses_same_order() {
        let log = Log::default();
        let chain = HandlerChain::new()
            .with(recording("a", &log))
            .with(recording("b", &log));

        let mut env = Env::new(Traversal::Teardown);
        chain.teardown(&mut env, &Connection::new("c1")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a:teardown", "b:teardown"]);
    }

    #[tokio::test]
    async fn failure_stops_later_handlers() {
        let log = Log::default();
        let chain = HandlerChain::new()
            .with(recording("a", &log))
            .with(recording("b", &log))
            .with(Failing)
            .with(recording("d", &log));

        let mut env = Env::new(Traversal::Establish);
        let err = chain
            .establish(&mut env, ConnectionRequest::new(Connection::new("c1")))
            .await
            .unwrap_err();

        assert!(matches!(err, XconnectError::ChainAbort { ref handler, .. } if handler == "failing"));
        // "d" never ran and nothing unwound past the failure.
        assert_eq!(*log.lock().unwrap(), vec!["a:pre", "b:pre"]);
        // Only the handlers ahead of the failure touched the staged config.
        let names: Vec<_> = env.config().interfaces().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn teardown_failure_is_returned_verbatim() {
        let log = Log::default();
        let chain = HandlerChain::new()
            .with(recording("a", &log))
            .with(Failing)
            .with(recording("c", &log));

        let mut env = Env::new(Traversal::Teardown);
        let err = chain.teardown(&mut env, &Connection::new("c1")).await.unwrap_err();
        assert_eq!(err.to_string(), "Handler 'failing' aborted the chain: injected");
        assert_eq!(*log.lock().unwrap(), vec!["a:teardown"]);
    }
}
