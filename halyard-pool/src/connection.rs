//! Connection handles.
//!
//! The pool owns connections by id and drives them through the narrow
//! [`Transport`] capability set. The wire protocol lives entirely behind
//! that trait; this crate never sees bytes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::Result;
use crate::event_loop::EventLoopHandle;
use crate::request::PoolRequest;

/// Unique connection identifier.
pub type ConnectionId = u64;

/// The capability set the pool requires from a transport.
///
/// A transport lives on one event loop for its entire lifetime and reports
/// request completion and closure back to the pool that leased it.
pub trait Transport: Send + Sync + 'static {
    /// The event loop the transport is pinned to.
    fn event_loop(&self) -> EventLoopHandle;

    /// Run a request on this transport.
    ///
    /// The transport owns the request from here on, including delivering
    /// its response or failure.
    fn execute(&self, request: Arc<dyn PoolRequest>);

    /// Cancel any in-flight request and close.
    fn shutdown(&self);

    /// Close, assuming no request is in flight.
    fn close(&self);
}

/// Handle to a pooled connection.
///
/// Cloneable; equality and hashing use the id only.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
}

impl Connection {
    /// Wrap a transport under a pool-assigned id.
    pub fn new(id: ConnectionId, transport: Arc<dyn Transport>) -> Self {
        Self { id, transport }
    }

    /// The pool-assigned id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The event loop this connection is pinned to.
    pub fn event_loop(&self) -> EventLoopHandle {
        self.transport.event_loop()
    }

    /// Run a request on this connection.
    pub fn execute(&self, request: Arc<dyn PoolRequest>) {
        self.transport.execute(request)
    }

    /// Cancel any in-flight request and close.
    pub fn shutdown(&self) {
        self.transport.shutdown()
    }

    /// Close, assuming the connection is idle.
    pub fn close(&self) {
        self.transport.close()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("event_loop", &self.transport.event_loop().id())
            .finish()
    }
}

/// Dials and hands back established connections.
///
/// The factory is given the id the pool reserved for the attempt, the
/// event loop the connection must be pinned to, and an absolute deadline
/// for the whole attempt (TCP, TLS, protocol negotiation).
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Establish one connection.
    ///
    /// Implementations must return a [`Connection`] carrying exactly the
    /// given id and pinned to the given event loop.
    async fn make_connection(
        &self,
        id: ConnectionId,
        event_loop: EventLoopHandle,
        deadline: Instant,
    ) -> Result<Connection>;
}
