//! Requests as the pool sees them.
//!
//! The pool never looks inside a request. It reads the identity, routing
//! and deadline accessors, notifies the request when it is queued, and
//! either hands it to a connection or fails it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::PoolError;
use crate::event_loop::{EventLoopHandle, EventLoopId};

/// Global request ID counter.
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Mint the next process-unique id.
    ///
    /// Implementations of [`PoolRequest`] mint one id at construction and
    /// return it from [`PoolRequest::id`] for the request's whole lifetime.
    pub fn next() -> Self {
        Self(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request that can be scheduled on the pool.
///
/// Implemented by the client layer above this crate. All accessors must
/// return stable values for the lifetime of the request.
pub trait PoolRequest: Send + Sync + 'static {
    /// Stable identity of this request.
    fn id(&self) -> RequestId;

    /// The event loop this request must execute on, if any.
    ///
    /// A request with a required loop is only ever dispatched to a
    /// connection bound to that loop.
    fn required_event_loop(&self) -> Option<EventLoopHandle>;

    /// The event loop this request would prefer, used to pick among idle
    /// connections and to place new connections.
    fn preferred_event_loop(&self) -> EventLoopHandle;

    /// Absolute deadline for obtaining a connection.
    fn connection_deadline(&self) -> Instant;

    /// Called once when the request is parked in the wait queue.
    fn queued(&self) {}

    /// Deliver a failure. Called at most once, and never after the request
    /// has been handed to a connection.
    fn fail(&self, error: PoolError);
}

/// A queued request plus the routing snapshot the pool keys it by.
///
/// The waiter owns the request but the scheduling logic only consumes the
/// snapshot; the request itself is touched again only when it is handed to
/// a connection or failed.
pub(crate) struct Waiter {
    request: Arc<dyn PoolRequest>,
    required_event_loop: Option<EventLoopId>,
}

impl Waiter {
    pub(crate) fn new(request: Arc<dyn PoolRequest>) -> Self {
        let required_event_loop = request.required_event_loop().map(|l| l.id());
        Self {
            request,
            required_event_loop,
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.request.id()
    }

    pub(crate) fn required_event_loop(&self) -> Option<EventLoopId> {
        self.required_event_loop
    }

    /// Hand the request back out for execution or failure.
    pub(crate) fn into_request(self) -> Arc<dyn PoolRequest> {
        self.request
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("id", &self.id())
            .field("required_event_loop", &self.required_event_loop)
            .finish()
    }
}
