//! Shared test doubles for the in-crate tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime;

use crate::connection::{Connection, ConnectionId, Transport};
use crate::error::PoolError;
use crate::event_loop::{EventLoopHandle, EventLoopId};
use crate::request::{PoolRequest, RequestId};

/// An event loop handle backed by the current test runtime.
///
/// Every call mints a fresh id, so two handles from the same test behave
/// like two distinct loops as far as the pool is concerned.
pub(crate) fn test_event_loop() -> EventLoopHandle {
    EventLoopHandle::new(EventLoopId::next(), runtime::Handle::current())
}

pub(crate) struct TestRequest {
    id: RequestId,
    required: Option<EventLoopHandle>,
    preferred: EventLoopHandle,
    deadline: Instant,
    queued: AtomicBool,
    failure: Mutex<Option<PoolError>>,
}

impl TestRequest {
    pub(crate) fn general(preferred: &EventLoopHandle) -> Arc<Self> {
        Arc::new(Self {
            id: RequestId::next(),
            required: None,
            preferred: preferred.clone(),
            deadline: Instant::now() + Duration::from_secs(60),
            queued: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    pub(crate) fn bound(required: &EventLoopHandle) -> Arc<Self> {
        Arc::new(Self {
            id: RequestId::next(),
            required: Some(required.clone()),
            preferred: required.clone(),
            deadline: Instant::now() + Duration::from_secs(60),
            queued: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    pub(crate) fn was_queued(&self) -> bool {
        self.queued.load(Ordering::SeqCst)
    }

    pub(crate) fn failure(&self) -> Option<PoolError> {
        self.failure.lock().clone()
    }
}

impl PoolRequest for TestRequest {
    fn id(&self) -> RequestId {
        self.id
    }

    fn required_event_loop(&self) -> Option<EventLoopHandle> {
        self.required.clone()
    }

    fn preferred_event_loop(&self) -> EventLoopHandle {
        self.preferred.clone()
    }

    fn connection_deadline(&self) -> Instant {
        self.deadline
    }

    fn queued(&self) {
        self.queued.store(true, Ordering::SeqCst);
    }

    fn fail(&self, error: PoolError) {
        let mut failure = self.failure.lock();
        assert!(failure.is_none(), "request failed twice");
        *failure = Some(error);
    }
}

pub(crate) struct TestTransport {
    event_loop: EventLoopHandle,
    executed: Mutex<Vec<Arc<dyn PoolRequest>>>,
}

impl TestTransport {
    pub(crate) fn new(event_loop: &EventLoopHandle) -> Arc<Self> {
        Arc::new(Self {
            event_loop: event_loop.clone(),
            executed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn executed_ids(&self) -> Vec<RequestId> {
        self.executed.lock().iter().map(|r| r.id()).collect()
    }
}

impl Transport for TestTransport {
    fn event_loop(&self) -> EventLoopHandle {
        self.event_loop.clone()
    }

    fn execute(&self, request: Arc<dyn PoolRequest>) {
        self.executed.lock().push(request);
    }

    fn shutdown(&self) {}

    fn close(&self) {}
}

pub(crate) fn test_connection(
    id: ConnectionId,
    event_loop: &EventLoopHandle,
) -> (Connection, Arc<TestTransport>) {
    let transport = TestTransport::new(event_loop);
    (Connection::new(id, transport.clone()), transport)
}
