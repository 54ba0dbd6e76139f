//! The pool itself.
//!
//! Two locks, strictly layered: the state lock guards the state machine and
//! is never held across I/O, callbacks or timer scheduling; the timer lock
//! guards the three timer maps and is only ever held for a map insert or
//! remove. Every timer fire first claims its own map entry under the timer
//! lock and exits when the entry is already gone, so cancellation never has
//! to win a race against an in-flight fire.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionFactory, ConnectionId};
use crate::connections::CleanupContext;
use crate::event_loop::EventLoopHandle;
use crate::origin::Origin;
use crate::request::{PoolRequest, RequestId};
use crate::state_machine::{
    Action, ConnectionAction, PoolStateMachine, RequestAction, ShutdownNotice,
};

/// Observer of pool lifecycle events.
pub trait PoolDelegate: Send + Sync + 'static {
    /// The pool finished shutting down.
    ///
    /// Fires exactly once per pool. `unclean` is true when requests were
    /// still waiting or in flight when [`Pool::shutdown`] was called.
    fn pool_shutdown(&self, origin: &Origin, unclean: bool) {
        let _ = (origin, unclean);
    }
}

/// Delegate that ignores every event.
#[derive(Debug, Default)]
pub struct NoopDelegate;

impl PoolDelegate for NoopDelegate {}

/// Snapshot of pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connection attempts in flight.
    pub starting: usize,
    /// Failed attempts waiting for their backoff timer.
    pub backing_off: usize,
    /// Established connections parked without a request.
    pub idle: usize,
    /// Connections executing a request.
    pub leased: usize,
    /// Requests waiting for a connection.
    pub queued_requests: usize,
}

/// A connection pool for one origin.
///
/// Requests enter through [`execute_request`](Pool::execute_request);
/// transports report back through
/// [`connection_released`](Pool::connection_released) and
/// [`connection_closed`](Pool::connection_closed). The pool may be driven
/// from any thread.
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool for `origin` dialling through `factory`.
    pub fn new(origin: Origin, config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_delegate(origin, config, factory, Arc::new(NoopDelegate))
    }

    /// Create a pool with a lifecycle delegate.
    pub fn with_delegate(
        origin: Origin,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        delegate: Arc<dyn PoolDelegate>,
    ) -> Self {
        info!(
            %origin,
            max_connections = config.max_concurrent_connections,
            "connection pool created"
        );
        let machine = PoolStateMachine::new(config.max_concurrent_connections);
        Self {
            inner: Arc::new(PoolInner {
                origin,
                config,
                factory,
                delegate,
                state: Mutex::new(machine),
                timers: Mutex::new(TimerRegistry::default()),
            }),
        }
    }

    /// The origin this pool serves.
    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// Schedule a request: run it on an idle connection, queue it, and
    /// grow the pool when the dispatch rules call for it.
    pub fn execute_request(&self, request: Arc<dyn PoolRequest>) {
        self.inner.process(|machine| machine.execute_request(request));
    }

    /// Give up on a queued request.
    ///
    /// A request already handed to a connection is unaffected; cancelling
    /// it is the transport's business.
    pub fn cancel_request(&self, id: RequestId) {
        self.inner.process(|machine| machine.cancel_request(id));
    }

    /// A transport finished its request and can take another.
    pub fn connection_released(&self, id: ConnectionId) {
        self.inner.process(|machine| machine.connection_released(id));
    }

    /// A transport closed without the pool asking for it.
    pub fn connection_closed(&self, id: ConnectionId) {
        self.inner.process(|machine| machine.connection_closed(id));
    }

    /// Tear the pool down. Single-shot.
    ///
    /// Queued requests fail with
    /// [`PoolError::Cancelled`](crate::error::PoolError::Cancelled); leased
    /// connections are cancelled and closed. The delegate is notified once
    /// the last connection is gone.
    ///
    /// # Panics
    ///
    /// Panics when called more than once.
    pub fn shutdown(&self) {
        self.inner.process(|machine| machine.shutdown());
    }

    /// Snapshot the current pool state.
    pub fn stats(&self) -> PoolStats {
        let machine = self.inner.state.lock();
        let counts = machine.connection_counts();
        PoolStats {
            starting: counts.starting,
            backing_off: counts.backing_off,
            idle: counts.idle,
            leased: counts.leased,
            queued_requests: machine.queued_requests(),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("origin", &self.inner.origin)
            .finish()
    }
}

#[derive(Default)]
struct TimerRegistry {
    request_timeouts: HashMap<RequestId, JoinHandle<()>>,
    idle_timeouts: HashMap<ConnectionId, JoinHandle<()>>,
    backoffs: HashMap<ConnectionId, JoinHandle<()>>,
}

struct PoolInner {
    origin: Origin,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    delegate: Arc<dyn PoolDelegate>,
    state: Mutex<PoolStateMachine>,
    timers: Mutex<TimerRegistry>,
}

impl PoolInner {
    /// Run one event: advance the state machine under the state lock, then
    /// perform the returned actions with the lock released.
    fn process(self: &Arc<Self>, event: impl FnOnce(&mut PoolStateMachine) -> Action) {
        let action = {
            let mut machine = self.state.lock();
            event(&mut machine)
        };
        self.run_request_action(action.request);
        self.run_connection_action(action.connection);
    }

    fn run_request_action(self: &Arc<Self>, action: RequestAction) {
        match action {
            RequestAction::None => {}
            RequestAction::Execute {
                waiter,
                connection,
                cancel_timeout,
            } => {
                if cancel_timeout {
                    self.cancel_request_timeout(waiter.id());
                }
                debug!(request = %waiter.id(), connection = connection.id(), "executing request");
                connection.execute(waiter.into_request());
            }
            RequestAction::Fail {
                waiter,
                error,
                cancel_timeout,
            } => {
                if cancel_timeout {
                    self.cancel_request_timeout(waiter.id());
                }
                debug!(request = %waiter.id(), %error, "failing request");
                waiter.into_request().fail(error);
            }
            RequestAction::FailAll { waiters, error } => {
                for waiter in waiters {
                    self.cancel_request_timeout(waiter.id());
                    waiter.into_request().fail(error.clone());
                }
            }
            RequestAction::ScheduleTimeout {
                request,
                event_loop,
            } => {
                self.schedule_request_timeout(&request, &event_loop);
                request.queued();
            }
            RequestAction::CancelTimeout { request_id } => {
                self.cancel_request_timeout(request_id);
            }
        }
    }

    fn run_connection_action(self: &Arc<Self>, action: ConnectionAction) {
        match action {
            ConnectionAction::None => {}
            ConnectionAction::Create { id, event_loop } => {
                self.create_connection(id, event_loop);
            }
            ConnectionAction::ScheduleBackoff {
                id,
                backoff,
                event_loop,
            } => {
                let weak = Arc::downgrade(self);
                let mut timers = self.timers.lock();
                let task = event_loop.spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let Some(inner) = weak.upgrade() else { return };
                    if inner.timers.lock().backoffs.remove(&id).is_none() {
                        return;
                    }
                    inner.process(|machine| machine.connection_creation_backoff_done(id));
                });
                timers.backoffs.insert(id, task);
            }
            ConnectionAction::ScheduleIdleTimeout { id, event_loop } => {
                let idle_timeout = self.config.idle_timeout;
                let weak = Arc::downgrade(self);
                let mut timers = self.timers.lock();
                let task = event_loop.spawn(async move {
                    tokio::time::sleep(idle_timeout).await;
                    let Some(inner) = weak.upgrade() else { return };
                    if inner.timers.lock().idle_timeouts.remove(&id).is_none() {
                        return;
                    }
                    inner.process(|machine| machine.connection_idle_timeout(id));
                });
                timers.idle_timeouts.insert(id, task);
            }
            ConnectionAction::CancelIdleTimeout { id } => {
                let task = self.timers.lock().idle_timeouts.remove(&id);
                if let Some(task) = task {
                    task.abort();
                }
            }
            ConnectionAction::Close {
                connection,
                shutdown,
            } => {
                debug!(connection = connection.id(), "closing connection");
                connection.close();
                self.notify_shutdown(shutdown);
            }
            ConnectionAction::Cleanup { context, shutdown } => {
                self.cleanup_connections(context, shutdown);
            }
        }
    }

    /// Hand a reserved id to the factory; its outcome re-enters the state
    /// machine as established or failed.
    fn create_connection(self: &Arc<Self>, id: ConnectionId, event_loop: EventLoopHandle) {
        debug!(connection = id, event_loop = %event_loop.id(), "starting connection attempt");
        let factory = Arc::clone(&self.factory);
        let deadline = Instant::now() + self.config.connect_timeout;
        let weak = Arc::downgrade(self);
        let dial_loop = event_loop.clone();
        event_loop.spawn(async move {
            let result = factory.make_connection(id, dial_loop, deadline).await;
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(connection) => {
                    debug_assert_eq!(
                        connection.id(),
                        id,
                        "factory returned a connection under the wrong id"
                    );
                    inner.process(|machine| machine.new_connection_established(connection));
                }
                Err(error) => {
                    inner.process(|machine| machine.failed_to_create_connection(id, error));
                }
            }
        });
    }

    fn schedule_request_timeout(
        self: &Arc<Self>,
        request: &Arc<dyn PoolRequest>,
        event_loop: &EventLoopHandle,
    ) {
        let id = request.id();
        let deadline = request.connection_deadline();
        let weak = Arc::downgrade(self);
        let mut timers = self.timers.lock();
        let task = event_loop.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.timers.lock().request_timeouts.remove(&id).is_none() {
                return;
            }
            inner.process(|machine| machine.timeout_request(id));
        });
        timers.request_timeouts.insert(id, task);
    }

    fn cancel_request_timeout(&self, id: RequestId) {
        let task = self.timers.lock().request_timeouts.remove(&id);
        if let Some(task) = task {
            task.abort();
        }
    }

    fn cancel_backoff_timer(&self, id: ConnectionId) {
        let task = self.timers.lock().backoffs.remove(&id);
        if let Some(task) = task {
            task.abort();
        }
    }

    fn cleanup_connections(&self, context: CleanupContext, shutdown: ShutdownNotice) {
        for connection in context.close {
            connection.close();
        }
        for connection in context.cancel {
            connection.shutdown();
        }
        for id in context.connect_backoff {
            self.cancel_backoff_timer(id);
        }
        self.notify_shutdown(shutdown);
    }

    fn notify_shutdown(&self, shutdown: ShutdownNotice) {
        if let ShutdownNotice::Yes { unclean } = shutdown {
            if unclean {
                warn!(origin = %self.origin, "pool shut down with work outstanding");
            } else {
                info!(origin = %self.origin, "pool shut down");
            }
            self.delegate.pool_shutdown(&self.origin, unclean);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut();
        for (_, task) in timers.request_timeouts.drain() {
            task.abort();
        }
        for (_, task) in timers.idle_timeouts.drain() {
            task.abort();
        }
        for (_, task) in timers.backoffs.drain() {
            task.abort();
        }
    }
}
