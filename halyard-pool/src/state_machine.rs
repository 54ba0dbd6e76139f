//! The scheduling state machine.
//!
//! Every externally driven event enters through one method, mutates the
//! connection set and the wait queue, and returns an [`Action`] describing
//! the side effects to perform. No I/O, timer call or callback happens in
//! here; the executor performs the returned actions after releasing its
//! lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::backoff::connection_creation_backoff;
use crate::connection::{Connection, ConnectionId};
use crate::connections::{
    CleanupContext, ConnectionCounts, ConnectionSet, ConnectionUse, FailedConnectionContext,
    IdleConnectionContext,
};
use crate::error::PoolError;
use crate::event_loop::EventLoopHandle;
use crate::queue::RequestQueue;
use crate::request::{PoolRequest, RequestId, Waiter};

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Running,
    ShuttingDown { unclean: bool },
    ShutDown,
}

/// Whether an action completes the pool shutdown, and how it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownNotice {
    No,
    Yes { unclean: bool },
}

/// Side effects to perform on the request side of an event.
pub(crate) enum RequestAction {
    None,
    /// Hand the request to the connection, cancelling its timeout timer
    /// first when it was queued.
    Execute {
        waiter: Waiter,
        connection: Connection,
        cancel_timeout: bool,
    },
    /// Deliver a failure, cancelling the timeout timer first when armed.
    Fail {
        waiter: Waiter,
        error: PoolError,
        cancel_timeout: bool,
    },
    /// Deliver the same failure to every waiter and cancel all their
    /// timeout timers.
    FailAll {
        waiters: Vec<Waiter>,
        error: PoolError,
    },
    /// Arm the request timeout timer and notify the request that it was
    /// queued.
    ScheduleTimeout {
        request: Arc<dyn PoolRequest>,
        event_loop: EventLoopHandle,
    },
    /// Disarm the request timeout timer.
    CancelTimeout { request_id: RequestId },
}

impl fmt::Debug for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Execute {
                waiter,
                connection,
                cancel_timeout,
            } => f
                .debug_struct("Execute")
                .field("request", &waiter.id())
                .field("connection", &connection.id())
                .field("cancel_timeout", cancel_timeout)
                .finish(),
            Self::Fail {
                waiter,
                error,
                cancel_timeout,
            } => f
                .debug_struct("Fail")
                .field("request", &waiter.id())
                .field("error", error)
                .field("cancel_timeout", cancel_timeout)
                .finish(),
            Self::FailAll { waiters, error } => f
                .debug_struct("FailAll")
                .field("requests", &waiters.iter().map(Waiter::id).collect::<Vec<_>>())
                .field("error", error)
                .finish(),
            Self::ScheduleTimeout { request, event_loop } => f
                .debug_struct("ScheduleTimeout")
                .field("request", &request.id())
                .field("event_loop", &event_loop.id())
                .finish(),
            Self::CancelTimeout { request_id } => f
                .debug_struct("CancelTimeout")
                .field("request", request_id)
                .finish(),
        }
    }
}

/// Side effects to perform on the connection side of an event.
#[derive(Debug)]
pub(crate) enum ConnectionAction {
    None,
    /// Start a connection attempt for the reserved id on the loop.
    Create {
        id: ConnectionId,
        event_loop: EventLoopHandle,
    },
    /// Arm the backoff timer for a failed connection attempt.
    ScheduleBackoff {
        id: ConnectionId,
        backoff: Duration,
        event_loop: EventLoopHandle,
    },
    /// Arm the idle timer for a parked connection.
    ScheduleIdleTimeout {
        id: ConnectionId,
        event_loop: EventLoopHandle,
    },
    /// Disarm the idle timer for a connection that got leased.
    CancelIdleTimeout { id: ConnectionId },
    /// Close the connection; notify the delegate if this completed a
    /// shutdown.
    Close {
        connection: Connection,
        shutdown: ShutdownNotice,
    },
    /// Act on the groups collected at shutdown; notify the delegate if the
    /// pool is already fully drained.
    Cleanup {
        context: CleanupContext,
        shutdown: ShutdownNotice,
    },
}

/// The full decision for one event.
#[derive(Debug)]
pub(crate) struct Action {
    pub(crate) request: RequestAction,
    pub(crate) connection: ConnectionAction,
}

impl Action {
    fn none() -> Self {
        Self {
            request: RequestAction::None,
            connection: ConnectionAction::None,
        }
    }

    fn request(request: RequestAction) -> Self {
        Self {
            request,
            connection: ConnectionAction::None,
        }
    }

    fn connection(connection: ConnectionAction) -> Self {
        Self {
            request: RequestAction::None,
            connection,
        }
    }
}

pub(crate) struct PoolStateMachine {
    connections: ConnectionSet,
    requests: RequestQueue,
    state: PoolState,
    failed_consecutive_connection_attempts: u32,
    last_connect_failure: Option<PoolError>,
}

impl PoolStateMachine {
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            connections: ConnectionSet::new(max_connections),
            requests: RequestQueue::new(),
            state: PoolState::Running,
            failed_consecutive_connection_attempts: 0,
            last_connect_failure: None,
        }
    }

    /// A new request wants a connection.
    pub(crate) fn execute_request(&mut self, request: Arc<dyn PoolRequest>) -> Action {
        if self.state != PoolState::Running {
            return Action::request(RequestAction::Fail {
                waiter: Waiter::new(request),
                error: PoolError::AlreadyShutdown,
                cancel_timeout: false,
            });
        }

        match request.required_event_loop() {
            Some(required) => self.execute_request_on_required_loop(request, required),
            None => self.execute_request_on_preferred_loop(request),
        }
    }

    fn execute_request_on_required_loop(
        &mut self,
        request: Arc<dyn PoolRequest>,
        required: EventLoopHandle,
    ) -> Action {
        if let Some(connection) = self.connections.lease_connection_on_required(required.id()) {
            let cancel = ConnectionAction::CancelIdleTimeout {
                id: connection.id(),
            };
            return Action {
                request: RequestAction::Execute {
                    waiter: Waiter::new(request),
                    connection,
                    cancel_timeout: false,
                },
                connection: cancel,
            };
        }

        self.requests.push(Waiter::new(request.clone()));
        let request_action = RequestAction::ScheduleTimeout {
            request,
            event_loop: required.clone(),
        };

        let starting = self.connections.starting_event_loop_connections(required.id());
        let waiting = self.requests.count_for(required.id());
        let connection_action = if starting < waiting {
            let id = self.connections.create_new_overflow_connection(&required);
            trace!(connection = id, event_loop = %required.id(), "starting overflow connection");
            ConnectionAction::Create {
                id,
                event_loop: required,
            }
        } else {
            ConnectionAction::None
        };

        Action {
            request: request_action,
            connection: connection_action,
        }
    }

    fn execute_request_on_preferred_loop(&mut self, request: Arc<dyn PoolRequest>) -> Action {
        let preferred = request.preferred_event_loop();
        if let Some(connection) = self.connections.lease_connection_on_preferred(preferred.id()) {
            let cancel = ConnectionAction::CancelIdleTimeout {
                id: connection.id(),
            };
            return Action {
                request: RequestAction::Execute {
                    waiter: Waiter::new(request),
                    connection,
                    cancel_timeout: false,
                },
                connection: cancel,
            };
        }

        self.requests.push(Waiter::new(request.clone()));
        let request_action = RequestAction::ScheduleTimeout {
            request,
            event_loop: preferred.clone(),
        };

        // The comparison runs after the enqueue: a start is only issued
        // while fewer dials are in flight than waiters could consume.
        let connection_action = if !self.connections.can_grow() {
            ConnectionAction::None
        } else if self.connections.starting_general_purpose_connections()
            >= self.requests.general_purpose_count()
        {
            ConnectionAction::None
        } else {
            let id = self.connections.create_new_connection(&preferred);
            trace!(connection = id, event_loop = %preferred.id(), "starting new connection");
            ConnectionAction::Create {
                id,
                event_loop: preferred,
            }
        };

        Action {
            request: request_action,
            connection: connection_action,
        }
    }

    /// A pending dial succeeded.
    pub(crate) fn new_connection_established(&mut self, connection: Connection) -> Action {
        self.failed_consecutive_connection_attempts = 0;
        self.last_connect_failure = None;
        let (index, context) = self.connections.new_connection_established(connection);
        self.next_action_for_idle_connection(index, context)
    }

    /// A pending dial failed.
    pub(crate) fn failed_to_create_connection(
        &mut self,
        id: ConnectionId,
        error: PoolError,
    ) -> Action {
        self.failed_consecutive_connection_attempts += 1;
        self.last_connect_failure = Some(error);

        match self.state {
            PoolState::Running => {
                let event_loop = self.connections.backoff_next_connection_attempt(id);
                let backoff =
                    connection_creation_backoff(self.failed_consecutive_connection_attempts);
                trace!(
                    connection = id,
                    attempts = self.failed_consecutive_connection_attempts,
                    ?backoff,
                    "connection attempt failed, backing off"
                );
                Action::connection(ConnectionAction::ScheduleBackoff {
                    id,
                    backoff,
                    event_loop,
                })
            }
            PoolState::ShuttingDown { .. } => {
                let (index, context) = self
                    .connections
                    .fail_connection(id)
                    .expect("pending connection attempt failed for an unknown connection");
                self.next_action_for_failed_connection(index, context)
            }
            PoolState::ShutDown => {
                unreachable!("connection attempt finished after the pool shut down")
            }
        }
    }

    /// The backoff timer for a failed attempt fired.
    pub(crate) fn connection_creation_backoff_done(&mut self, id: ConnectionId) -> Action {
        match self.state {
            PoolState::Running => {
                let (index, context) = self
                    .connections
                    .fail_connection(id)
                    .expect("backoff elapsed for an unknown connection");
                self.next_action_for_failed_connection(index, context)
            }
            // The shutdown already cancelled this timer; losing the race is
            // fine.
            PoolState::ShuttingDown { .. } | PoolState::ShutDown => Action::none(),
        }
    }

    /// The idle timer for a parked connection fired.
    pub(crate) fn connection_idle_timeout(&mut self, id: ConnectionId) -> Action {
        match self.connections.close_connection_if_idle(id) {
            Some(connection) => Action::connection(ConnectionAction::Close {
                connection,
                shutdown: ShutdownNotice::No,
            }),
            // Lost the race against a lease or a close.
            None => Action::none(),
        }
    }

    /// A request finished on the connection.
    pub(crate) fn connection_released(&mut self, id: ConnectionId) -> Action {
        let (index, context) = self.connections.release_connection(id);
        self.next_action_for_idle_connection(index, context)
    }

    /// The transport reported a close the pool did not initiate.
    pub(crate) fn connection_closed(&mut self, id: ConnectionId) -> Action {
        match self.connections.fail_connection(id) {
            Some((index, context)) => self.next_action_for_failed_connection(index, context),
            // The pool closed it itself earlier.
            None => Action::none(),
        }
    }

    /// The timeout timer of a queued request fired.
    pub(crate) fn timeout_request(&mut self, id: RequestId) -> Action {
        let Some(waiter) = self.requests.remove(id) else {
            // Lost the race against dispatch or cancellation.
            return Action::none();
        };

        let error = if let Some(error) = self.last_connect_failure.clone() {
            error
        } else if !self.connections.has_established_connections() {
            PoolError::ConnectTimeout
        } else {
            PoolError::GetConnectionTimeout
        };

        Action::request(RequestAction::Fail {
            waiter,
            error,
            cancel_timeout: false,
        })
    }

    /// The caller gave up on a queued request.
    pub(crate) fn cancel_request(&mut self, id: RequestId) -> Action {
        match self.requests.remove(id) {
            // The caller initiated this; it only needs the timer gone.
            Some(waiter) => {
                drop(waiter);
                Action::request(RequestAction::CancelTimeout { request_id: id })
            }
            // Already dispatched; cancellation is the transport's business.
            None => Action::none(),
        }
    }

    /// Tear the pool down. Single-shot.
    ///
    /// # Panics
    ///
    /// Panics when called more than once.
    pub(crate) fn shutdown(&mut self) -> Action {
        assert!(
            self.state == PoolState::Running,
            "shutdown() called twice on the same pool"
        );

        let waiters = self.requests.remove_all();
        let cleanup = self.connections.shutdown();
        let unclean = !(cleanup.cancel.is_empty() && waiters.is_empty());
        debug!(
            waiting = waiters.len(),
            cancelling = cleanup.cancel.len(),
            closing = cleanup.close.len(),
            unclean,
            "pool shutting down"
        );

        let request_action = if waiters.is_empty() {
            RequestAction::None
        } else {
            RequestAction::FailAll {
                waiters,
                error: PoolError::Cancelled,
            }
        };

        let shutdown = if self.connections.is_empty() {
            self.state = PoolState::ShutDown;
            ShutdownNotice::Yes { unclean }
        } else {
            self.state = PoolState::ShuttingDown { unclean };
            ShutdownNotice::No
        };

        Action {
            request: request_action,
            connection: ConnectionAction::Cleanup {
                context: cleanup,
                shutdown,
            },
        }
    }

    /// Dispatch a connection that just became idle, either freshly
    /// established or released by a finished request.
    fn next_action_for_idle_connection(
        &mut self,
        index: usize,
        context: IdleConnectionContext,
    ) -> Action {
        match self.state {
            PoolState::Running => match context.use_case {
                ConnectionUse::GeneralPurpose => {
                    let waiter = self
                        .requests
                        .pop_first(None)
                        .or_else(|| self.requests.pop_first(Some(context.event_loop.id())));
                    match waiter {
                        Some(waiter) => {
                            let connection = self.connections.lease_connection_at(index);
                            Action::request(RequestAction::Execute {
                                waiter,
                                connection,
                                cancel_timeout: true,
                            })
                        }
                        None => {
                            let (id, event_loop) = self.connections.park_connection_at(index);
                            Action::connection(ConnectionAction::ScheduleIdleTimeout {
                                id,
                                event_loop,
                            })
                        }
                    }
                }
                ConnectionUse::EventLoopBound => {
                    match self.requests.pop_first(Some(context.event_loop.id())) {
                        Some(waiter) => {
                            let connection = self.connections.lease_connection_at(index);
                            Action::request(RequestAction::Execute {
                                waiter,
                                connection,
                                cancel_timeout: true,
                            })
                        }
                        // Overflow connections are never parked.
                        None => {
                            let connection = self.connections.close_connection_at(index);
                            Action::connection(ConnectionAction::Close {
                                connection,
                                shutdown: ShutdownNotice::No,
                            })
                        }
                    }
                }
            },
            PoolState::ShuttingDown { unclean } => {
                let connection = self.connections.close_connection_at(index);
                let shutdown = if self.connections.is_empty() {
                    self.state = PoolState::ShutDown;
                    ShutdownNotice::Yes { unclean }
                } else {
                    ShutdownNotice::No
                };
                Action::connection(ConnectionAction::Close {
                    connection,
                    shutdown,
                })
            }
            PoolState::ShutDown => {
                unreachable!("connection became idle after the pool shut down")
            }
        }
    }

    /// Decide whether a failed or closed connection is re-dialled.
    fn next_action_for_failed_connection(
        &mut self,
        index: usize,
        context: FailedConnectionContext,
    ) -> Action {
        match self.state {
            PoolState::Running => {
                let demand = match context.use_case {
                    ConnectionUse::GeneralPurpose => self.requests.general_purpose_count(),
                    ConnectionUse::EventLoopBound => {
                        self.requests.count_for(context.event_loop.id())
                    }
                };
                if context.connections_starting_for_use_case < demand {
                    let (id, event_loop) = self.connections.replace_connection_at(index);
                    Action::connection(ConnectionAction::Create { id, event_loop })
                } else {
                    self.connections.remove_connection_at(index);
                    Action::none()
                }
            }
            PoolState::ShuttingDown { unclean } => {
                self.connections.remove_connection_at(index);
                if self.connections.is_empty() {
                    self.state = PoolState::ShutDown;
                    Action::connection(ConnectionAction::Cleanup {
                        context: CleanupContext::default(),
                        shutdown: ShutdownNotice::Yes { unclean },
                    })
                } else {
                    Action::none()
                }
            }
            PoolState::ShutDown => {
                unreachable!("connection failed after the pool shut down")
            }
        }
    }

    pub(crate) fn connection_counts(&self) -> ConnectionCounts {
        self.connections.counts()
    }

    pub(crate) fn queued_requests(&self) -> usize {
        self.requests.total_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_connection, test_event_loop, TestRequest};

    /// Drive the machine through create + establish for one request and
    /// return the leased connection's id.
    fn lease_fresh_connection(
        machine: &mut PoolStateMachine,
        request: Arc<TestRequest>,
        event_loop: &EventLoopHandle,
    ) -> ConnectionId {
        let action = machine.execute_request(request);
        let id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a connection attempt, got {:?}", other),
        };
        let (connection, _transport) = test_connection(id, event_loop);
        let action = machine.new_connection_established(connection);
        assert!(
            matches!(action.request, RequestAction::Execute { cancel_timeout: true, .. }),
            "expected the queued request to run, got {:?}",
            action.request
        );
        id
    }

    fn assert_cap_invariant(machine: &PoolStateMachine, max: usize) {
        let counts = machine.connection_counts();
        let general_total =
            counts.starting + counts.backing_off + counts.idle + counts.leased;
        // Overflow entries are excluded by construction in these tests.
        assert!(
            general_total <= max,
            "cap exceeded: {:?} with max {}",
            counts,
            max
        );
    }

    #[tokio::test]
    async fn test_lease_idle_connection() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let first = TestRequest::general(&event_loop);
        let id = lease_fresh_connection(&mut machine, first, &event_loop);
        let action = machine.connection_released(id);
        assert!(matches!(
            action.connection,
            ConnectionAction::ScheduleIdleTimeout { id: timeout_id, .. } if timeout_id == id
        ));

        // A new request leases the parked connection directly.
        let second = TestRequest::general(&event_loop);
        let action = machine.execute_request(second);
        match action.request {
            RequestAction::Execute {
                connection,
                cancel_timeout,
                ..
            } => {
                assert_eq!(connection.id(), id);
                assert!(!cancel_timeout);
            }
            other => panic!("expected an execute, got {:?}", other),
        }
        assert!(matches!(
            action.connection,
            ConnectionAction::CancelIdleTimeout { id: cancel_id } if cancel_id == id
        ));
        assert_eq!(machine.queued_requests(), 0);
        assert_eq!(machine.connection_counts().leased, 1);
    }

    #[tokio::test]
    async fn test_grow_until_cap() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(2);

        let action = machine.execute_request(TestRequest::general(&event_loop));
        assert!(matches!(action.request, RequestAction::ScheduleTimeout { .. }));
        assert!(matches!(action.connection, ConnectionAction::Create { .. }));

        // One dial in flight, two waiters: a second dial is issued.
        let action = machine.execute_request(TestRequest::general(&event_loop));
        assert!(matches!(action.request, RequestAction::ScheduleTimeout { .. }));
        assert!(matches!(action.connection, ConnectionAction::Create { .. }));

        // At the cap: the third request only waits.
        let action = machine.execute_request(TestRequest::general(&event_loop));
        assert!(matches!(action.request, RequestAction::ScheduleTimeout { .. }));
        assert!(matches!(action.connection, ConnectionAction::None));

        assert_eq!(machine.connection_counts().starting, 2);
        assert_eq!(machine.queued_requests(), 3);
        assert_cap_invariant(&machine, 2);
    }

    #[tokio::test]
    async fn test_no_dial_when_starting_covers_waiters() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        let action = machine.execute_request(request.clone());
        assert!(matches!(action.connection, ConnectionAction::Create { .. }));

        // The waiter is gone but the dial is still in flight; a fresh
        // request must not start a second dial.
        machine.cancel_request(request.id());
        let action = machine.execute_request(TestRequest::general(&event_loop));
        assert!(matches!(action.connection, ConnectionAction::None));
        assert_eq!(machine.connection_counts().starting, 1);
    }

    #[tokio::test]
    async fn test_backoff_then_retry() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let action = machine.execute_request(TestRequest::general(&event_loop));
        let first_id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a connection attempt, got {:?}", other),
        };

        let action =
            machine.failed_to_create_connection(first_id, PoolError::Connect("refused".into()));
        let backoff = match action.connection {
            ConnectionAction::ScheduleBackoff { id, backoff, .. } => {
                assert_eq!(id, first_id);
                backoff
            }
            other => panic!("expected a backoff, got {:?}", other),
        };
        assert!(backoff >= Duration::from_millis(97) && backoff <= Duration::from_millis(103));
        assert!(matches!(action.request, RequestAction::None));

        // The queue is still populated when the backoff elapses: re-dial.
        let action = machine.connection_creation_backoff_done(first_id);
        let second_id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a re-dial, got {:?}", other),
        };
        assert_ne!(second_id, first_id);

        // Second consecutive failure backs off for ~125 ms.
        let action =
            machine.failed_to_create_connection(second_id, PoolError::Connect("refused".into()));
        match action.connection {
            ConnectionAction::ScheduleBackoff { backoff, .. } => {
                assert!(backoff >= Duration::from_micros(121_250));
                assert!(backoff <= Duration::from_micros(128_750));
            }
            other => panic!("expected a backoff, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backoff_without_waiters_drops_the_entry() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        let action = machine.execute_request(request.clone());
        let id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a connection attempt, got {:?}", other),
        };
        machine.failed_to_create_connection(id, PoolError::Connect("refused".into()));
        machine.cancel_request(request.id());

        let action = machine.connection_creation_backoff_done(id);
        assert!(matches!(action.connection, ConnectionAction::None));
        assert!(matches!(action.request, RequestAction::None));
        assert_eq!(machine.connection_counts(), ConnectionCounts::default());
    }

    #[tokio::test]
    async fn test_timeout_surfaces_last_connect_failure() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        let action = machine.execute_request(request.clone());
        let id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a connection attempt, got {:?}", other),
        };
        machine.failed_to_create_connection(id, PoolError::Connect("refused".into()));

        let action = machine.timeout_request(request.id());
        match action.request {
            RequestAction::Fail {
                waiter,
                error,
                cancel_timeout,
            } => {
                assert_eq!(waiter.id(), request.id());
                assert_eq!(error, PoolError::Connect("refused".into()));
                assert!(!cancel_timeout);
            }
            other => panic!("expected a failure, got {:?}", other),
        }
        assert!(matches!(action.connection, ConnectionAction::None));
    }

    #[tokio::test]
    async fn test_timeout_error_depends_on_established_connections() {
        let event_loop = test_event_loop();

        // No connection ever established: connect timeout.
        let mut machine = PoolStateMachine::new(1);
        let first = TestRequest::general(&event_loop);
        machine.execute_request(first.clone());
        let action = machine.timeout_request(first.id());
        assert!(matches!(
            action.request,
            RequestAction::Fail { error: PoolError::ConnectTimeout, .. }
        ));

        // With a leased connection the pool was reachable: pool timeout.
        let mut machine = PoolStateMachine::new(1);
        let holder = TestRequest::general(&event_loop);
        lease_fresh_connection(&mut machine, holder, &event_loop);
        let waiting = TestRequest::general(&event_loop);
        machine.execute_request(waiting.clone());
        let action = machine.timeout_request(waiting.id());
        assert!(matches!(
            action.request,
            RequestAction::Fail { error: PoolError::GetConnectionTimeout, .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_after_dispatch_is_noop() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        lease_fresh_connection(&mut machine, request.clone(), &event_loop);

        let action = machine.timeout_request(request.id());
        assert!(matches!(action.request, RequestAction::None));
        assert!(matches!(action.connection, ConnectionAction::None));
    }

    #[tokio::test]
    async fn test_cancel_removes_waiter_and_timer() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        machine.execute_request(request.clone());
        assert_eq!(machine.queued_requests(), 1);

        let action = machine.cancel_request(request.id());
        assert!(matches!(
            action.request,
            RequestAction::CancelTimeout { request_id } if request_id == request.id()
        ));
        assert_eq!(machine.queued_requests(), 0);

        // A late timeout fire finds nothing to do.
        let action = machine.timeout_request(request.id());
        assert!(matches!(action.request, RequestAction::None));

        // Cancelling twice is equally harmless.
        let action = machine.cancel_request(request.id());
        assert!(matches!(action.request, RequestAction::None));
    }

    #[tokio::test]
    async fn test_idle_timeout_races_lease() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        let id = lease_fresh_connection(&mut machine, request, &event_loop);
        machine.connection_released(id);

        // Lease wins: the timer fire is a no-op.
        let action = machine.execute_request(TestRequest::general(&event_loop));
        assert!(matches!(action.request, RequestAction::Execute { .. }));
        let action = machine.connection_idle_timeout(id);
        assert!(matches!(action.connection, ConnectionAction::None));

        // Timer wins: the connection closes and a later request dials anew.
        machine.connection_released(id);
        let action = machine.connection_idle_timeout(id);
        assert!(matches!(
            action.connection,
            ConnectionAction::Close { shutdown: ShutdownNotice::No, .. }
        ));
        let action = machine.execute_request(TestRequest::general(&event_loop));
        assert!(matches!(action.connection, ConnectionAction::Create { .. }));
    }

    #[tokio::test]
    async fn test_unsolicited_close_redials_while_waiters_exist() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(1);

        let holder = TestRequest::general(&event_loop);
        let id = lease_fresh_connection(&mut machine, holder, &event_loop);
        machine.execute_request(TestRequest::general(&event_loop));

        let action = machine.connection_closed(id);
        assert!(matches!(action.connection, ConnectionAction::Create { .. }));

        // A close for an id the pool already forgot is a no-op.
        let action = machine.connection_closed(id);
        assert!(matches!(action.connection, ConnectionAction::None));
    }

    #[tokio::test]
    async fn test_fifo_dispatch_within_general_queue() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(1);

        let holder = TestRequest::general(&event_loop);
        let id = lease_fresh_connection(&mut machine, holder, &event_loop);

        let first = TestRequest::general(&event_loop);
        let second = TestRequest::general(&event_loop);
        machine.execute_request(first.clone());
        machine.execute_request(second.clone());

        let action = machine.connection_released(id);
        assert!(matches!(
            action.request,
            RequestAction::Execute { ref waiter, .. } if waiter.id() == first.id()
        ));
        let action = machine.connection_released(id);
        assert!(matches!(
            action.request,
            RequestAction::Execute { ref waiter, .. } if waiter.id() == second.id()
        ));
    }

    #[tokio::test]
    async fn test_general_connection_serves_bound_waiters_on_its_loop() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(1);

        let holder = TestRequest::general(&event_loop);
        let id = lease_fresh_connection(&mut machine, holder, &event_loop);

        // A bound waiter on the same loop is served once the connection
        // frees up and the general queue is empty.
        let bound = TestRequest::bound(&event_loop);
        machine.execute_request(bound.clone());
        let action = machine.connection_released(id);
        assert!(matches!(
            action.request,
            RequestAction::Execute { ref waiter, .. } if waiter.id() == bound.id()
        ));
    }

    #[tokio::test]
    async fn test_required_loop_overflow() {
        let loop_a = test_event_loop();
        let loop_b = test_event_loop();
        let mut machine = PoolStateMachine::new(1);

        // The only general slot is leased on loop A.
        let holder = TestRequest::general(&loop_a);
        lease_fresh_connection(&mut machine, holder, &loop_a);

        // A request bound to loop B grows past the cap.
        let bound = TestRequest::bound(&loop_b);
        let action = machine.execute_request(bound.clone());
        assert!(matches!(action.request, RequestAction::ScheduleTimeout { .. }));
        let overflow_id = match action.connection {
            ConnectionAction::Create { id, ref event_loop } => {
                assert_eq!(event_loop.id(), loop_b.id());
                id
            }
            other => panic!("expected an overflow dial, got {:?}", other),
        };

        let (connection, _transport) = test_connection(overflow_id, &loop_b);
        let action = machine.new_connection_established(connection);
        assert!(matches!(
            action.request,
            RequestAction::Execute { ref waiter, cancel_timeout: true, .. }
                if waiter.id() == bound.id()
        ));

        // Released overflow connections close instead of parking.
        let action = machine.connection_released(overflow_id);
        assert!(matches!(
            action.connection,
            ConnectionAction::Close { ref connection, shutdown: ShutdownNotice::No }
                if connection.id() == overflow_id
        ));
    }

    #[tokio::test]
    async fn test_bound_waiters_do_not_outgrow_inflight_dials() {
        let loop_b = test_event_loop();
        let mut machine = PoolStateMachine::new(1);

        let first = TestRequest::bound(&loop_b);
        let action = machine.execute_request(first.clone());
        assert!(matches!(action.connection, ConnectionAction::Create { .. }));

        let second = TestRequest::bound(&loop_b);
        let action = machine.execute_request(second);
        assert!(matches!(action.connection, ConnectionAction::Create { .. }));

        // Two dials in flight; after one waiter leaves, a third waiter is
        // already covered and no further dial starts.
        machine.cancel_request(first.id());
        let third = TestRequest::bound(&loop_b);
        let action = machine.execute_request(third);
        assert!(matches!(action.connection, ConnectionAction::None));
    }

    #[tokio::test]
    async fn test_shutdown_with_leased_and_queued() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(1);

        let holder = TestRequest::general(&event_loop);
        let id = lease_fresh_connection(&mut machine, holder, &event_loop);
        let waiting = TestRequest::general(&event_loop);
        machine.execute_request(waiting.clone());

        let action = machine.shutdown();
        match action.request {
            RequestAction::FailAll { waiters, error } => {
                assert_eq!(waiters.len(), 1);
                assert_eq!(waiters[0].id(), waiting.id());
                assert_eq!(error, PoolError::Cancelled);
            }
            other => panic!("expected the waiter to fail, got {:?}", other),
        }
        match action.connection {
            ConnectionAction::Cleanup { context, shutdown } => {
                assert_eq!(context.cancel.len(), 1);
                assert_eq!(context.cancel[0].id(), id);
                assert!(context.close.is_empty());
                assert!(context.connect_backoff.is_empty());
                assert_eq!(shutdown, ShutdownNotice::No);
            }
            other => panic!("expected a cleanup, got {:?}", other),
        }

        // The cancelled transport reports closure; only then is the pool
        // fully shut down, uncleanly.
        let action = machine.connection_closed(id);
        assert!(matches!(
            action.connection,
            ConnectionAction::Cleanup { shutdown: ShutdownNotice::Yes { unclean: true }, .. }
        ));

        // No event creates connections from here on.
        let action = machine.execute_request(TestRequest::general(&event_loop));
        assert!(matches!(
            action.request,
            RequestAction::Fail { error: PoolError::AlreadyShutdown, .. }
        ));
        assert!(matches!(action.connection, ConnectionAction::None));
    }

    #[tokio::test]
    async fn test_clean_shutdown_of_parked_pool() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        let id = lease_fresh_connection(&mut machine, request, &event_loop);
        machine.connection_released(id);

        let action = machine.shutdown();
        assert!(matches!(action.request, RequestAction::None));
        match action.connection {
            ConnectionAction::Cleanup { context, shutdown } => {
                assert_eq!(context.close.len(), 1);
                assert!(context.cancel.is_empty());
                assert_eq!(shutdown, ShutdownNotice::Yes { unclean: false });
            }
            other => panic!("expected a cleanup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_backoff_timers() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        let action = machine.execute_request(request.clone());
        let id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a connection attempt, got {:?}", other),
        };

        // Fail the dial, then drop the waiter so shutdown only sees the
        // backing-off entry.
        let action = machine.failed_to_create_connection(id, PoolError::Connect("refused".into()));
        let id = match action.connection {
            ConnectionAction::ScheduleBackoff { id, .. } => id,
            other => panic!("expected a backoff, got {:?}", other),
        };
        machine.cancel_request(request.id());

        let action = machine.shutdown();
        match action.connection {
            ConnectionAction::Cleanup { context, shutdown } => {
                assert_eq!(context.connect_backoff, vec![id]);
                assert_eq!(shutdown, ShutdownNotice::Yes { unclean: false });
            }
            other => panic!("expected a cleanup, got {:?}", other),
        }

        // A late backoff fire after shutdown is a no-op.
        let action = machine.connection_creation_backoff_done(id);
        assert!(matches!(action.request, RequestAction::None));
        assert!(matches!(action.connection, ConnectionAction::None));
    }

    #[tokio::test]
    async fn test_establish_during_shutdown_closes_connection() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        let action = machine.execute_request(request.clone());
        let id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a connection attempt, got {:?}", other),
        };

        machine.shutdown();

        // The dial completes anyway; the fresh connection is closed and the
        // pool finishes shutting down.
        let (connection, _transport) = test_connection(id, &event_loop);
        let action = machine.new_connection_established(connection);
        assert!(matches!(
            action.connection,
            ConnectionAction::Close { shutdown: ShutdownNotice::Yes { unclean: true }, .. }
        ));
    }

    #[tokio::test]
    #[should_panic(expected = "shutdown() called twice")]
    async fn test_double_shutdown_panics() {
        let mut machine = PoolStateMachine::new(8);
        machine.shutdown();
        machine.shutdown();
    }

    #[tokio::test]
    async fn test_request_after_shutdown_fails_without_transport_activity() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);
        machine.shutdown();

        let request = TestRequest::general(&event_loop);
        let action = machine.execute_request(request.clone());
        match action.request {
            RequestAction::Fail {
                waiter,
                error,
                cancel_timeout,
            } => {
                assert_eq!(waiter.id(), request.id());
                assert_eq!(error, PoolError::AlreadyShutdown);
                assert!(!cancel_timeout);
            }
            other => panic!("expected a failure, got {:?}", other),
        }
        assert_eq!(machine.connection_counts(), ConnectionCounts::default());
    }

    #[tokio::test]
    async fn test_establish_resets_failure_streak() {
        let event_loop = test_event_loop();
        let mut machine = PoolStateMachine::new(8);

        let request = TestRequest::general(&event_loop);
        let action = machine.execute_request(request.clone());
        let first_id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a connection attempt, got {:?}", other),
        };
        machine.failed_to_create_connection(first_id, PoolError::Connect("refused".into()));
        let action = machine.connection_creation_backoff_done(first_id);
        let id = match action.connection {
            ConnectionAction::Create { id, .. } => id,
            other => panic!("expected a re-dial, got {:?}", other),
        };

        let (connection, _transport) = test_connection(id, &event_loop);
        machine.new_connection_established(connection);

        // The recorded failure is gone: a fresh timeout reports the generic
        // pool timeout, and a fresh failure starts the curve over.
        let waiting = TestRequest::general(&event_loop);
        machine.execute_request(waiting.clone());
        let action = machine.timeout_request(waiting.id());
        assert!(matches!(
            action.request,
            RequestAction::Fail { error: PoolError::GetConnectionTimeout, .. }
        ));
    }
}
