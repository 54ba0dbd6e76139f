//! The connection set.
//!
//! One entry per connection the pool knows about, together with the cached
//! per-state counters. All operations are plain mutations; the scheduling
//! decisions that call them live in the state machine.

use crate::connection::{Connection, ConnectionId};
use crate::event_loop::{EventLoopHandle, EventLoopId};

/// How a connection entry may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionUse {
    /// Counted against the pool cap; serves any request its loop allows.
    GeneralPurpose,
    /// Created for requests bound to one loop; not counted against the cap
    /// and closed as soon as no bound waiter remains.
    EventLoopBound,
}

#[derive(Debug)]
enum EntryState {
    /// Dial in flight.
    Starting,
    /// Dial failed; waiting for the backoff timer.
    BackingOff,
    /// Established, no active request.
    Idle { connection: Connection },
    /// Executing a request.
    Leased { connection: Connection },
    /// Terminal. Only observable within the event that produced it; the
    /// same event replaces or removes the entry.
    Closed,
}

#[derive(Debug)]
struct ConnectionEntry {
    id: ConnectionId,
    event_loop: EventLoopHandle,
    use_case: ConnectionUse,
    state: EntryState,
}

/// Cached per-state counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ConnectionCounts {
    pub(crate) starting: usize,
    pub(crate) backing_off: usize,
    pub(crate) idle: usize,
    pub(crate) leased: usize,
}

/// What a released or newly established connection looks like to the
/// dispatch logic.
#[derive(Debug)]
pub(crate) struct IdleConnectionContext {
    pub(crate) use_case: ConnectionUse,
    pub(crate) event_loop: EventLoopHandle,
}

/// What a failed or closed connection looked like, for re-dial decisions.
#[derive(Debug)]
pub(crate) struct FailedConnectionContext {
    pub(crate) use_case: ConnectionUse,
    pub(crate) event_loop: EventLoopHandle,
    /// Entries still `Starting` in the same use-case/loop bucket.
    pub(crate) connections_starting_for_use_case: usize,
}

/// The three disjoint groups of handles a shutdown has to act on.
#[derive(Debug, Default)]
pub(crate) struct CleanupContext {
    /// Idle connections, safe to close outright.
    pub(crate) close: Vec<Connection>,
    /// Leased connections whose in-flight request must be cancelled.
    pub(crate) cancel: Vec<Connection>,
    /// Connections whose backoff timer must be cancelled.
    pub(crate) connect_backoff: Vec<ConnectionId>,
}

pub(crate) struct ConnectionSet {
    max_connections: usize,
    entries: Vec<ConnectionEntry>,
    counts: ConnectionCounts,
    next_id: ConnectionId,
}

impl ConnectionSet {
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            entries: Vec::new(),
            counts: ConnectionCounts::default(),
            next_id: 0,
        }
    }

    fn mint_id(&mut self) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn index_of(&self, id: ConnectionId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Non-terminal general-purpose entries, the population the cap limits.
    fn general_purpose_connections(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                e.use_case == ConnectionUse::GeneralPurpose
                    && !matches!(e.state, EntryState::Closed)
            })
            .count()
    }

    /// Whether another general-purpose connection fits under the cap.
    pub(crate) fn can_grow(&self) -> bool {
        self.general_purpose_connections() < self.max_connections
    }

    pub(crate) fn starting_general_purpose_connections(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                e.use_case == ConnectionUse::GeneralPurpose
                    && matches!(e.state, EntryState::Starting)
            })
            .count()
    }

    pub(crate) fn starting_event_loop_connections(&self, event_loop: EventLoopId) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                e.use_case == ConnectionUse::EventLoopBound
                    && e.event_loop.id() == event_loop
                    && matches!(e.state, EntryState::Starting)
            })
            .count()
    }

    fn starting_in_bucket(&self, use_case: ConnectionUse, event_loop: EventLoopId) -> usize {
        match use_case {
            ConnectionUse::GeneralPurpose => self.starting_general_purpose_connections(),
            ConnectionUse::EventLoopBound => self.starting_event_loop_connections(event_loop),
        }
    }

    /// Insert a fresh general-purpose entry in `Starting` on `event_loop`.
    ///
    /// # Panics
    ///
    /// Panics if the cap is already reached; callers check [`Self::can_grow`]
    /// first.
    pub(crate) fn create_new_connection(&mut self, event_loop: &EventLoopHandle) -> ConnectionId {
        assert!(self.can_grow(), "connection cap reached");
        let id = self.mint_id();
        self.entries.push(ConnectionEntry {
            id,
            event_loop: event_loop.clone(),
            use_case: ConnectionUse::GeneralPurpose,
            state: EntryState::Starting,
        });
        self.counts.starting += 1;
        id
    }

    /// Insert a fresh event-loop-bound entry in `Starting` on `event_loop`.
    pub(crate) fn create_new_overflow_connection(
        &mut self,
        event_loop: &EventLoopHandle,
    ) -> ConnectionId {
        let id = self.mint_id();
        self.entries.push(ConnectionEntry {
            id,
            event_loop: event_loop.clone(),
            use_case: ConnectionUse::EventLoopBound,
            state: EntryState::Starting,
        });
        self.counts.starting += 1;
        id
    }

    /// Lease an idle general-purpose connection, preferring one already on
    /// `preferred`.
    pub(crate) fn lease_connection_on_preferred(
        &mut self,
        preferred: EventLoopId,
    ) -> Option<Connection> {
        let on_loop = self.entries.iter().position(|e| {
            e.use_case == ConnectionUse::GeneralPurpose
                && e.event_loop.id() == preferred
                && matches!(e.state, EntryState::Idle { .. })
        });
        let index = on_loop.or_else(|| {
            self.entries.iter().position(|e| {
                e.use_case == ConnectionUse::GeneralPurpose
                    && matches!(e.state, EntryState::Idle { .. })
            })
        })?;
        Some(self.lease_connection_at(index))
    }

    /// Lease an idle connection bound to exactly `required`, regardless of
    /// use-case.
    pub(crate) fn lease_connection_on_required(
        &mut self,
        required: EventLoopId,
    ) -> Option<Connection> {
        let index = self.entries.iter().position(|e| {
            e.event_loop.id() == required && matches!(e.state, EntryState::Idle { .. })
        })?;
        Some(self.lease_connection_at(index))
    }

    /// Transition the idle entry at `index` to leased.
    pub(crate) fn lease_connection_at(&mut self, index: usize) -> Connection {
        let entry = &mut self.entries[index];
        match std::mem::replace(&mut entry.state, EntryState::Closed) {
            EntryState::Idle { connection } => {
                entry.state = EntryState::Leased {
                    connection: connection.clone(),
                };
                self.counts.idle -= 1;
                self.counts.leased += 1;
                connection
            }
            state => panic!("leased a connection in state {:?}", state),
        }
    }

    /// Park the entry at `index` as idle; the caller arms the idle timer.
    pub(crate) fn park_connection_at(&mut self, index: usize) -> (ConnectionId, EventLoopHandle) {
        let entry = &mut self.entries[index];
        match std::mem::replace(&mut entry.state, EntryState::Closed) {
            EntryState::Idle { connection } => {
                entry.state = EntryState::Idle { connection };
            }
            EntryState::Leased { connection } => {
                entry.state = EntryState::Idle { connection };
                self.counts.leased -= 1;
                self.counts.idle += 1;
            }
            state => panic!("parked a connection in state {:?}", state),
        }
        (entry.id, entry.event_loop.clone())
    }

    /// Close the connection if it is still idle. Returns `None` when the
    /// entry is gone or no longer idle (the timer lost a race to a lease).
    pub(crate) fn close_connection_if_idle(&mut self, id: ConnectionId) -> Option<Connection> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id && matches!(e.state, EntryState::Idle { .. }))?;
        self.counts.idle -= 1;
        match self.entries.remove(index).state {
            EntryState::Idle { connection } => Some(connection),
            _ => unreachable!(),
        }
    }

    /// Close the entry at `index`, which must be idle.
    pub(crate) fn close_connection_at(&mut self, index: usize) -> Connection {
        match self.entries.remove(index) {
            ConnectionEntry {
                state: EntryState::Idle { connection },
                ..
            } => {
                self.counts.idle -= 1;
                connection
            }
            entry => panic!("closed a connection in state {:?}", entry.state),
        }
    }

    /// A request finished on the connection; the entry becomes idle and the
    /// caller dispatches it.
    ///
    /// # Panics
    ///
    /// Panics if the id is unknown or the entry is not leased; both are
    /// invariant violations.
    pub(crate) fn release_connection(
        &mut self,
        id: ConnectionId,
    ) -> (usize, IdleConnectionContext) {
        let index = self
            .index_of(id)
            .unwrap_or_else(|| panic!("released unknown connection {}", id));
        let entry = &mut self.entries[index];
        match std::mem::replace(&mut entry.state, EntryState::Closed) {
            EntryState::Leased { connection } => {
                entry.state = EntryState::Idle { connection };
                self.counts.leased -= 1;
                self.counts.idle += 1;
            }
            state => panic!("released a connection in state {:?}", state),
        }
        let context = IdleConnectionContext {
            use_case: entry.use_case,
            event_loop: entry.event_loop.clone(),
        };
        (index, context)
    }

    /// A pending dial succeeded; the starting entry becomes idle.
    pub(crate) fn new_connection_established(
        &mut self,
        connection: Connection,
    ) -> (usize, IdleConnectionContext) {
        let id = connection.id();
        let index = self
            .index_of(id)
            .unwrap_or_else(|| panic!("established unknown connection {}", id));
        let entry = &mut self.entries[index];
        debug_assert_eq!(
            entry.event_loop.id(),
            connection.event_loop().id(),
            "connection established on the wrong event loop"
        );
        match entry.state {
            EntryState::Starting => {
                entry.state = EntryState::Idle { connection };
                self.counts.starting -= 1;
                self.counts.idle += 1;
            }
            ref state => panic!("established a connection in state {:?}", state),
        }
        let context = IdleConnectionContext {
            use_case: entry.use_case,
            event_loop: entry.event_loop.clone(),
        };
        (index, context)
    }

    /// Mark the entry terminal from whatever non-terminal state it is in.
    /// Returns `None` when the id is unknown or the entry is already
    /// terminal (a close the pool itself initiated).
    pub(crate) fn fail_connection(
        &mut self,
        id: ConnectionId,
    ) -> Option<(usize, FailedConnectionContext)> {
        let index = self.index_of(id)?;
        {
            let entry = &mut self.entries[index];
            match std::mem::replace(&mut entry.state, EntryState::Closed) {
                EntryState::Starting => self.counts.starting -= 1,
                EntryState::BackingOff => self.counts.backing_off -= 1,
                EntryState::Idle { .. } => self.counts.idle -= 1,
                EntryState::Leased { .. } => self.counts.leased -= 1,
                EntryState::Closed => return None,
            }
        }
        let entry = &self.entries[index];
        let context = FailedConnectionContext {
            use_case: entry.use_case,
            event_loop: entry.event_loop.clone(),
            connections_starting_for_use_case: self
                .starting_in_bucket(entry.use_case, entry.event_loop.id()),
        };
        Some((index, context))
    }

    /// Replace the terminal entry at `index` with a fresh starting entry on
    /// the same loop and in the same use-case bucket.
    pub(crate) fn replace_connection_at(
        &mut self,
        index: usize,
    ) -> (ConnectionId, EventLoopHandle) {
        let id = self.mint_id();
        let entry = &mut self.entries[index];
        assert!(
            matches!(entry.state, EntryState::Closed),
            "replaced a connection in state {:?}",
            entry.state
        );
        entry.id = id;
        entry.state = EntryState::Starting;
        self.counts.starting += 1;
        (id, entry.event_loop.clone())
    }

    /// Erase the terminal entry at `index`.
    pub(crate) fn remove_connection_at(&mut self, index: usize) {
        let entry = self.entries.remove(index);
        assert!(
            matches!(entry.state, EntryState::Closed),
            "removed a connection in state {:?}",
            entry.state
        );
    }

    /// The dial for this entry failed; wait for the backoff timer.
    pub(crate) fn backoff_next_connection_attempt(
        &mut self,
        id: ConnectionId,
    ) -> EventLoopHandle {
        let index = self
            .index_of(id)
            .unwrap_or_else(|| panic!("backoff for unknown connection {}", id));
        let entry = &mut self.entries[index];
        match entry.state {
            EntryState::Starting => {
                entry.state = EntryState::BackingOff;
                self.counts.starting -= 1;
                self.counts.backing_off += 1;
            }
            ref state => panic!("backoff for a connection in state {:?}", state),
        }
        entry.event_loop.clone()
    }

    /// Tear the set down.
    ///
    /// Idle and backing-off entries leave the set immediately; leased and
    /// starting entries stay until their transport or dial reports back.
    pub(crate) fn shutdown(&mut self) -> CleanupContext {
        let mut cleanup = CleanupContext::default();
        let mut kept = Vec::with_capacity(self.entries.len());

        for entry in self.entries.drain(..) {
            match entry.state {
                EntryState::Idle { connection } => {
                    self.counts.idle -= 1;
                    cleanup.close.push(connection);
                }
                EntryState::BackingOff => {
                    self.counts.backing_off -= 1;
                    cleanup.connect_backoff.push(entry.id);
                }
                EntryState::Leased { connection } => {
                    cleanup.cancel.push(connection.clone());
                    kept.push(ConnectionEntry {
                        id: entry.id,
                        event_loop: entry.event_loop,
                        use_case: entry.use_case,
                        state: EntryState::Leased { connection },
                    });
                }
                EntryState::Starting => kept.push(ConnectionEntry {
                    id: entry.id,
                    event_loop: entry.event_loop,
                    use_case: entry.use_case,
                    state: EntryState::Starting,
                }),
                EntryState::Closed => unreachable!("terminal entries do not survive an event"),
            }
        }

        self.entries = kept;
        cleanup
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry has an established transport, idle or leased.
    pub(crate) fn has_established_connections(&self) -> bool {
        self.counts.idle + self.counts.leased > 0
    }

    pub(crate) fn counts(&self) -> ConnectionCounts {
        self.counts
    }
}
