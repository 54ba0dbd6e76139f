//! Event loops.
//!
//! Connections and their timers are pinned to one event loop for their
//! entire lifetime. An event loop is a dedicated thread driving a
//! current-thread tokio runtime; [`EventLoopHandle`] is the cheap, cloneable
//! handle used to spawn work onto it from any thread.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use tokio::runtime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Global event loop ID counter.
static EVENT_LOOP_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identifier of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventLoopId(usize);

impl EventLoopId {
    /// Mint the next process-unique id.
    pub fn next() -> Self {
        Self(EVENT_LOOP_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an id from a raw value.
    ///
    /// Callers embedding their own runtimes are responsible for keeping raw
    /// ids distinct from each other; ids minted by [`EventLoopId::next`] are
    /// always safe to mix in.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EventLoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one event loop.
///
/// Equality is by id; the wrapped runtime handle is not compared.
#[derive(Clone)]
pub struct EventLoopHandle {
    id: EventLoopId,
    handle: runtime::Handle,
}

impl EventLoopHandle {
    /// Wrap an existing runtime handle as an event loop.
    ///
    /// The pool treats the handle as a single-threaded executor; callers
    /// embedding a multi-threaded runtime lose per-loop thread affinity but
    /// keep the scheduling semantics.
    pub fn new(id: EventLoopId, handle: runtime::Handle) -> Self {
        Self { id, handle }
    }

    /// The id of this event loop.
    pub fn id(&self) -> EventLoopId {
        self.id
    }

    /// Spawn a future onto this event loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl PartialEq for EventLoopHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventLoopHandle {}

impl fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopHandle").field("id", &self.id).finish()
    }
}

/// A fixed set of event loops with round-robin selection.
pub struct EventLoopGroup {
    loops: Vec<EventLoopHandle>,
    next: AtomicUsize,
    threads: Vec<thread::JoinHandle<()>>,
    stop: Vec<oneshot::Sender<()>>,
}

impl EventLoopGroup {
    /// Start `count` event loop threads.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn new(count: usize) -> io::Result<Self> {
        assert!(count > 0, "an event loop group needs at least one loop");

        let mut loops = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        let mut stop = Vec::with_capacity(count);

        for _ in 0..count {
            let id = EventLoopId::next();
            let (handle_tx, handle_rx) = mpsc::channel::<io::Result<runtime::Handle>>();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();

            let thread = thread::Builder::new()
                .name(format!("event-loop-{}", id))
                .spawn(move || {
                    let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                        Ok(rt) => rt,
                        Err(e) => {
                            let _ = handle_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = handle_tx.send(Ok(rt.handle().clone()));
                    // Drive the runtime until the group stops it. Dropping
                    // the sender unblocks this as well.
                    rt.block_on(async {
                        let _ = stop_rx.await;
                    });
                })?;

            let handle = handle_rx
                .recv()
                .map_err(|_| io::Error::other("event loop thread exited during startup"))??;

            loops.push(EventLoopHandle::new(id, handle));
            threads.push(thread);
            stop.push(stop_tx);
        }

        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
            threads,
            stop,
        })
    }

    /// Select the next event loop, round-robin.
    pub fn next(&self) -> EventLoopHandle {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[idx].clone()
    }

    /// Look up a loop by id.
    pub fn get(&self, id: EventLoopId) -> Option<&EventLoopHandle> {
        self.loops.iter().find(|l| l.id() == id)
    }

    /// All loops in this group.
    pub fn handles(&self) -> &[EventLoopHandle] {
        &self.loops
    }

    /// Number of loops in this group.
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Whether this group has no loops. Always false for a constructed group.
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Stop all loops and join their threads.
    ///
    /// Tasks already spawned are dropped once their runtime stops. Dropping
    /// the group without calling this stops the loops without joining.
    pub fn shutdown(mut self) {
        for tx in self.stop.drain(..) {
            let _ = tx.send(());
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.loops)
            .finish()
    }
}
