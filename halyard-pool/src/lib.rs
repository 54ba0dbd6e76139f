//! # Halyard Pool
//!
//! A per-origin HTTP/1.1 connection pool with event loop affinity.
//!
//! The pool decides, for every incoming request, whether to run it on an
//! idle connection, queue it until one frees up, or start a new connection
//! attempt. It also drives every connection through its whole lifecycle:
//! starting, backing off after a failed dial, idle, leased, closed.
//!
//! ## Design
//!
//! - **Decisions and effects are split.** Every event advances a state
//!   machine under one short lock and comes back with a value describing
//!   the side effects to perform; all I/O, timer work and callbacks happen
//!   with the lock released.
//! - **Event loop affinity.** Connections are pinned to one event loop for
//!   life. Requests may prefer a loop (used to pick among idle
//!   connections) or require one (served only by connections on that loop,
//!   growing past the pool cap if needed).
//! - **Timers claim before they act.** A firing request, idle or backoff
//!   timer first removes its own registry entry; if the entry is already
//!   gone the fire is a no-op, which makes cancellation race-free.
//!
//! The wire protocol stays behind the [`Transport`] trait; dialling stays
//! behind [`ConnectionFactory`]. This crate never sees bytes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use halyard_pool::{EventLoopGroup, Origin, Pool, PoolConfig};
//!
//! let loops = EventLoopGroup::new(4)?;
//! let pool = Pool::new(
//!     Origin::https("api.example.com"),
//!     PoolConfig::builder()
//!         .max_concurrent_connections(8)
//!         .build(),
//!     Arc::new(MyConnectionFactory::new(loops.handles().to_vec())),
//! );
//!
//! // `request` implements `PoolRequest`; the pool runs it on a pooled
//! // connection or fails it by its connection deadline.
//! pool.execute_request(request);
//! ```

mod backoff;
mod config;
mod connection;
mod connections;
mod error;
mod event_loop;
mod origin;
mod pool;
mod queue;
mod request;
mod state_machine;

#[cfg(test)]
mod test_util;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use connection::{Connection, ConnectionFactory, ConnectionId, Transport};
pub use error::{PoolError, Result};
pub use event_loop::{EventLoopGroup, EventLoopHandle, EventLoopId};
pub use origin::{Origin, Scheme};
pub use pool::{NoopDelegate, Pool, PoolDelegate, PoolStats};
pub use request::{PoolRequest, RequestId};

/// Prelude for common imports.
///
/// ```
/// use halyard_pool::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{PoolConfig, PoolConfigBuilder};
    pub use crate::connection::{Connection, ConnectionFactory, ConnectionId, Transport};
    pub use crate::error::{PoolError, Result};
    pub use crate::event_loop::{EventLoopGroup, EventLoopHandle, EventLoopId};
    pub use crate::origin::{Origin, Scheme};
    pub use crate::pool::{Pool, PoolDelegate, PoolStats};
    pub use crate::request::{PoolRequest, RequestId};
}
