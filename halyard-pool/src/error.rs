//! Pool error types.

use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced to requests by the connection pool.
///
/// The error is `Clone` because a single recorded connect failure may be
/// delivered to any number of requests that time out while waiting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool was shut down before the request could be scheduled.
    #[error("connection pool is already shut down")]
    AlreadyShutdown,

    /// The request was cancelled while waiting for a connection.
    #[error("request was cancelled while waiting for a connection")]
    Cancelled,

    /// The request deadline elapsed while waiting for a pooled connection.
    #[error("timed out waiting for a connection from the pool")]
    GetConnectionTimeout,

    /// The request deadline elapsed before any connection could be
    /// established.
    #[error("timed out establishing a connection")]
    ConnectTimeout,

    /// A connection attempt failed. Carries the transport-reported reason.
    #[error("connection attempt failed: {0}")]
    Connect(String),
}

impl PoolError {
    /// Check if this error is a timeout of either kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::GetConnectionTimeout | Self::ConnectTimeout)
    }

    /// Check if this error was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error carries a transport-reported connect failure.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}
