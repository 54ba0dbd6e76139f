// Halyard - an HTTP client core built around a per-origin connection pool
//
// This facade re-exports the pool crate; protocol transports and the
// client surface plug in around it.

pub use halyard_pool::*;

// Prelude for common imports
pub mod prelude {
    pub use halyard_pool::prelude::*;
}
