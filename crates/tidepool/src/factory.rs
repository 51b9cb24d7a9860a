//! Driver seam — the only place the pool touches a database driver.
//!
//! The pool never speaks a wire protocol. A driver supplies a
//! [`ConnectionFactory`] that opens physical connections, and each
//! connection only has to know how to close itself.

use std::sync::Arc;

/// A physical database connection owned by a pool.
///
/// Connections are shared as [`SharedConnection`] so that the pool can lend
/// one out and still recognise it by pointer identity when it is released.
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Close the underlying transport.
    fn close(&self) -> Result<(), String>;
}

/// A pooled connection as lent to callers.
pub type SharedConnection = Arc<dyn Connection>;

/// Opens physical connections for one driver.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection to `url` with the given credentials.
    fn open(&self, url: &str, username: &str, password: &str) -> Result<SharedConnection, String>;
}
