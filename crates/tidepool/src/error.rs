//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while acquiring, growing, reaping, or building a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A lease was requested on a handle that is already leased.
    #[error("connection handle {0} is already busy")]
    AlreadyBusy(u64),

    /// The factory failed to open a physical connection while growing.
    #[error("failed to open connection for pool '{profile}': {reason}")]
    ConnectionCreation { profile: String, reason: String },

    /// Every connection stayed busy for the whole acquire timeout.
    #[error("pool '{profile}' exhausted: all {max} connections busy (waited {waited:?})")]
    PoolExhausted {
        profile: String,
        max: usize,
        waited: Duration,
    },

    /// Bad configuration, unknown driver, or factory failure while building a pool.
    #[error("failed to initialize pool '{profile}': {reason}")]
    PoolInitialization { profile: String, reason: String },

    /// The reaper could not close an evicted connection.
    #[error("failed to close evicted connection {handle} in pool '{profile}': {reason}")]
    EvictionClose {
        profile: String,
        handle: u64,
        reason: String,
    },

    /// The pool has been shut down.
    #[error("pool '{0}' is shut down")]
    Closed(String),
}
