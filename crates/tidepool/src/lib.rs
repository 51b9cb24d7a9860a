//! tidepool — a bounded, per-profile pool of reusable database connections.
//!
//! Connections are opened lazily through a driver-supplied
//! [`ConnectionFactory`], lent out exclusively, returned with
//! [`PoolEngine::release`], grown in fixed steps under contention, and
//! reaped in the background once idle.
//!
//! # Architecture
//!
//! ```text
//! PoolRegistry
//!   ├── drivers: name → ConnectionFactory
//!   └── per-profile OnceCell<PoolEngine>   (built once, never replaced)
//!         PoolEngine
//!           ├── Vec<Arc<ConnectionHandle>>  (busy flag + last-active time)
//!           ├── grow_lock                   (claim, else grow by step_size ≤ max)
//!           ├── Notify                      (wakes waiters on release / growth)
//!           └── idle reaper task            (evicts idle handles above the floor)
//! ```
//!
//! ```text
//! acquire()
//!   → free handle?          → CAS busy, return its connection
//!   → count < max?          → open min(step, max - count), claim one
//!   → at max                → wait for release (optionally until a deadline)
//! ```

pub mod engine;
pub mod error;
pub mod factory;
pub mod handle;
pub mod reaper;
pub mod registry;

#[cfg(test)]
mod mock;

pub use engine::{PoolEngine, PoolStats};
pub use error::{PoolError, PoolResult};
pub use factory::{Connection, ConnectionFactory, SharedConnection};
pub use handle::ConnectionHandle;
pub use reaper::ReapReport;
pub use registry::PoolRegistry;
pub use tidepool_core::{PoolFile, PoolSettings, ShrinkFloor};
