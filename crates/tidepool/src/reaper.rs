//! Idle reaper — background task that evicts connections idle too long.
//!
//! The reaper ticks every `idle_timeout`, starting after
//! `reaper_initial_delay`. Each tick runs [`PoolEngine::reap_idle`]:
//!
//! ```text
//! count <= floor?             → skip
//! for each handle snapshot:
//!   write lock held:
//!     count <= floor          → stop
//!     busy / not idle enough  → skip
//!     CAS claim fails         → skip (an acquirer got there first)
//!     remove from collection
//!   close connection (outside the lock)
//!     error                   → EvictionClose, logged and reported
//! ```
//!
//! Removal and claim happen in one step under the write lock, so a handle
//! is either still pooled and free, or gone; a failed close never puts it
//! back. The task holds only a `Weak` reference and exits once the pool is
//! dropped or shut down.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::PoolEngine;
use crate::error::PoolError;
use crate::handle::ConnectionHandle;

/// Outcome of one reap pass.
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Connections removed from the pool, whether or not they closed cleanly.
    pub evicted: usize,
    /// Close failures, one [`PoolError::EvictionClose`] per connection.
    pub failures: Vec<PoolError>,
}

/// Running reaper task plus its shutdown signal.
#[derive(Debug)]
pub(crate) struct ReaperHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReaperHandle {
    pub(crate) fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

pub(crate) fn spawn(pool: Weak<PoolEngine>, initial_delay: Duration, period: Duration) -> ReaperHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_reaper_loop(pool, initial_delay, period, shutdown_rx));
    ReaperHandle {
        handle,
        shutdown_tx,
    }
}

async fn run_reaper_loop(
    pool: Weak<PoolEngine>,
    initial_delay: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.reap_idle();
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
    debug!("idle reaper stopped");
}

impl PoolEngine {
    /// Run one reap pass: evict free connections idle longer than
    /// `idle_timeout` while the pool is above its shrink floor.
    pub fn reap_idle(&self) -> ReapReport {
        let mut report = ReapReport::default();
        let floor = self.settings().floor_size();
        let threshold = self.settings().idle_timeout;

        let snapshot: Vec<Arc<ConnectionHandle>> = {
            let handles = self.read_handles();
            if handles.len() <= floor {
                return report;
            }
            handles.clone()
        };

        for candidate in snapshot {
            if candidate.is_busy() || !candidate.is_idle_longer_than(threshold) {
                continue;
            }

            {
                let mut handles = self.write_handles();
                if handles.len() <= floor {
                    break;
                }
                if !candidate.try_claim() {
                    continue;
                }
                // Leased and returned since the first check.
                if !candidate.is_idle_longer_than(threshold) {
                    candidate.unclaim();
                    continue;
                }
                let before = handles.len();
                handles.retain(|h| !Arc::ptr_eq(h, &candidate));
                if handles.len() == before {
                    // Already removed by shutdown.
                    continue;
                }
            }

            report.evicted += 1;
            match candidate.connection().close() {
                Ok(()) => {
                    debug!(profile = %self.profile(), handle = candidate.id(), "evicted idle connection");
                }
                Err(reason) => {
                    let failure = PoolError::EvictionClose {
                        profile: self.profile().to_string(),
                        handle: candidate.id(),
                        reason,
                    };
                    error!(profile = %self.profile(), handle = candidate.id(), error = %failure, "eviction close failed");
                    report.failures.push(failure);
                }
            }
        }

        self.record_evictions(report.evicted);
        if report.evicted > 0 {
            info!(
                profile = %self.profile(),
                evicted = report.evicted,
                failed = report.failures.len(),
                remaining = self.active_count(),
                floor,
                "reaped idle connections"
            );
        }
        report
    }
}
