//! Pool engine — owns the handles of one profile and lends them out.
//!
//! # Concurrency model
//!
//! - The handle collection is a `Vec<Arc<ConnectionHandle>>` behind a
//!   `std::sync::RwLock`. The free-handle scan takes the read lock and
//!   claims with a per-handle compare-and-swap, so concurrent acquirers
//!   never share a handle.
//! - Growth is serialized by `grow_lock`; the size check and the pushes
//!   happen under it, so two growers can never overshoot `max_pool_size`.
//! - Waiters park on a `Notify`. They register *before* scanning, so a
//!   release that lands between the scan and the wait is not lost.
//!   `release` wakes one waiter, growth and shutdown wake all of them.
//! - `release` never awaits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tidepool_core::PoolSettings;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::factory::{ConnectionFactory, SharedConnection};
use crate::handle::ConnectionHandle;
use crate::reaper::{self, ReaperHandle};

/// Point-in-time statistics for one pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pooled connections, busy or not.
    pub total: usize,
    /// Connections currently lent out.
    pub busy: usize,
    /// Connections free for the next acquire.
    pub idle: usize,
    /// Acquires that had to wait for a release.
    pub wait_count: u64,
    /// Acquires that gave up with `PoolExhausted`.
    pub timeouts: u64,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections removed by the reaper.
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    wait_count: AtomicU64,
    timeouts: AtomicU64,
    created: AtomicU64,
    evicted: AtomicU64,
}

/// A bounded pool of connections for a single profile.
pub struct PoolEngine {
    profile: String,
    settings: PoolSettings,
    factory: Arc<dyn ConnectionFactory>,
    handles: RwLock<Vec<Arc<ConnectionHandle>>>,
    /// Serializes the "claim, else grow or wait" decision.
    grow_lock: Mutex<()>,
    /// Signalled on release, growth, eviction and shutdown.
    available: Notify,
    next_id: AtomicU64,
    closed: AtomicBool,
    counters: Counters,
    reaper: std::sync::Mutex<Option<ReaperHandle>>,
}

impl PoolEngine {
    /// Build a pool and open `initial_pool_size` connections.
    ///
    /// No background reaper is started; call [`reap_idle`](Self::reap_idle)
    /// yourself or use [`start`](Self::start).
    pub fn new(
        profile: &str,
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> PoolResult<Self> {
        settings
            .validate()
            .map_err(|e| PoolError::PoolInitialization {
                profile: profile.to_string(),
                reason: e.to_string(),
            })?;

        let engine = Self {
            profile: profile.to_string(),
            settings,
            factory,
            handles: RwLock::new(Vec::new()),
            grow_lock: Mutex::new(()),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            reaper: std::sync::Mutex::new(None),
        };

        if let Err(e) = engine.grow_by(engine.settings.initial_pool_size) {
            let opened: Vec<Arc<ConnectionHandle>> = engine.write_handles().drain(..).collect();
            for handle in opened {
                if let Err(reason) = handle.connection().close() {
                    warn!(profile = %profile, handle = handle.id(), %reason, "failed to close connection after failed init");
                }
            }
            return Err(PoolError::PoolInitialization {
                profile: profile.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(engine)
    }

    /// Build a pool and spawn its idle reaper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        profile: &str,
        settings: PoolSettings,
        factory: Arc<dyn ConnectionFactory>,
    ) -> PoolResult<Arc<Self>> {
        let pool = Arc::new(Self::new(profile, settings, factory)?);
        let reaper = reaper::spawn(
            Arc::downgrade(&pool),
            pool.settings.reaper_initial_delay,
            pool.settings.idle_timeout,
        );
        *pool.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(reaper);

        info!(
            profile = %pool.profile,
            initial = pool.settings.initial_pool_size,
            max = pool.settings.max_pool_size,
            step = pool.settings.step_size,
            idle_timeout = ?pool.settings.idle_timeout,
            "connection pool started"
        );
        Ok(pool)
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Acquire a connection, waiting as long as it takes for one to free up.
    pub async fn acquire(&self) -> PoolResult<SharedConnection> {
        self.acquire_inner(None).await
    }

    /// Acquire a connection, giving up with [`PoolError::PoolExhausted`]
    /// once `timeout` has elapsed with the pool at capacity.
    pub async fn acquire_timeout(&self, timeout: Duration) -> PoolResult<SharedConnection> {
        self.acquire_inner(Some(timeout)).await
    }

    async fn acquire_inner(&self, timeout: Option<Duration>) -> PoolResult<SharedConnection> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut waited = false;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(conn) = self.try_claim_free() {
                return Ok(conn);
            }

            // The growth lock may be held across a slow factory, so waiting
            // for it counts against the deadline too.
            let grown = match deadline {
                None => self.claim_or_grow().await?,
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.claim_or_grow()).await {
                        Ok(grown) => grown?,
                        Err(_) => return Err(self.exhausted(started)),
                    }
                }
            };
            if let Some(conn) = grown {
                return Ok(conn);
            }

            if !waited {
                waited = true;
                self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    profile = %self.profile,
                    max = self.settings.max_pool_size,
                    "pool at capacity, waiting for a release"
                );
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(self.exhausted(started));
                    }
                }
            }
        }
    }

    fn exhausted(&self, started: Instant) -> PoolError {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        let waited = started.elapsed();
        warn!(
            profile = %self.profile,
            max = self.settings.max_pool_size,
            waited = ?waited,
            "connection pool exhausted"
        );
        PoolError::PoolExhausted {
            profile: self.profile.clone(),
            max: self.settings.max_pool_size,
            waited,
        }
    }

    /// Under the growth lock: claim a free handle, or grow by one step and
    /// claim from the new handles. `None` means the pool is at capacity (or
    /// the new handles were taken by others) and the caller should wait.
    async fn claim_or_grow(&self) -> PoolResult<Option<SharedConnection>> {
        let _guard = self.grow_lock.lock().await;
        self.ensure_open()?;

        if let Some(conn) = self.try_claim_free() {
            return Ok(Some(conn));
        }

        let count = self.active_count();
        let max = self.settings.max_pool_size;
        if count >= max {
            return Ok(None);
        }

        let step = self.settings.step_size.min(max - count);
        self.grow_by(step)?;
        Ok(self.try_claim_free())
    }

    /// Open `count` connections and add them one at a time, so connections
    /// opened before a factory failure stay in the pool.
    fn grow_by(&self, count: usize) -> PoolResult<usize> {
        let mut added = 0;
        let mut outcome = Ok(());

        for _ in 0..count {
            let conn = match self.factory.open(
                &self.settings.url,
                &self.settings.username,
                &self.settings.password,
            ) {
                Ok(conn) => conn,
                Err(reason) => {
                    outcome = Err(PoolError::ConnectionCreation {
                        profile: self.profile.clone(),
                        reason,
                    });
                    break;
                }
            };
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.write_handles()
                .push(Arc::new(ConnectionHandle::new(id, conn)));
            self.counters.created.fetch_add(1, Ordering::Relaxed);
            added += 1;
        }

        if added > 0 {
            self.available.notify_waiters();
            debug!(
                profile = %self.profile,
                added,
                total = self.active_count(),
                "grew connection pool"
            );
        }
        if let Err(e) = &outcome {
            warn!(profile = %self.profile, added, error = %e, "pool growth stopped early");
        }
        outcome.map(|()| added)
    }

    fn try_claim_free(&self) -> Option<SharedConnection> {
        let handles = self.read_handles();
        handles
            .iter()
            .find(|h| !h.is_busy() && h.acquire_lease().is_ok())
            .map(|h| {
                debug!(profile = %self.profile, handle = h.id(), "leased connection");
                Arc::clone(h.connection())
            })
    }

    /// Return a connection to the pool.
    ///
    /// Connections the pool does not own, or that are already free, are
    /// ignored with a warning.
    pub fn release(&self, conn: &SharedConnection) {
        let handle = {
            let handles = self.read_handles();
            match handles.iter().find(|h| h.wraps(conn)) {
                Some(h) => Arc::clone(h),
                None => {
                    warn!(
                        profile = %self.profile,
                        "release of a connection this pool does not own, ignoring"
                    );
                    return;
                }
            }
        };

        if !handle.is_busy() {
            warn!(
                profile = %self.profile,
                handle = handle.id(),
                "connection released while not leased, ignoring"
            );
            return;
        }

        // Checked under the write lock that `shutdown` partitions under, so
        // a handle is either freed before shutdown sees it or retired here.
        let retired = {
            let mut handles = self.write_handles();
            if self.closed.load(Ordering::Acquire) {
                let before = handles.len();
                handles.retain(|h| !Arc::ptr_eq(h, &handle));
                if handles.len() == before {
                    // Retired by a concurrent release.
                    return;
                }
                true
            } else {
                handle.release_lease();
                false
            }
        };
        if retired {
            if let Err(reason) = handle.connection().close() {
                warn!(profile = %self.profile, handle = handle.id(), %reason, "failed to close connection after shutdown");
            }
            return;
        }

        self.available.notify_one();
        debug!(profile = %self.profile, handle = handle.id(), "released connection");
    }

    /// Number of pooled connections, busy or not.
    pub fn active_count(&self) -> usize {
        self.read_handles().len()
    }

    pub fn stats(&self) -> PoolStats {
        let (total, busy) = {
            let handles = self.read_handles();
            (handles.len(), handles.iter().filter(|h| h.is_busy()).count())
        };
        PoolStats {
            total,
            busy,
            idle: total - busy,
            wait_count: self.counters.wait_count.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            profile = %self.profile,
            total = stats.total,
            busy = stats.busy,
            idle = stats.idle,
            wait_count = stats.wait_count,
            timeouts = stats.timeouts,
            created = stats.created,
            evicted = stats.evicted,
            "pool statistics"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the reaper, close every free connection, and fail all current
    /// and future acquires with [`PoolError::Closed`]. Busy connections
    /// are closed when they are released.
    ///
    /// Returns the number of connections closed now.
    pub async fn shutdown(&self) -> usize {
        let _guard = self.grow_lock.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        if let Some(reaper) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.stop();
        }

        let retired: Vec<Arc<ConnectionHandle>> = {
            let mut handles = self.write_handles();
            let (free, busy): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(|h| h.try_claim());
            *handles = busy;
            free
        };

        let mut closed = 0;
        for handle in &retired {
            match handle.connection().close() {
                Ok(()) => closed += 1,
                Err(reason) => {
                    warn!(profile = %self.profile, handle = handle.id(), %reason, "failed to close connection during shutdown")
                }
            }
        }

        self.available.notify_waiters();
        info!(
            profile = %self.profile,
            closed,
            still_leased = self.active_count(),
            "connection pool shut down"
        );
        closed
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed(self.profile.clone()));
        }
        Ok(())
    }

    pub(crate) fn read_handles(&self) -> RwLockReadGuard<'_, Vec<Arc<ConnectionHandle>>> {
        self.handles.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_handles(&self) -> RwLockWriteGuard<'_, Vec<Arc<ConnectionHandle>>> {
        self.handles.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        self.counters
            .evicted
            .fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            self.available.notify_waiters();
        }
    }
}

impl Drop for PoolEngine {
    fn drop(&mut self) {
        if let Some(reaper) = self
            .reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.stop();
        }
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl std::fmt::Debug for PoolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEngine")
            .field("profile", &self.profile)
            .field("settings", &self.settings)
            .field("total", &self.active_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
