//! Connection handle — one physical connection plus lease bookkeeping.
//!
//! The busy flag is an `AtomicBool` claimed with compare-and-swap, so a
//! lease can never be granted twice. The last-active time is stored as
//! nanoseconds since the handle was created, which keeps the timestamp
//! lock-free as well.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{PoolError, PoolResult};
use crate::factory::SharedConnection;

/// A pooled connection with busy/idle tracking.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    connection: SharedConnection,
    busy: AtomicBool,
    created_at: Instant,
    /// Last acquire or release, as nanos since `created_at`.
    last_active_nanos: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(id: u64, connection: SharedConnection) -> Self {
        Self {
            id,
            connection,
            busy: AtomicBool::new(false),
            created_at: Instant::now(),
            last_active_nanos: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    /// Whether this handle wraps exactly `conn` (pointer identity).
    pub fn wraps(&self, conn: &SharedConnection) -> bool {
        Arc::ptr_eq(&self.connection, conn)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Mark the handle busy and refresh its timestamp.
    ///
    /// Fails with [`PoolError::AlreadyBusy`] if another caller holds it.
    pub fn acquire_lease(&self) -> PoolResult<()> {
        if !self.try_claim() {
            return Err(PoolError::AlreadyBusy(self.id));
        }
        self.touch();
        Ok(())
    }

    /// Refresh the timestamp and clear the busy flag.
    pub fn release_lease(&self) {
        self.touch();
        self.busy.store(false, Ordering::Release);
    }

    /// Time since the last acquire or release.
    pub fn idle_for(&self) -> Duration {
        let last = self.created_at
            + Duration::from_nanos(self.last_active_nanos.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }

    pub fn is_idle_longer_than(&self, threshold: Duration) -> bool {
        self.idle_for() > threshold
    }

    /// Claim without touching the timestamp.
    pub(crate) fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a [`try_claim`](Self::try_claim) without touching the timestamp.
    pub(crate) fn unclaim(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn touch(&self) {
        let nanos = Instant::now()
            .saturating_duration_since(self.created_at)
            .as_nanos() as u64;
        self.last_active_nanos.store(nanos, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new(7, Arc::new(MockConnection::new(7)))
    }

    #[test]
    fn new_handle_is_free() {
        let h = handle();
        assert_eq!(h.id(), 7);
        assert!(!h.is_busy());
    }

    #[test]
    fn acquire_then_release() {
        let h = handle();
        h.acquire_lease().unwrap();
        assert!(h.is_busy());
        h.release_lease();
        assert!(!h.is_busy());
    }

    #[test]
    fn second_lease_is_rejected() {
        let h = handle();
        h.acquire_lease().unwrap();
        let err = h.acquire_lease().unwrap_err();
        assert!(matches!(err, PoolError::AlreadyBusy(7)));
    }

    #[test]
    fn wraps_matches_identity_not_equality() {
        let conn: SharedConnection = Arc::new(MockConnection::new(1));
        let other: SharedConnection = Arc::new(MockConnection::new(1));
        let h = ConnectionHandle::new(1, conn.clone());
        assert!(h.wraps(&conn));
        assert!(!h.wraps(&other));
    }

    #[test]
    fn claim_and_unclaim() {
        let h = handle();
        assert!(h.try_claim());
        assert!(!h.try_claim());
        h.unclaim();
        assert!(h.try_claim());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_duration_tracks_last_activity() {
        let h = handle();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(h.is_idle_longer_than(Duration::from_secs(4)));
        assert!(!h.is_idle_longer_than(Duration::from_secs(5)));

        h.acquire_lease().unwrap();
        assert!(!h.is_idle_longer_than(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(3)).await;
        h.release_lease();
        assert_eq!(h.idle_for(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn try_claim_keeps_timestamp() {
        let h = handle();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(h.try_claim());
        assert!(h.is_idle_longer_than(Duration::from_secs(9)));
    }
}
