//! Mock connections and factory shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::factory::{Connection, ConnectionFactory, SharedConnection};

#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
    pub closed: AtomicBool,
    pub fail_close: AtomicBool,
}

impl MockConnection {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
        }
    }
}

impl Connection for MockConnection {
    fn close(&self) -> Result<(), String> {
        if self.fail_close.load(Ordering::Relaxed) {
            return Err("socket already reset".to_string());
        }
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Counts opens and closes; can be told to fail opening after N successes,
/// to block on every open, or to hand out connections whose close fails.
pub struct MockFactory {
    opened: AtomicU64,
    fail_after: AtomicU64,
    fail_close: AtomicBool,
    open_delay_ms: AtomicU64,
    connections: std::sync::Mutex<Vec<Arc<MockConnection>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            opened: AtomicU64::new(0),
            fail_after: AtomicU64::new(u64::MAX),
            fail_close: AtomicBool::new(false),
            open_delay_ms: AtomicU64::new(0),
            connections: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn opens(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Let `n` more opens succeed, then refuse.
    pub fn fail_after(&self, n: u64) {
        self.fail_after.store(self.opens() + n, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.fail_after.store(u64::MAX, Ordering::SeqCst);
    }

    /// Block the calling thread for `delay` on every later open.
    pub fn slow_open(&self, delay: Duration) {
        self.open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
        for conn in self.connections.lock().unwrap().iter() {
            conn.fail_close.store(fail, Ordering::Relaxed);
        }
    }

    pub fn closed_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.closed.load(Ordering::Relaxed))
            .count()
    }
}

impl ConnectionFactory for MockFactory {
    fn open(&self, _url: &str, _username: &str, _password: &str) -> Result<SharedConnection, String> {
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.opens() >= self.fail_after.load(Ordering::SeqCst) {
            return Err("connection refused".to_string());
        }
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Arc::new(MockConnection::new(id));
        conn.fail_close
            .store(self.fail_close.load(Ordering::SeqCst), Ordering::Relaxed);
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}
