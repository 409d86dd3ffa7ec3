//! Graceful shutdown coordination for long-lived connections.
//!
//! WebSocket handlers and long-polls register with the coordinator, watch
//! for the shutdown signal, and close cleanly before the HTTP server stops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    active: AtomicUsize,
}

/// Held by a registered connection. Dropping it marks the connection done.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a connection. The receiver flips to `true` on shutdown.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard {
            inner: self.inner.clone(),
        };
        (guard, self.inner.tx.subscribe())
    }

    /// Signal every registered connection to close.
    pub fn shutdown(&self) {
        tracing::debug!(active = self.active_count(), "signalling shutdown");
        self.inner.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.tx.borrow()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until every registered connection has finished, or `timeout`
    /// elapses. Returns `true` if all connections finished.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}
