//! Cooperative shutdown signal.
//!
//! A cloneable flag plus a [`Notify`] so that long-running loops can both
//! poll (`is_triggered`) and await (`notified`) the request to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Cloneable shutdown token shared between a controller and its workers.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested.
    ///
    /// Returns immediately if the signal was already triggered.
    pub async fn notified(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
            if self.is_triggered() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shutdown_flag() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        let clone = shutdown.clone();
        clone.trigger();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiter() {
        let shutdown = Shutdown::new();
        let waiter = {
            let s = shutdown.clone();
            tokio::spawn(async move { s.notified().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();
        let joined = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn test_already_triggered_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_millis(50), shutdown.notified()).await;
        assert!(result.is_ok());
    }
}
