//! Shutdown signalling shared by the long-running components.
//!
//! A [`Shutdown`] token is a cheaply-clonable handle over a watch
//! channel. Components hold a clone and either poll
//! [`Shutdown::is_cancelled`] in their loops or `select!` on
//! [`Shutdown::cancelled`]. Cancelling is idempotent and observed by
//! every clone, including ones created after the fact.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cooperative cancellation token.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signals every holder of this token to stop.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled. Resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for also checks the current value before waiting
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a named task, logging its start and end at trace level.
pub fn spawn_named<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::trace!(task = name, "task started");
        fut.await;
        tracing::trace!(task = name, "task finished");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancel_releases_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        assert!(!shutdown.is_cancelled());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_the_fact() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        // a clone taken after cancellation still observes it
        let late = shutdown.clone();
        tokio::time::timeout(Duration::from_secs(1), late.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        shutdown.cancel();
        assert!(shutdown.is_cancelled());
    }
}
