//! Typed fan-out channel for peer and depth notifications.
//!
//! One writer, many subscribers. Each subscription carries its own
//! bounded buffer so a slow consumer only loses its own messages:
//! [`PubSub::publish`] waits up to the configured timeout per
//! subscriber, drops the message for whoever is still full and keeps
//! the subscription open. Per subscriber, delivered messages arrive in
//! publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

/// Fallback and minimum per-subscription buffer size.
pub const MIN_SUBSCRIPTION_BUFFER: usize = 16;

/// Default time budget per subscriber on publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Per-subscription buffer capacity, clamped to at least
    /// [`MIN_SUBSCRIPTION_BUFFER`].
    pub buffer: usize,
    /// How long a publish waits on one full subscriber before dropping
    /// the message for it.
    pub publish_timeout: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            buffer: MIN_SUBSCRIPTION_BUFFER,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl PubSubConfig {
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }
}

struct Shared<T> {
    config: PubSubConfig,
    subs: RwLock<HashMap<String, mpsc::Sender<T>>>,
    next_id: AtomicU64,
}

/// Single-writer fan-out channel.
pub struct PubSub<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PubSub<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> PubSub<T> {
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                subs: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a new subscriber with a fresh id and an empty buffer.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self
            .shared
            .next_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let capacity = self.shared.config.buffer.max(MIN_SUBSCRIPTION_BUFFER);
        let (tx, rx) = mpsc::channel(capacity);
        self.shared.subs.write().insert(id.clone(), tx);
        Subscription {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Delivers `msg` to every current subscriber, concurrently. Waits
    /// at most the configured publish timeout on each full buffer; the
    /// message is dropped for subscribers that stay full, and their
    /// subscription stays open. Returns the number of deliveries.
    pub async fn publish(&self, msg: T) -> usize {
        let targets: Vec<(String, mpsc::Sender<T>)> = self
            .shared
            .subs
            .read()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();

        let budget = self.shared.config.publish_timeout;
        let sends = targets.into_iter().map(|(id, tx)| {
            let msg = msg.clone();
            async move {
                match timeout(budget, tx.send(msg)).await {
                    Ok(Ok(())) => true,
                    // receiver gone, the subscription cleans itself up
                    Ok(Err(_)) => false,
                    Err(_) => {
                        warn!(subscription = %id, "subscriber buffer full, dropping message");
                        false
                    }
                }
            }
        });
        join_all(sends).await.iter().filter(|sent| **sent).count()
    }

    /// Closes every subscription. Buffered messages remain readable;
    /// `recv` returns `None` once they are drained.
    pub fn close(&self) {
        self.shared.subs.write().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subs.read().len()
    }
}

impl<T: Clone + Send + 'static> Default for PubSub<T> {
    fn default() -> Self {
        Self::new(PubSubConfig::default())
    }
}

/// Receiving end of one subscription.
pub struct Subscription<T> {
    id: String,
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next message, or `None` once the subscription is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// True once the publisher side is gone and the buffer is empty.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }

    /// Removes this subscription from the publisher. Idempotent.
    pub fn unsubscribe(&mut self) {
        self.shared.subs.write().remove(&self.id);
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shared.subs.write().remove(&self.id);
    }
}
