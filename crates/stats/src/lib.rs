//! Use counters keyed by an arbitrary resource id.
//!
//! Tracks how often each resource has been handed out so callers can
//! prefer the least-used one. Counts live behind a [`parking_lot`]
//! read-write lock; no lock is ever held across an await point.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::trace;
use waggle_tasks::Shutdown;

/// Use counters over keys of type `K`.
pub struct UseStats<K> {
    counts: RwLock<HashMap<K, u64>>,
    waiters: Mutex<HashMap<K, watch::Sender<bool>>>,
    shutdown: Shutdown,
}

impl<K> UseStats<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Seeds the counter for `key` and wakes a pending [`Self::wait_key`].
    /// Overwrites any previous count.
    pub fn init(&self, key: K, count: u64) {
        self.counts.write().insert(key.clone(), count);
        if let Some(tx) = self.waiters.lock().remove(&key) {
            let _ = tx.send(true);
        }
    }

    /// Increments the counter for `key`, creating it at zero first.
    /// Returns the new count.
    pub fn add_use(&self, key: &K) -> u64 {
        let mut counts = self.counts.write();
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Current count, zero when the key is unknown.
    pub fn get(&self, key: &K) -> u64 {
        self.counts.read().get(key).copied().unwrap_or(0)
    }

    pub fn remove(&self, key: &K) {
        self.counts.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.counts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.read().is_empty()
    }

    /// Snapshot of every counter.
    pub fn dump(&self) -> HashMap<K, u64> {
        self.counts.read().clone()
    }

    /// Stable ascending sort of `items` by the current count of the key
    /// each maps to. Ties keep their input order. Counts are read from
    /// one snapshot, so a concurrent `add_use` cannot tear the order.
    pub fn sort_by_use<R, F>(&self, items: &mut [R], key_fn: F)
    where
        F: Fn(&R) -> K,
    {
        let snapshot = self.dump();
        items.sort_by_key(|item| snapshot.get(&key_fn(item)).copied().unwrap_or(0));
    }

    /// Resolves once [`Self::init`] seeds `key` or the shutdown token
    /// fires. Immediate when the key is already tracked.
    pub async fn wait_key(&self, key: &K) {
        let mut rx = {
            let mut waiters = self.waiters.lock();
            // checked under the waiter lock: init inserts the count
            // before it takes this lock, so a present key is final
            if self.counts.read().contains_key(key) {
                return;
            }
            waiters
                .entry(key.clone())
                .or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };
        trace!("waiting for key initialisation");
        tokio::select! {
            res = rx.wait_for(|done| *done) => {
                let _ = res;
            }
            () = self.shutdown.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn stats() -> UseStats<&'static str> {
        UseStats::new(Shutdown::new())
    }

    #[test]
    fn counts_accumulate() {
        let s = stats();
        assert_eq!(s.get(&"a"), 0);
        assert_eq!(s.add_use(&"a"), 1);
        assert_eq!(s.add_use(&"a"), 2);
        s.init("b", 10);
        assert_eq!(s.add_use(&"b"), 11);
        assert_eq!(s.len(), 2);
        s.remove(&"a");
        assert_eq!(s.get(&"a"), 0);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn sort_is_stable_and_ascending() {
        let s = stats();
        s.init("a", 3);
        s.init("b", 1);
        s.init("c", 3);
        s.init("d", 0);
        let mut items = vec!["a", "b", "c", "d", "e"];
        s.sort_by_use(&mut items, |k| *k);
        // e is untracked and counts as zero; ties keep input order
        assert_eq!(items, vec!["d", "e", "b", "a", "c"]);
    }

    #[tokio::test]
    async fn wait_key_resolves_on_init() {
        let s = Arc::new(stats());
        let waiter = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            waiter.wait_key(&"x").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        s.init("x", 0);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_key_is_immediate_for_tracked_keys() {
        let s = stats();
        s.add_use(&"x");
        tokio::time::timeout(Duration::from_millis(50), s.wait_key(&"x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_key_observes_shutdown() {
        let shutdown = Shutdown::new();
        let s = Arc::new(UseStats::<&'static str>::new(shutdown.clone()));
        let waiter = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            waiter.wait_key(&"never").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
