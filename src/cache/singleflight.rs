//! Per-key single-flight primitive: at most one producer runs per key
//! concurrently; all concurrent callers for that key wait for the leader
//! and then re-check the cache. Needed because `Store::get_or_produce`
//! would otherwise let concurrent discovery of the same trial duplicate
//! external calls.
//!
//! This tracks only key *occupancy* (a key is pending or it isn't) plus a
//! `Notify` to wake followers; the produced value itself is never stored
//! here — it flows back through the caller's own cache write, keeping
//! this primitive generic without any `Any`-downcasting tricks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

pub struct SingleFlight {
    pending: Mutex<HashMap<String, Arc<Notify>>>,
}

pub enum Turn {
    /// This caller is the leader: run the producer, then call
    /// [`SingleFlight::finish`] to release the key and wake followers.
    Leader,
    /// Another caller is already producing for this key; wait on the
    /// returned `Notify` and then re-check the cache.
    Follower(Arc<Notify>),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    pub async fn enter(&self, key: &str) -> Turn {
        let mut pending = self.pending.lock().await;
        if let Some(notify) = pending.get(key) {
            Turn::Follower(notify.clone())
        } else {
            pending.insert(key.to_string(), Arc::new(Notify::new()));
            Turn::Leader
        }
    }

    pub async fn finish(&self, key: &str) {
        let notify = {
            let mut pending = self.pending.lock().await;
            pending.remove(key)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn only_one_leader_per_key_at_a_time() {
        let sf = Arc::new(SingleFlight::new());
        let leaders = Arc::new(AtomicUsize::new(0));

        let sf1 = sf.clone();
        let leaders1 = leaders.clone();
        let first = tokio::spawn(async move {
            if matches!(sf1.enter("k").await, Turn::Leader) {
                leaders1.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                sf1.finish("k").await;
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let turn = sf.enter("k").await;
        assert!(matches!(turn, Turn::Follower(_)));
        if let Turn::Follower(notify) = turn {
            notify.notified().await;
        }
        first.await.unwrap();
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_fresh_key_is_always_a_leader() {
        let sf = SingleFlight::new();
        assert!(matches!(sf.enter("a").await, Turn::Leader));
        sf.finish("a").await;
        assert!(matches!(sf.enter("a").await, Turn::Leader));
    }
}
