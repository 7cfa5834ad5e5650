//! Cancellable timers keyed by task/offer/negotiation id.
//!
//! Each armed timer carries a generation number claimed under the registry
//! lock before its callback runs. Cancelling (or re-arming) the key bumps
//! the entry out, so a timer that fires late, after the corresponding
//! completion event, is a guaranteed no-op rather than a duplicate timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TimerRegistry {
    timers: Arc<Mutex<HashMap<String, ArmedTimer>>>,
    generations: AtomicU64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `key`, replacing any previous timer on the same key.
    /// `on_fire` runs only if the timer is still armed when it expires.
    pub fn arm<F, Fut>(&self, key: &str, after: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let fire_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let claimed = {
                let mut map = timers.lock();
                match map.get(&fire_key) {
                    Some(armed) if armed.generation == generation => {
                        map.remove(&fire_key);
                        true
                    }
                    _ => false,
                }
            };
            if claimed {
                on_fire().await;
            }
        });

        let mut map = self.timers.lock();
        if let Some(previous) = map.insert(key.to_string(), ArmedTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the timer for `key`. Returns whether a timer was armed.
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.lock().remove(key) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &str) -> bool {
        self.timers.lock().contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.lock().len()
    }

    /// Abort every armed timer. Used on shutdown.
    pub fn cancel_all(&self) {
        for (_, armed) in self.timers.lock().drain() {
            armed.handle.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once_after_delay() {
        let registry = TimerRegistry::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        registry.arm("task:t-1", Duration::from_secs(60), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!registry.is_armed("task:t-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let registry = TimerRegistry::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        registry.arm("task:t-1", Duration::from_secs(60), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.cancel("task:t-1"));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_supersedes_previous_generation() {
        let registry = TimerRegistry::new();
        let fired = Arc::new(AtomicU32::new(0));

        let first = Arc::clone(&fired);
        registry.arm("offer:o-1", Duration::from_secs(10), move || async move {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = Arc::clone(&fired);
        registry.arm("offer:o-1", Duration::from_secs(30), move || async move {
            second.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(31)).await;
        // Only the second arm may fire.
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn cancel_unknown_key_is_noop() {
        let registry = TimerRegistry::new();
        assert!(!registry.cancel("missing"));
    }
}
