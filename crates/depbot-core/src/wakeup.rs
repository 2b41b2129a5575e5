//! Single-task wake-up queue shared by both schedulers.
//!
//! Holds at most one fire time per key. One background task sleeps until the
//! earliest entry or the arming horizon, whichever is sooner, and is woken
//! early whenever an entry is armed or disarmed. Entries further out than the
//! horizon are refused; the owner re-derives them on the periodic
//! [`Wake::Horizon`] tick.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake<K> {
    /// The key's fire time has passed. The entry is already removed.
    Due(K),
    /// A horizon interval elapsed; entries that were too far out may now fit.
    Horizon,
}

pub struct WakeQueue<K> {
    shared: Arc<Shared<K>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared<K> {
    entries: Mutex<HashMap<K, Instant>>,
    notify: Notify,
    horizon: Duration,
}

impl<K> WakeQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(horizon: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                horizon,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn horizon(&self) -> Duration {
        self.shared.horizon
    }

    /// Arm `key` to fire after `delay`, replacing any earlier entry. Returns
    /// false and leaves the key disarmed when `delay` exceeds the horizon.
    pub fn arm(&self, key: K, delay: Duration) -> bool {
        let mut entries = self.shared.entries.lock().unwrap_or_else(|e| e.into_inner());
        if delay > self.shared.horizon {
            entries.remove(&key);
            return false;
        }
        entries.insert(key, Instant::now() + delay);
        drop(entries);
        self.shared.notify.notify_one();
        true
    }

    pub fn disarm(&self, key: &K) {
        let removed = self
            .shared
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some();
        if removed {
            self.shared.notify.notify_one();
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the wake task. `on_wake` runs on the task itself and must not
    /// block; long work belongs in a spawned task. A second call is a no-op.
    pub fn start<F>(&self, on_wake: F)
    where
        F: Fn(Wake<K>) + Send + Sync + 'static,
    {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move { wake_loop(shared, on_wake).await }));
    }

    /// Stop the wake task and forget every entry.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.shared.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl<K> Drop for WakeQueue<K> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

async fn wake_loop<K, F>(shared: Arc<Shared<K>>, on_wake: F)
where
    K: Clone + Eq + Hash + Send + 'static,
    F: Fn(Wake<K>) + Send + Sync + 'static,
{
    let mut horizon_at = Instant::now() + shared.horizon;
    loop {
        let earliest = shared
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .min()
            .copied();
        let deadline = earliest.map_or(horizon_at, |at| at.min(horizon_at));

        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = shared.notify.notified() => continue,
        }

        let now = Instant::now();
        let due: Vec<K> = {
            let mut entries = shared.entries.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<K> = entries
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for k in &keys {
                entries.remove(k);
            }
            keys
        };
        for key in due {
            on_wake(Wake::Due(key));
        }
        if now >= horizon_at {
            debug!("wake queue horizon tick");
            horizon_at = now + shared.horizon;
            on_wake(Wake::Horizon);
        }
    }
}

/// Keys whose fire is currently executing. A key is claimed for the life of
/// the returned [`Running`] guard.
pub struct InFlight<K> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K: Clone + Eq + Hash> InFlight<K> {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim `key`, or `None` when it is already running.
    pub fn claim(&self, key: K) -> Option<Running<K>> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(Running {
            keys: Arc::clone(&self.keys),
            key,
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).contains(key)
    }
}

impl<K: Clone + Eq + Hash> Default for InFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Running<K: Eq + Hash> {
    keys: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for Running<K> {
    fn drop(&mut self) {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn started(horizon: Duration) -> (WakeQueue<&'static str>, mpsc::UnboundedReceiver<Wake<&'static str>>) {
        let q = WakeQueue::new(horizon);
        let (tx, rx) = mpsc::unbounded_channel();
        q.start(move |w| {
            let _ = tx.send(w);
        });
        (q, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_in_order_once() {
        let (q, mut rx) = started(Duration::from_secs(3600));
        assert!(q.arm("b", Duration::from_secs(20)));
        assert!(q.arm("a", Duration::from_secs(10)));

        assert_eq!(rx.recv().await, Some(Wake::Due("a")));
        assert_eq!(rx.recv().await, Some(Wake::Due("b")));
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_and_disarm_cancels() {
        let (q, mut rx) = started(Duration::from_secs(3600));
        q.arm("a", Duration::from_secs(100));
        q.arm("a", Duration::from_secs(5));
        q.arm("b", Duration::from_secs(6));
        q.disarm(&"b");
        assert_eq!(q.len(), 1);

        let start = Instant::now();
        assert_eq!(rx.recv().await, Some(Wake::Due("a")));
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_beyond_horizon_and_ticks() {
        let (q, mut rx) = started(Duration::from_secs(60));
        assert!(!q.arm("far", Duration::from_secs(61)));
        assert!(!q.is_armed(&"far"));

        assert_eq!(rx.recv().await, Some(Wake::Horizon));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_firing() {
        let (q, mut rx) = started(Duration::from_secs(3600));
        q.arm("a", Duration::from_secs(1));
        q.shutdown();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert!(q.is_empty());
    }

    #[test]
    fn in_flight_claims_once_until_released() {
        let running = InFlight::new();
        let guard = running.claim("a").unwrap();
        assert!(running.claim("a").is_none());
        assert!(running.contains(&"a"));
        assert!(running.claim("b").is_some());

        drop(guard);
        assert!(!running.contains(&"a"));
        assert!(running.claim("a").is_some());
    }
}
