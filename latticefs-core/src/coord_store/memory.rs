use super::{CoordStore, LockToken};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

struct Held {
    token: LockToken,
    expires_at: Instant,
}

/// An in-process stand-in for Redis-backed CoordStore, used by tests and by
/// single-process deployments that don't need cross-host coordination.
pub struct MemoryCoordStore {
    locks: Mutex<HashMap<String, Held>>,
    counters: Mutex<HashMap<String, i64>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    barriers: Mutex<HashMap<String, usize>>,
    next_token: AtomicU64,
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            barriers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for MemoryCoordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn acquire(&self, lock_key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get(lock_key) {
            if held.expires_at > now {
                return Ok(None);
            }
        }
        let id = self.next_token.fetch_add(1, Ordering::SeqCst);
        let token = LockToken(format!("tok-{id}"));
        locks.insert(
            lock_key.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, lock_key: &str, token: &LockToken) -> Result<()> {
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get(lock_key) {
            if held.token == *token {
                locks.remove(lock_key);
            }
        }
        Ok(())
    }

    async fn counter_incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut counters = self.counters.lock();
        let entry = counters.entry(key.to_string()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn publish(&self, channel: &str, event: &str) -> Result<()> {
        let _ = self.channel(channel).send(event.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Pin<Box<dyn Stream<Item = String> + Send>>> {
        let rx = self.channel(channel).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| item.ok());
        Ok(Box::pin(stream))
    }

    async fn barrier(&self, key: &str, n: usize, timeout: Duration) -> Result<()> {
        let arrived = {
            let mut barriers = self.barriers.lock();
            let entry = barriers.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if arrived >= n {
            self.barriers.lock().remove(key);
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let done = {
                let barriers = self.barriers.lock();
                !barriers.contains_key(key) || barriers.get(key).copied().unwrap_or(0) >= n
            };
            if done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(crate::error::Error::Busy);
            }
        }
    }
}

/// Shared handle convenience: most callers want an `Arc<MemoryCoordStore>`
/// so the same fake is reachable from multiple tasks in a test.
pub type SharedMemoryCoordStore = Arc<MemoryCoordStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_then_release_allows_reacquire() {
        let store = MemoryCoordStore::new();
        let token = store.acquire("k", Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(store.acquire("k", Duration::from_secs(5)).await.unwrap().is_none());
        store.release("k", &token).await.unwrap();
        assert!(store.acquire("k", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_with_wrong_token_is_noop() {
        let store = MemoryCoordStore::new();
        let token = store.acquire("k", Duration::from_secs(5)).await.unwrap().unwrap();
        store.release("k", &LockToken("bogus".into())).await.unwrap();
        // still held under the real token
        assert!(store.acquire("k", Duration::from_secs(5)).await.unwrap().is_none());
        store.release("k", &token).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let store = MemoryCoordStore::new();
        store.acquire("k", Duration::from_millis(1)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.acquire("k", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pubsub_delivers_published_events() {
        let store = MemoryCoordStore::new();
        let mut stream = store.subscribe("events").await.unwrap();
        store.publish("events", "hello").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "hello");
    }
}
