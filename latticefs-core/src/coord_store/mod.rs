//! Ephemeral locks, counters and pub/sub (spec §4.3), the coordination
//! store external collaborator. Every lock is TTL-bounded so a crashed
//! holder cannot deadlock the fleet; callers are expected to pair every
//! `acquire` with a `release` on all exit paths (enforced by
//! [`Lease`]'s `Drop`, see `sync_engine`).

mod memory;
mod redis_backed;

pub use memory::MemoryCoordStore;
pub use redis_backed::RedisCoordStore;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio_stream::Stream;
use std::pin::Pin;

/// Opaque possession token returned by `acquire`, required by `release` so
/// a lock can't be stolen out from under its holder by a racing acquirer
/// that observed the same key after expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Attempts to acquire `lock_key` for `ttl`. `Ok(None)` means the lock
    /// is currently held by someone else (`BUSY` at the call site).
    async fn acquire(&self, lock_key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Releases `lock_key` iff `token` still matches what's stored; a
    /// mismatch (lock expired and was re-acquired by someone else) is a
    /// silent no-op, never an error — the caller no longer owns anything to
    /// release.
    async fn release(&self, lock_key: &str, token: &LockToken) -> Result<()>;

    async fn counter_incr(&self, key: &str, delta: i64) -> Result<i64>;

    async fn publish(&self, channel: &str, event: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Pin<Box<dyn Stream<Item = String> + Send>>>;

    /// Blocks until `n` parties have called `barrier` with the same `key`,
    /// or the TTL implied by the backend's configuration elapses.
    async fn barrier(&self, key: &str, n: usize, timeout: Duration) -> Result<()>;
}

/// RAII guard that releases a CoordStore lock on drop if it hasn't been
/// released already, so a panicking or early-returning caller can't leak a
/// held lock past its TTL cleanup.
pub struct LeaseGuard<'a> {
    store: &'a dyn CoordStore,
    key: String,
    token: Option<LockToken>,
}

impl<'a> LeaseGuard<'a> {
    pub fn new(store: &'a dyn CoordStore, key: String, token: LockToken) -> Self {
        Self {
            store,
            key,
            token: Some(token),
        }
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(token) = self.token.take() {
            self.store.release(&self.key, &token).await?;
        }
        Ok(())
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            // Best-effort: dropping without an explicit `release().await`
            // means an orphaned held lock until its TTL elapses. We can't
            // `.await` in `Drop`, so this only logs; normal code paths call
            // `release()` explicitly.
            tracing::warn!(key = %self.key, token = %token.0, "lease dropped without explicit release; relying on TTL expiry");
        }
    }
}
