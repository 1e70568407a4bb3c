//! Composes BlockStore, InodeStore and CoordStore; enforces capacity, TTL,
//! dirty tracking and per-inode exclusion (spec §4.4). This is the busiest
//! module in the crate (SPEC_FULL budgets it 25% of the implementation) and
//! the one every FSOp goes through.

#[cfg(test)]
mod tests;

use crate::block_store::{BlockStore, ReadBlock};
use crate::config::Config;
use crate::coord_store::CoordStore;
use crate::error::{Error, Result};
use crate::inode_store::InodeStore;
use crate::model::{now_secs, BlockIndex, Inode, InodeId};
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// A block miss CacheManager couldn't satisfy locally; the caller (an
/// FSOp) is expected to route these through `SyncEngine::pull_downstream`.
#[derive(Debug, Clone, Copy)]
pub struct BlockMiss {
    pub index: BlockIndex,
}

/// Result of [`CacheManager::resolve_range`]: whichever blocks were already
/// fresh and present, plus the ones the caller must pull before the read
/// can complete.
pub struct RangeResolution {
    pub present: Vec<(BlockIndex, Bytes)>,
    pub misses: Vec<BlockMiss>,
}

/// Per-inode accounting the eviction policy needs: which blocks are
/// currently tracked in the LRU (so eviction can skip dirty ones without a
/// disk round-trip) and a running tally of dirty bytes (so the "all blocks
/// dirty" forced-flush path can pick the inode holding the most of them).
#[derive(Default)]
struct InodeAccounting {
    dirty_bytes: i64,
    /// Bumped on every `stage_write`. SyncEngine snapshots this before a
    /// push and compares after upload completes: if it's unchanged, no new
    /// writes raced the push and dirty state can be cleared; if it moved,
    /// the block must stay dirty for the next push attempt (spec §4.7
    /// `PushUpstream`'s `After` phase).
    write_generation: u64,
}

pub struct CacheManager {
    pub block_store: Arc<BlockStore>,
    pub inode_store: Arc<dyn InodeStore>,
    pub coord_store: Arc<dyn CoordStore>,
    config: Config,

    /// Approximate LRU over clean, present blocks only; dirty blocks are
    /// never inserted here, satisfying P3 structurally rather than by a
    /// runtime check at eviction time.
    clean_lru: Mutex<LruCache<(InodeId, BlockIndex), ()>>,
    /// Per-inode mutex for read-modify-write of inode metadata (spec
    /// §4.4's "per-inode exclusion"). Cross-host exclusion is CoordStore's
    /// job (pushes); this is purely a local concurrency guard.
    inode_locks: Mutex<HashMap<InodeId, Arc<tokio::sync::Mutex<()>>>>,
    dirty_bytes_total: AtomicI64,
    accounting: Mutex<HashMap<InodeId, InodeAccounting>>,
    /// Blocks marked stale by a CoordStore invalidation event, pending
    /// re-fetch on next access (spec §4.4 "Invalidation").
    stale: Mutex<HashSet<(InodeId, BlockIndex)>>,
    /// Names locally removed from a directory since its last successful
    /// push, so SyncEngine's rebase-on-STALE merge can tell "someone else
    /// added this remotely" (keep) apart from "I removed this name"
    /// (respect the removal) when it unions adds.
    pending_removed_names: Mutex<HashMap<InodeId, HashSet<String>>>,
    /// Latched once on permanent upstream failure (spec §7: retries
    /// exhausted on a push). Checked by every mutating FSOp; never cleared
    /// without a remount, since the spec gives no recovery path short of
    /// that.
    degraded: AtomicBool,
}

impl CacheManager {
    pub fn new(
        block_store: Arc<BlockStore>,
        inode_store: Arc<dyn InodeStore>,
        coord_store: Arc<dyn CoordStore>,
        config: Config,
    ) -> Self {
        let capacity = (config.cache_bytes_max / config.block_size).max(1) as usize;
        Self {
            block_store,
            inode_store,
            coord_store,
            config,
            clean_lru: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
            inode_locks: Mutex::new(HashMap::new()),
            dirty_bytes_total: AtomicI64::new(0),
            accounting: Mutex::new(HashMap::new()),
            stale: Mutex::new(HashSet::new()),
            pending_removed_names: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether the mount has entered read-only degraded mode (spec §7).
    /// Checked at the top of every mutating FSOp.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Latches the mount read-only and publishes a structured event so an
    /// operator-facing subscriber can alert on it. Idempotent: only the
    /// transition from writable to degraded logs/publishes; later calls
    /// (e.g. a second inode hitting the same outage) are silent no-ops.
    pub async fn enter_degraded_mode(&self, reason: impl Into<String>) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = reason.into();
        error!(reason = %reason, "mount entering read-only degraded mode");
        let _ = self.coord_store.publish("latticefs:events:degraded", &reason).await;
    }

    pub fn record_removed_name(&self, parent_id: InodeId, name: impl Into<String>) {
        self.pending_removed_names
            .lock()
            .entry(parent_id)
            .or_default()
            .insert(name.into());
    }

    pub fn removed_names(&self, parent_id: InodeId) -> HashSet<String> {
        self.pending_removed_names.lock().get(&parent_id).cloned().unwrap_or_default()
    }

    pub fn clear_removed_names(&self, parent_id: InodeId) {
        self.pending_removed_names.lock().remove(&parent_id);
    }

    /// Acquires the local per-inode mutex guarding metadata read-modify-
    /// write. Held for the duration of a single FSOp's critical section.
    pub fn inode_mutex(&self, inode_id: InodeId) -> Arc<tokio::sync::Mutex<()>> {
        self.inode_locks
            .lock()
            .entry(inode_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn block_covers(&self, offset: u64, length: u64) -> (BlockIndex, BlockIndex) {
        let block_size = self.config.block_size;
        let first = offset / block_size;
        let last = if length == 0 {
            first
        } else {
            (offset + length - 1) / block_size
        };
        (first, last)
    }

    fn is_fresh(&self, inode_id: InodeId, index: BlockIndex, last_access_ts: u64) -> bool {
        if self.stale.lock().contains(&(inode_id, index)) {
            return false;
        }
        now_secs().saturating_sub(last_access_ts) < self.config.block_ttl_secs
    }

    /// Given `(inode_id, offset, length)`, determines which covering
    /// blocks are present and fresh and which must be pulled. Does not
    /// itself call SyncEngine — that's the caller's job once misses are
    /// known, keeping this module free of a dependency on SyncEngine.
    #[instrument(skip(self))]
    pub async fn resolve_range(&self, inode_id: InodeId, offset: u64, length: u64) -> Result<RangeResolution> {
        if length == 0 {
            return Ok(RangeResolution {
                present: Vec::new(),
                misses: Vec::new(),
            });
        }
        let (first, last) = self.block_covers(offset, length);
        let mut present = Vec::new();
        let mut misses = Vec::new();
        for index in first..=last {
            match self.block_store.read_block(inode_id, index).await? {
                ReadBlock::Present { data, meta } if self.is_fresh(inode_id, index, meta.last_access_ts) => {
                    self.touch_clean(inode_id, index, meta.dirty);
                    present.push((index, data));
                }
                ReadBlock::Present { .. } | ReadBlock::Missing => {
                    misses.push(BlockMiss { index });
                }
            }
        }
        Ok(RangeResolution { present, misses })
    }

    /// Assembles bytes for `[offset, offset+length)` out of already-fetched
    /// blocks (the union of what `resolve_range` found present and what
    /// the caller subsequently pulled).
    pub fn assemble(&self, offset: u64, length: u64, blocks: &HashMap<BlockIndex, Bytes>) -> Bytes {
        let block_size = self.config.block_size;
        let mut out = BytesMut::with_capacity(length as usize);
        let (first, last) = self.block_covers(offset, length);
        for index in first..=last {
            let block_start = index * block_size;
            let Some(data) = blocks.get(&index) else {
                continue;
            };
            let lo = offset.max(block_start) - block_start;
            let hi = ((offset + length).min(block_start + block_size)) - block_start;
            if lo as usize >= data.len() {
                continue;
            }
            let hi = hi.min(data.len() as u64);
            out.extend_from_slice(&data[lo as usize..hi as usize]);
        }
        out.freeze()
    }

    fn touch_clean(&self, inode_id: InodeId, index: BlockIndex, dirty: bool) {
        if dirty {
            self.clean_lru.lock().pop(&(inode_id, index));
        } else {
            self.clean_lru.lock().put((inode_id, index), ());
        }
    }

    fn record_dirty_delta(&self, inode_id: InodeId, delta: i64) {
        self.dirty_bytes_total.fetch_add(delta, Ordering::Relaxed);
        self.accounting
            .lock()
            .entry(inode_id)
            .or_default()
            .dirty_bytes += delta;
    }

    /// Applies a write, staging it in BlockStore and marking the block
    /// dirty. Callers hold `inode_mutex(inode_id)` for the duration and are
    /// responsible for updating the Inode row's `size`/`mtime`/`ctime`/
    /// `version`/`dirty_mask` afterward (CacheManager only knows about
    /// blocks, not Inode rows, to keep those concerns separable).
    #[instrument(skip(self, data))]
    pub async fn stage_write(&self, inode_id: InodeId, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let block_size = self.config.block_size;
        let mut remaining = data;
        let mut cursor = offset;
        while !remaining.is_empty() {
            let index = cursor / block_size;
            let offset_in_block = (cursor % block_size) as u32;
            let room = (block_size - offset_in_block as u64) as usize;
            let take = remaining.len().min(room);
            let (chunk, rest) = remaining.split_at(take);

            self.ensure_capacity_for_write(inode_id).await?;
            let before = self.block_store.read_block(inode_id, index).await?;
            // `before_len` is the dirty-byte count this block already
            // contributed: a present-and-dirty block contributes its full
            // length (already counted by an earlier write), a present-but-
            // clean or missing block contributes nothing yet, since this
            // write is the one that dirties it.
            let before_len = match before {
                ReadBlock::Present { meta, .. } if meta.dirty => meta.length as i64,
                ReadBlock::Present { .. } => 0,
                ReadBlock::Missing => 0,
            };
            let meta = self.block_store.write_block(inode_id, index, offset_in_block, chunk).await?;
            let after_len = meta.length as i64;
            self.record_dirty_delta(inode_id, after_len - before_len);
            self.clean_lru.lock().pop(&(inode_id, index));

            cursor += take as u64;
            remaining = rest;
        }
        self.accounting.lock().entry(inode_id).or_default().write_generation += 1;
        Ok(())
    }

    /// Current write-generation counter for an inode, snapshotted by
    /// SyncEngine before a push to detect races with concurrent writers.
    pub fn write_generation(&self, inode_id: InodeId) -> u64 {
        self.accounting.lock().get(&inode_id).map(|a| a.write_generation).unwrap_or(0)
    }

    /// Drops blocks at or beyond `new_size // block_size` and shortens the
    /// final retained block's recorded length (spec §4.6 `truncate`).
    #[instrument(skip(self))]
    pub async fn truncate_blocks(&self, inode_id: InodeId, new_size: u64) -> Result<()> {
        let block_size = self.config.block_size;
        let keep_last_index = if new_size == 0 { None } else { Some((new_size - 1) / block_size) };
        for (index, meta) in self.block_store.iterate(inode_id).await? {
            if Some(index) < keep_last_index {
                continue;
            }
            if Some(index) == keep_last_index {
                let new_len = (new_size - index * block_size) as u32;
                if new_len < meta.length {
                    let before = meta.length as i64;
                    // Re-"write" zero-length at the new boundary by
                    // truncating the underlying file; simplest correct
                    // expression is a write_block of the retained prefix.
                    let kept = self
                        .block_store
                        .read_block(inode_id, index)
                        .await?;
                    if let ReadBlock::Present { data, .. } = kept {
                        let prefix = data.slice(0..new_len as usize);
                        let meta = self.block_store.write_block(inode_id, index, 0, &prefix).await?;
                        self.record_dirty_delta(inode_id, meta.length as i64 - before);
                    }
                }
                continue;
            }
            // index > keep_last_index: drop entirely.
            if meta.dirty {
                self.record_dirty_delta(inode_id, -(meta.length as i64));
            }
            self.clean_lru.lock().pop(&(inode_id, index));
            // evict() refuses dirty blocks; a truncated-away dirty block
            // has nothing left worth pushing, so purge unconditionally.
            self.block_store.purge_inode_block(inode_id, index).await?;
        }
        Ok(())
    }

    /// Marks blocks for `inode_id` stale (to be re-fetched on next access);
    /// called when CoordStore delivers a remote-mutation invalidation
    /// event (spec §4.4 "Invalidation").
    pub fn invalidate(&self, inode_id: InodeId, indices: impl IntoIterator<Item = BlockIndex>) {
        let mut stale = self.stale.lock();
        for index in indices {
            stale.insert((inode_id, index));
        }
    }

    pub fn clear_stale(&self, inode_id: InodeId, index: BlockIndex) {
        self.stale.lock().remove(&(inode_id, index));
    }

    /// After a successful pull, record the fetched block as clean-and-
    /// fresh in the LRU so later eviction can consider it.
    pub fn note_pulled(&self, inode_id: InodeId, index: BlockIndex) {
        self.clear_stale(inode_id, index);
        self.touch_clean(inode_id, index, false);
    }

    /// After a successful push, the pushed blocks are clean; update
    /// dirty-byte accounting (BlockStore's `mark_clean` already flipped
    /// the sidecar) and let them re-enter the clean LRU.
    pub fn note_pushed(&self, inode_id: InodeId, index: BlockIndex, len: u32) {
        self.record_dirty_delta(inode_id, -(len as i64));
        self.touch_clean(inode_id, index, false);
    }

    /// The inode currently holding the most dirty bytes, used by the
    /// forced-flush path when no clean blocks remain to evict.
    pub fn dirtiest_inode(&self) -> Option<InodeId> {
        self.accounting
            .lock()
            .iter()
            .filter(|(_, a)| a.dirty_bytes > 0)
            .max_by_key(|(_, a)| a.dirty_bytes)
            .map(|(id, _)| *id)
    }

    pub fn total_dirty_bytes(&self) -> i64 {
        self.dirty_bytes_total.load(Ordering::Relaxed)
    }

    fn estimated_used_bytes(&self) -> u64 {
        let clean = self.clean_lru.lock().len() as u64 * self.config.block_size;
        clean + self.total_dirty_bytes().max(0) as u64
    }

    /// Evicts LRU clean blocks until under `cache_bytes_max`, or forces a
    /// synchronous push of the dirtiest inode if no clean blocks remain
    /// (spec §4.4 "Eviction"). Pushing is delegated to the closure so this
    /// module doesn't need to depend on SyncEngine directly.
    #[instrument(skip(self, push_upstream))]
    pub async fn ensure_capacity<F, Fut>(&self, push_upstream: F) -> Result<()>
    where
        F: Fn(InodeId) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        while self.estimated_used_bytes() > self.config.cache_bytes_max {
            let victim = { self.clean_lru.lock().pop_lru() };
            match victim {
                Some(((inode_id, index), ())) => {
                    if let Err(e) = self.block_store.evict(inode_id, index).await {
                        warn!(error = %e, inode_id, index, "eviction of LRU candidate failed, skipping");
                    }
                }
                None => {
                    let Some(inode_id) = self.dirtiest_inode() else {
                        // Nothing clean, nothing dirty: cache usage must be
                        // an overestimate from stale accounting. Nothing
                        // more we can do.
                        break;
                    };
                    debug!(inode_id, "no clean blocks to evict, forcing synchronous push");
                    push_upstream(inode_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn ensure_capacity_for_write(&self, _inode_id: InodeId) -> Result<()> {
        // Writes themselves never block on eviction (a write must be
        // accepted locally per spec §5's durability guarantee); capacity is
        // instead reclaimed opportunistically via `ensure_capacity`, called
        // by FSOps on a cadence independent of any single write. This hook
        // exists so a future write-time backpressure policy has a single
        // call site to extend.
        Ok(())
    }

    /// Startup consistency sweep (spec §6): verify every on-disk block has
    /// an Inode row (I1), queue orphans for deletion, and report inodes
    /// whose dirty blocks or directory entries need a pending upstream plan.
    #[instrument(skip(self))]
    pub async fn startup_sweep(&self) -> Result<StartupSweepReport> {
        let mut orphans = Vec::new();
        let mut dirty_inodes = Vec::new();
        for inode_id in self.block_store.all_inode_ids().await? {
            match self.inode_store.get(inode_id).await? {
                Some(_) => {
                    let blocks = self.block_store.iterate(inode_id).await?;
                    if blocks.iter().any(|(_, m)| m.dirty) {
                        dirty_inodes.push(inode_id);
                    }
                }
                None => orphans.push(inode_id),
            }
        }
        for inode_id in &orphans {
            self.block_store.purge_inode(*inode_id).await?;
        }
        // Directories (and any inode whose dirty_mask survived an unclean
        // shutdown) have no blocks for the scan above to find; InodeStore's
        // persisted dirty_mask is authoritative for those (I3/I4).
        for inode_id in self.inode_store.list_dirty().await? {
            if !dirty_inodes.contains(&inode_id) {
                dirty_inodes.push(inode_id);
            }
        }
        Ok(StartupSweepReport {
            orphans_removed: orphans.len(),
            dirty_inodes_pending_push: dirty_inodes,
        })
    }

    /// Drains dirty state on a clean unmount: pushes every inode with
    /// outstanding dirty blocks or dirty directory entries.
    /// `push_upstream` is the caller's `SyncEngine::push_upstream`.
    #[instrument(skip(self, push_upstream))]
    pub async fn drain_dirty<F, Fut>(&self, push_upstream: F) -> Result<()>
    where
        F: Fn(InodeId) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut dirty_inodes: Vec<InodeId> = self
            .accounting
            .lock()
            .iter()
            .filter(|(_, a)| a.dirty_bytes > 0)
            .map(|(id, _)| *id)
            .collect();
        for inode_id in self.inode_store.list_dirty().await? {
            if !dirty_inodes.contains(&inode_id) {
                dirty_inodes.push(inode_id);
            }
        }
        for inode_id in dirty_inodes {
            push_upstream(inode_id).await?;
        }
        Ok(())
    }

    /// Bumps `version`, `mtime`/`ctime`, and the requested dirty bits on an
    /// Inode, then persists it with InodeStore's CAS, retrying the whole
    /// read-modify-write if another local writer raced in (the per-inode
    /// mutex makes this effectively single-threaded in practice, but a
    /// concurrent push rebase can still bump `version` out from under us).
    pub async fn bump_and_save<M>(&self, inode_id: InodeId, mutate: M) -> Result<Inode>
    where
        M: Fn(&mut Inode),
    {
        loop {
            let Some(mut inode) = self.inode_store.get(inode_id).await? else {
                return Err(Error::NotFound);
            };
            let expected_version = inode.version;
            mutate(&mut inode);
            inode.version = expected_version + 1;
            inode.ctime = now_secs();
            match self.inode_store.update(&inode, expected_version).await {
                Ok(()) => return Ok(inode),
                Err(Error::Stale) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct StartupSweepReport {
    pub orphans_removed: usize,
    pub dirty_inodes_pending_push: Vec<InodeId>,
}
