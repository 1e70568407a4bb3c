//! Bidirectional reconciler between local cache and remote backend (spec
//! §4.7): `pull_downstream` hydrates the cache, `push_upstream` uploads
//! dirty state. Every call is framed by the hook triad (`Before`/main/
//! `After`) as an explicit three-phase sequence (spec §9, SPEC_FULL's
//! "REDESIGN FLAGS") rather than inheritance/overrides.

pub mod conflict;

#[cfg(test)]
mod tests;

use crate::block_store::ReadBlock;
use crate::cache_manager::CacheManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::model::{now_secs, Inode, InodeId, Kind};
use crate::remote::{RemoteBackend, RemoteDirEntry, RemoteNodeKind, RemoteRef};
use bytes::{Bytes, BytesMut};
use conflict::{ConflictPolicy, FileConflict, LastWriterWins};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Per-inode sync state, tracked only for observability (spec §4.7's state
/// diagram) — the actual concurrency control is CoordStore's lock plus
/// CacheManager's per-inode mutex; this enum is never consulted to decide
/// whether an operation may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Dirty,
    Pulling,
    Pushing,
    Rebasing,
    Deleting,
}

fn push_lock_key(inode_id: InodeId) -> String {
    format!("latticefs:push:{inode_id}")
}

fn pull_lease_key(inode_id: InodeId) -> String {
    format!("latticefs:pull:{inode_id}")
}

pub struct SyncEngine {
    pub cache: Arc<CacheManager>,
    pub remote: Arc<dyn RemoteBackend>,
    pub executor: Arc<Executor>,
    config: Config,
    conflict_policy: Arc<dyn ConflictPolicy>,
}

impl SyncEngine {
    pub fn new(cache: Arc<CacheManager>, remote: Arc<dyn RemoteBackend>, executor: Arc<Executor>, config: Config) -> Self {
        Self {
            cache,
            remote,
            executor,
            config,
            conflict_policy: Arc::new(LastWriterWins),
        }
    }

    pub fn with_conflict_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Hydrates the cache for `inode_id` from the remote backend. A `None`
    /// `block_range` means "the whole file" (or, for a directory, "the
    /// full listing").
    #[instrument(skip(self), fields(inode_id))]
    pub async fn pull_downstream(&self, inode_id: InodeId, block_range: Option<(u64, u64)>) -> Result<()> {
        // --- Before: acquire a shared pull lease (observability/fairness
        // accounting; pulls are not mutually exclusive, unlike pushes).
        let lease_key = pull_lease_key(inode_id);
        self.cache.coord_store.counter_incr(&lease_key, 1).await.ok();

        let result = self.pull_main(inode_id, block_range).await;

        // --- After: release lease, publish event regardless of outcome so
        // waiters aren't starved by a failed pull.
        self.cache.coord_store.counter_incr(&lease_key, -1).await.ok();
        let version = self.cache.inode_store.get(inode_id).await.ok().flatten().map(|i| i.version).unwrap_or(0);
        let _ = self
            .cache
            .coord_store
            .publish(&format!("latticefs:events:{inode_id}"), &format!("pulled:{version}"))
            .await;
        result
    }

    async fn pull_main(&self, inode_id: InodeId, block_range: Option<(u64, u64)>) -> Result<()> {
        let Some(inode) = self.cache.inode_store.get(inode_id).await? else {
            return Err(Error::NotFound);
        };
        let Some(remote_ref) = inode.remote_ref.clone() else {
            // Never pushed; nothing upstream to pull. Not an error: a
            // brand-new local file has no remote counterpart yet.
            return Ok(());
        };

        match inode.kind {
            Kind::Directory => self.pull_directory(&inode, &remote_ref).await,
            Kind::File => self.pull_file(&inode, &remote_ref, block_range).await,
            Kind::Symlink => Ok(()),
        }
    }

    async fn pull_file(&self, inode: &Inode, remote_ref: &RemoteRef, block_range: Option<(u64, u64)>) -> Result<()> {
        let block_size = self.cache.block_store.block_size();
        let (first, last) = match block_range {
            Some((offset, length)) if length > 0 => {
                let first = offset / block_size;
                let last = (offset + length - 1) / block_size;
                (first, last)
            }
            _ => {
                if inode.size == 0 {
                    return Ok(());
                }
                (0, (inode.size - 1) / block_size)
            }
        };

        for index in first..=last {
            let _permit = self.executor.acquire_download(inode.inode_id).await;
            let byte_offset = index * block_size;
            let byte_len = block_size.min(inode.size.saturating_sub(byte_offset));
            if byte_len == 0 {
                continue;
            }
            let bytes = self
                .remote
                .get_object(
                    remote_ref,
                    Some(crate::remote::ByteRange {
                        offset: byte_offset,
                        length: byte_len,
                    }),
                )
                .await?;
            let checksum = *blake3::hash(&bytes).as_bytes();
            self.cache
                .block_store
                .write_pulled_block(inode.inode_id, index, &bytes, Some(checksum))
                .await?;
            self.cache.note_pulled(inode.inode_id, index);
        }
        Ok(())
    }

    async fn pull_directory(&self, inode: &Inode, remote_ref: &RemoteRef) -> Result<()> {
        let entries = self.remote.get_dir(remote_ref).await?;
        let mut resolved = Vec::with_capacity(entries.len());
        for entry in entries {
            let child_id = match self.cache.inode_store.get_by_path(inode.inode_id, &entry.name).await? {
                Some(existing) => existing.inode_id,
                None => {
                    let kind = match entry.kind {
                        RemoteNodeKind::File => Kind::File,
                        RemoteNodeKind::Directory => Kind::Directory,
                        RemoteNodeKind::Symlink => Kind::Symlink,
                    };
                    let mut new_inode = match kind {
                        Kind::Directory => Inode::new_directory(0, Some(inode.inode_id), Some(entry.name.clone()), 0o755, inode.uid, inode.gid),
                        Kind::Symlink => Inode::new_symlink(0, inode.inode_id, entry.name.clone(), "", inode.uid, inode.gid),
                        Kind::File => Inode::new_file(0, inode.inode_id, entry.name.clone(), 0o644, inode.uid, inode.gid),
                    };
                    new_inode.remote_ref = Some(entry.child_ref.clone());
                    // Discovered from the remote listing, so it already
                    // mirrors upstream state: clean, not awaiting a push
                    // (unlike a locally `Mknod`/`Mkdir`/`Symlink`-created
                    // inode, which stays dirty until its first push).
                    new_inode.dirty_mask.clear();
                    let inserted = self.cache.inode_store.insert(new_inode).await?;
                    inserted.inode_id
                }
            };
            resolved.push((entry.name.clone(), child_id));
        }
        // I6/P6: replace the directory's entries atomically.
        self.cache.inode_store.replace_children(inode.inode_id, resolved).await
    }

    /// Uploads dirty blocks and/or directory mutations for `inode_id`,
    /// returning only once the remote side reflects them or the push has
    /// permanently failed (spec §4.7 `PushUpstream`).
    #[instrument(skip(self), fields(inode_id))]
    pub async fn push_upstream(&self, inode_id: InodeId) -> Result<()> {
        // --- Before: exclusive push lock (I5/P4), snapshot under the
        // local per-inode mutex.
        let lock_key = push_lock_key(inode_id);
        let Some(token) = self.cache.coord_store.acquire(&lock_key, self.config.lock_ttl()).await? else {
            return Err(Error::Busy);
        };

        let inode_mutex = self.cache.inode_mutex(inode_id);
        let _guard = inode_mutex.lock().await;

        let result = self.push_with_lock(inode_id).await;

        self.cache.coord_store.release(&lock_key, &token).await?;
        result
    }

    async fn push_with_lock(&self, inode_id: InodeId) -> Result<()> {
        let Some(inode) = self.cache.inode_store.get(inode_id).await? else {
            return Err(Error::NotFound);
        };

        // P7: idempotent no-op on an already-clean inode.
        if inode.dirty_mask.is_clean() {
            return Ok(());
        }

        let snapshot_generation = self.cache.write_generation(inode_id);

        let mut attempt = 0u32;
        let mut current_inode = inode;
        loop {
            let _upload_permit = self.executor.acquire_upload().await;
            let push_result = match current_inode.kind {
                Kind::File => self.push_file(&current_inode).await,
                Kind::Directory => self.push_directory(&current_inode).await,
                Kind::Symlink => Ok(current_inode.remote_ref.clone().unwrap_or(RemoteRef(String::new()))),
            };
            drop(_upload_permit);

            let new_remote_ref = match push_result {
                Ok(r) => r,
                Err(Error::BackendUnavailable(msg)) => {
                    // Spec §7/scenario 5: a reachability failure gets the
                    // same bounded-retry treatment as STALE before giving
                    // up; exhausting it is what "permanent failure" means
                    // here, not the first timeout.
                    attempt += 1;
                    if attempt > self.config.push_retry_attempts {
                        warn!(inode_id, attempt, "push exhausted retries against unreachable backend");
                        self.cache
                            .enter_degraded_mode(format!(
                                "inode {inode_id}: backend unavailable after {attempt} attempts: {msg}"
                            ))
                            .await;
                        return Err(Error::BackendUnavailable(msg));
                    }
                    info!(inode_id, attempt, "push observed BACKEND_UNAVAILABLE, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(50 * 2u64.pow(attempt.min(6)))).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut updated = current_inode.clone();
            updated.remote_ref = Some(new_remote_ref);
            updated.last_sync_ts = now_secs();
            updated.version = current_inode.version + 1;
            let still_dirty = self.cache.write_generation(inode_id) != snapshot_generation;
            if !still_dirty {
                updated.dirty_mask.clear();
            }

            match self.cache.inode_store.update(&updated, current_inode.version).await {
                Ok(()) => {
                    self.finish_push_after(inode_id, updated.version, still_dirty).await;
                    return Ok(());
                }
                Err(Error::Stale) => {
                    attempt += 1;
                    if attempt > self.config.push_retry_attempts {
                        warn!(inode_id, attempt, "push exhausted rebase retries");
                        self.cache
                            .enter_degraded_mode(format!("inode {inode_id}: exhausted rebase retries after {attempt} STALE conflicts"))
                            .await;
                        return Err(Error::Stale);
                    }
                    info!(inode_id, attempt, "push observed STALE, rebasing");
                    tokio::time::sleep(std::time::Duration::from_millis(50 * 2u64.pow(attempt.min(6)))).await;
                    current_inode = self.rebase(inode_id, &current_inode).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish_push_after(&self, inode_id: InodeId, new_version: u64, still_dirty: bool) {
        if !still_dirty {
            if let Ok(blocks) = self.cache.block_store.iterate(inode_id).await {
                for (index, meta) in blocks {
                    if meta.dirty {
                        let _ = self
                            .cache
                            .block_store
                            .mark_clean(inode_id, index, new_version, new_version, meta.checksum)
                            .await;
                        self.cache.note_pushed(inode_id, index, meta.length);
                    }
                }
            }
            self.cache.clear_removed_names(inode_id);
        }
        let _ = self
            .cache
            .coord_store
            .publish(&format!("latticefs:events:{inode_id}"), &format!("pushed:{new_version}"))
            .await;
    }

    async fn push_file(&self, inode: &Inode) -> Result<RemoteRef> {
        let bytes = self.assemble_full_file(inode).await?;
        Ok(self.remote.put_object(bytes).await?)
    }

    async fn assemble_full_file(&self, inode: &Inode) -> Result<Bytes> {
        let block_size = self.cache.block_store.block_size();
        let mut out = BytesMut::with_capacity(inode.size as usize);
        if inode.size == 0 {
            return Ok(out.freeze());
        }
        let last_index = (inode.size - 1) / block_size;
        for index in 0..=last_index {
            match self.cache.block_store.read_block(inode.inode_id, index).await? {
                ReadBlock::Present { data, .. } => out.extend_from_slice(&data),
                ReadBlock::Missing => {
                    // A dirty file should never have holes in its written
                    // range locally, but a partially-hydrated cache (some
                    // blocks never pulled) can still need assembling
                    // before push; pull the hole in before continuing.
                    self.pull_file(inode, inode.remote_ref.as_ref().ok_or(Error::NotFound)?, Some((index * block_size, block_size))).await?;
                    match self.cache.block_store.read_block(inode.inode_id, index).await? {
                        ReadBlock::Present { data, .. } => out.extend_from_slice(&data),
                        ReadBlock::Missing => {
                            return Err(Error::Fatal(format!(
                                "block {index} of inode {} unavailable locally and remotely",
                                inode.inode_id
                            )))
                        }
                    }
                }
            }
        }
        out.truncate(inode.size as usize);
        Ok(out.freeze())
    }

    async fn push_directory(&self, inode: &Inode) -> Result<RemoteRef> {
        // Children must have a remote_ref before the parent listing can
        // reference them; push any that don't, bottom-up.
        let children = self.cache.inode_store.list_children(inode.inode_id).await?;
        let mut entries = Vec::with_capacity(children.len());
        for entry in &children {
            let Some(child) = self.cache.inode_store.get(entry.child_id).await? else {
                continue;
            };
            let remote_ref = match child.remote_ref.clone() {
                Some(r) if child.dirty_mask.is_clean() => r,
                _ => {
                    Box::pin(self.push_upstream(entry.child_id)).await?;
                    self.cache
                        .inode_store
                        .get(entry.child_id)
                        .await?
                        .and_then(|c| c.remote_ref)
                        .ok_or_else(|| Error::Fatal(format!("child {} has no remote_ref after push", entry.child_id)))?
                }
            };
            entries.push(RemoteDirEntry {
                name: entry.name.clone(),
                child_ref: remote_ref,
                kind: match child.kind {
                    Kind::File => RemoteNodeKind::File,
                    Kind::Directory => RemoteNodeKind::Directory,
                    Kind::Symlink => RemoteNodeKind::Symlink,
                },
            });
        }
        let placeholder = inode.remote_ref.clone().unwrap_or(RemoteRef(String::new()));
        Ok(self.remote.put_dir(&placeholder, entries).await?)
    }

    /// On STALE: pull the latest remote state and merge it with the local
    /// mutation the push was attempting, per the configured
    /// [`ConflictPolicy`] (spec §4.7's rebase step).
    async fn rebase(&self, inode_id: InodeId, pre_push: &Inode) -> Result<Inode> {
        // Capture the locally-acknowledged write *before* pulling: a
        // directory's entry set is fetched fresh after the pull (no local
        // blocks to clobber), but a file's content lives in the same
        // BlockStore blocks `pull_downstream` is about to overwrite with
        // remote bytes. Reading them afterward would just compare the
        // remote copy against itself and the caller's write would vanish
        // without ever reaching the merge (spec §7).
        let local_bytes = match pre_push.kind {
            Kind::File => Some(self.assemble_full_file(pre_push).await?),
            _ => None,
        };

        self.pull_downstream(inode_id, None).await?;
        let Some(refreshed) = self.cache.inode_store.get(inode_id).await? else {
            return Err(Error::NotFound);
        };

        match pre_push.kind {
            Kind::File => {
                let local_bytes = local_bytes.expect("captured above for Kind::File");
                let remote_bytes = self.assemble_full_file(&refreshed).await?;
                let merged = self.conflict_policy.resolve_file(FileConflict {
                    local_bytes,
                    local_mtime: pre_push.mtime,
                    remote_bytes,
                    remote_mtime: refreshed.mtime,
                });
                // Re-stage the merge result as dirty so the next attempt's
                // `assemble_full_file` picks it up.
                self.cache.stage_write(inode_id, 0, &merged).await?;
                self.cache.truncate_blocks(inode_id, merged.len() as u64).await?;
                let mut result = refreshed.clone();
                result.size = merged.len() as u64;
                Ok(result)
            }
            Kind::Directory => {
                let local_entries: Vec<(String, u64)> = self
                    .cache
                    .inode_store
                    .list_children(inode_id)
                    .await?
                    .into_iter()
                    .map(|e| (e.name, e.child_id))
                    .collect();
                let remote_entries = match refreshed.remote_ref.as_ref() {
                    Some(r) => self.remote.get_dir(r).await?,
                    None => Vec::new(),
                };
                let removed = self.cache.removed_names(inode_id);
                let merged = self.conflict_policy.resolve_dir(local_entries, remote_entries, &removed);

                let mut final_entries = Vec::with_capacity(merged.len());
                for (name, local_id, remote_entry) in merged {
                    let child_id = if local_id != 0 {
                        local_id
                    } else {
                        // Newly-seen remote child: materialize a local
                        // inode for it so `final_entries` can reference a
                        // real inode id.
                        let kind = match remote_entry.kind {
                            RemoteNodeKind::File => Kind::File,
                            RemoteNodeKind::Directory => Kind::Directory,
                            RemoteNodeKind::Symlink => Kind::Symlink,
                        };
                        let mut new_inode = Inode::new_file(0, inode_id, name.clone(), 0o644, refreshed.uid, refreshed.gid);
                        new_inode.kind = kind;
                        new_inode.remote_ref = Some(remote_entry.child_ref.clone());
                        new_inode.dirty_mask.clear();
                        self.cache.inode_store.insert(new_inode).await?.inode_id
                    };
                    final_entries.push((name, child_id));
                }
                self.cache.inode_store.replace_children(inode_id, final_entries).await?;
                Ok(refreshed)
            }
            Kind::Symlink => Ok(refreshed),
        }
    }
}
