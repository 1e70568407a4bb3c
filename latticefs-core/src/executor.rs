//! The cooperative task runner SyncEngine schedules its work on (spec
//! §2/§4.8): a bounded `tokio` worker model, not a custom scheduler.
//! Downloads run with a global and a per-inode semaphore; uploads are
//! globally bounded and additionally serialized per inode by CoordStore
//! (I5/P4), independent of this in-process limit, so the single-upload
//! invariant holds even across multiple mount processes sharing a
//! CoordStore.

use crate::model::InodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

pub struct Executor {
    global_download: Semaphore,
    per_inode_download: Mutex<HashMap<InodeId, Arc<Semaphore>>>,
    per_inode_download_limit: usize,
    global_upload: Semaphore,
}

impl Executor {
    pub fn new(download_global: usize, download_per_inode: usize, upload_global: usize) -> Self {
        Self {
            global_download: Semaphore::new(download_global.max(1)),
            per_inode_download: Mutex::new(HashMap::new()),
            per_inode_download_limit: download_per_inode.max(1),
            global_upload: Semaphore::new(upload_global.max(1)),
        }
    }

    fn inode_download_semaphore(&self, inode_id: InodeId) -> Arc<Semaphore> {
        self.per_inode_download
            .lock()
            .entry(inode_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_inode_download_limit)))
            .clone()
    }

    /// Reaps the per-inode semaphore slot once nothing else references it,
    /// so long-lived mounts don't accumulate one entry per inode ever
    /// downloaded (spec §4.8 "reaped when idle").
    fn maybe_reap(&self, inode_id: InodeId, sem: &Arc<Semaphore>) {
        if Arc::strong_count(sem) == 2 {
            // One ref held by us, one by the map entry we're about to
            // remove; safe to drop if no task is mid-acquire elsewhere.
            let mut map = self.per_inode_download.lock();
            if let Some(entry) = map.get(&inode_id) {
                if Arc::strong_count(entry) <= 2 {
                    map.remove(&inode_id);
                }
            }
        }
    }

    /// Acquires both the global and per-inode download permits, holding
    /// both for the duration of the returned guard.
    pub async fn acquire_download(&self, inode_id: InodeId) -> DownloadPermit<'_> {
        let global = self.global_download.acquire().await.expect("semaphore not closed");
        let per_inode = self.inode_download_semaphore(inode_id);
        // `per_inode` must outlive the permit borrowed from it, so we hold
        // the Arc alongside an owned permit instead of a borrowed one.
        let owned = per_inode.clone().acquire_owned().await.expect("semaphore not closed");
        DownloadPermit {
            _global: global,
            _per_inode: owned,
            executor: self,
            inode_id,
            sem: per_inode,
        }
    }

    pub async fn acquire_upload(&self) -> SemaphorePermit<'_> {
        self.global_upload.acquire().await.expect("semaphore not closed")
    }
}

pub struct DownloadPermit<'a> {
    _global: SemaphorePermit<'a>,
    _per_inode: tokio::sync::OwnedSemaphorePermit,
    executor: &'a Executor,
    inode_id: InodeId,
    sem: Arc<Semaphore>,
}

impl Drop for DownloadPermit<'_> {
    fn drop(&mut self) {
        self.executor.maybe_reap(self.inode_id, &self.sem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_download_bounds_per_inode_concurrency() {
        let executor = Executor::new(16, 1, 4);
        let first = executor.acquire_download(1).await;
        let second = executor.acquire_download(1);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), second).await.is_err());
        drop(first);
    }

    #[tokio::test]
    async fn distinct_inodes_do_not_contend_per_inode_semaphore() {
        let executor = Executor::new(16, 1, 4);
        let _a = executor.acquire_download(1).await;
        let b = tokio::time::timeout(std::time::Duration::from_millis(50), executor.acquire_download(2)).await;
        assert!(b.is_ok());
    }
}
