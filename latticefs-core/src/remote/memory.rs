use super::{ByteRange, RemoteBackend, RemoteDirEntry, RemoteRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

enum Stored {
    Object(Bytes),
    Dir(Vec<RemoteDirEntry>),
}

/// An in-process stand-in for the remote backend, used by tests exercising
/// BlockStore, CacheManager and SyncEngine without a network.
pub struct MemoryRemoteBackend {
    objects: Mutex<HashMap<String, Stored>>,
    next_id: AtomicU64,
    /// Test-only fault injection: once set, every write op fails as if the
    /// backend were unreachable, so SyncEngine's retry-exhaustion/degraded-
    /// mode path (spec §7 scenario 5) can be exercised without a network.
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryRemoteBackend {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Test helper: make every subsequent `put_object`/`put_dir` fail with
    /// `BACKEND_UNAVAILABLE`, simulating an unreachable remote.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail_writes.store(unreachable, Ordering::Relaxed);
    }

    fn alloc_ref(&self) -> RemoteRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        RemoteRef(format!("URI:MEM:{id}"))
    }

    /// Test helper: seed a known capability with object bytes.
    pub fn seed_object(&self, r: RemoteRef, bytes: Bytes) {
        self.objects.lock().insert(r.0, Stored::Object(bytes));
    }

    /// Test helper: seed a known capability with a directory listing.
    pub fn seed_dir(&self, r: RemoteRef, entries: Vec<RemoteDirEntry>) {
        self.objects.lock().insert(r.0, Stored::Dir(entries));
    }
}

impl Default for MemoryRemoteBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemoteBackend {
    async fn get_object(&self, r: &RemoteRef, range: Option<ByteRange>) -> Result<Bytes> {
        let objects = self.objects.lock();
        match objects.get(&r.0) {
            Some(Stored::Object(bytes)) => {
                let bytes = bytes.clone();
                Ok(match range {
                    Some(range) => {
                        let start = (range.offset as usize).min(bytes.len());
                        let end = (start + range.length as usize).min(bytes.len());
                        bytes.slice(start..end)
                    }
                    None => bytes,
                })
            }
            Some(Stored::Dir(_)) => Err(Error::IsDir),
            None => Err(Error::NotFound),
        }
    }

    async fn put_object(&self, bytes: Bytes) -> Result<RemoteRef> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::BackendUnavailable("simulated unreachable backend".into()));
        }
        let r = self.alloc_ref();
        self.objects.lock().insert(r.0.clone(), Stored::Object(bytes));
        Ok(r)
    }

    async fn get_dir(&self, r: &RemoteRef) -> Result<Vec<RemoteDirEntry>> {
        let objects = self.objects.lock();
        match objects.get(&r.0) {
            Some(Stored::Dir(entries)) => Ok(entries.clone()),
            Some(Stored::Object(_)) => Err(Error::NotDir),
            None => Err(Error::NotFound),
        }
    }

    async fn put_dir(&self, _r: &RemoteRef, entries: Vec<RemoteDirEntry>) -> Result<RemoteRef> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::BackendUnavailable("simulated unreachable backend".into()));
        }
        let r = self.alloc_ref();
        self.objects.lock().insert(r.0.clone(), Stored::Dir(entries));
        Ok(r)
    }

    async fn delete(&self, r: &RemoteRef) -> Result<()> {
        self.objects.lock().remove(&r.0);
        Ok(())
    }
}
