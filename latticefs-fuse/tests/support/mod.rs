//! In-memory `Engine` harness for driving `latticefs-fuse` end to end
//! without a kernel mount, the sqlite/redis backends, or a real HTTP
//! remote: adapted from `latticefs-core`'s own `sync_engine::tests::engine`
//! helper, but assembling a full `Engine` (cache + sync + handles) rather
//! than a bare `SyncEngine`.

use std::sync::Arc;

use latticefs_core::block_store::BlockStore;
use latticefs_core::cache_manager::CacheManager;
use latticefs_core::config::Config;
use latticefs_core::coord_store::MemoryCoordStore;
use latticefs_core::executor::Executor;
use latticefs_core::handle_table::HandleTable;
use latticefs_core::inode_store::MemoryInodeStore;
use latticefs_core::remote::MemoryRemoteBackend;
use latticefs_core::sync_engine::SyncEngine;
use latticefs_core::Engine;

use latticefs_core::error::Result;
use latticefs_core::fsops::{FsOp, OpContext, OpReply};
use tokio_util::sync::CancellationToken;

pub fn test_config(block_size: u64) -> Config {
    Config {
        cache_root: std::path::PathBuf::from("/tmp/unused"),
        cache_bytes_max: 1024 * 1024,
        block_size,
        block_ttl_secs: 300,
        network_timeout_secs: 30,
        remote_endpoint: "http://example.invalid".into(),
        root_capability: "URI:DIR2:root".into(),
        inode_store_url: "sqlite::memory:".into(),
        coord_store_url: "redis://127.0.0.1/".into(),
        lock_ttl_secs: 60,
        download_concurrency_global: 16,
        download_concurrency_per_inode: 4,
        upload_concurrency_global: 4,
        push_retry_attempts: 5,
        dirty_flush_interval_secs: 10,
        list_root: false,
    }
}

/// Builds an `Engine` wired entirely to in-process fakes, plus the
/// `MemoryRemoteBackend` and cache-root `TempDir` backing it so tests can
/// seed objects and inspect what got pushed.
pub async fn test_engine(block_size: u64) -> (Engine, Arc<MemoryRemoteBackend>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let block_store = Arc::new(BlockStore::new(dir.path(), block_size));
    let inode_store = Arc::new(MemoryInodeStore::new());
    let coord_store = Arc::new(MemoryCoordStore::new());
    let cfg = test_config(block_size);
    let cache = Arc::new(CacheManager::new(block_store, inode_store, coord_store, cfg.clone()));
    let remote = Arc::new(MemoryRemoteBackend::new());
    let executor = Arc::new(Executor::new(
        cfg.download_concurrency_global,
        cfg.download_concurrency_per_inode,
        cfg.upload_concurrency_global,
    ));
    let sync = Arc::new(SyncEngine::new(cache.clone(), remote.clone(), executor, cfg));
    let handles = Arc::new(HandleTable::new());
    (Engine { cache, sync, handles }, remote, dir)
}
