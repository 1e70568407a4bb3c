use super::*;
use crate::block_store::BlockStore;
use crate::cache_manager::CacheManager;
use crate::config::Config;
use crate::coord_store::MemoryCoordStore;
use crate::inode_store::MemoryInodeStore;
use crate::model::{Inode, ROOT_INODE};
use crate::remote::MemoryRemoteBackend;
use proptest::prelude::*;

fn test_config(block_size: u64) -> Config {
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

async fn engine(block_size: u64) -> (SyncEngine, Arc<MemoryRemoteBackend>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let block_store = Arc::new(BlockStore::new(dir.path(), block_size));
    let inode_store = Arc::new(MemoryInodeStore::new());
    let coord_store = Arc::new(MemoryCoordStore::new());
    let cfg = test_config(block_size);
    let cache = Arc::new(CacheManager::new(block_store, inode_store, coord_store, cfg.clone()));
    let remote = Arc::new(MemoryRemoteBackend::new());
    let executor = Arc::new(crate::executor::Executor::new(
        cfg.download_concurrency_global,
        cfg.download_concurrency_per_inode,
        cfg.upload_concurrency_global,
    ));
    let engine = SyncEngine::new(cache, remote.clone(), executor, cfg);
    (engine, remote, dir)
}

async fn new_file(engine: &SyncEngine, name: &str) -> InodeId {
    let inode = Inode::new_file(0, ROOT_INODE, name, 0o644, 0, 0);
    engine.cache.inode_store.insert(inode).await.unwrap().inode_id
}

#[tokio::test]
async fn push_upstream_uploads_dirty_file_and_clears_dirty_mask() {
    let (engine, remote, _dir) = engine(16).await;
    let inode_id = new_file(&engine, "a.txt").await;
    engine.cache.stage_write(inode_id, 0, b"hello world").await.unwrap();
    engine
        .cache
        .bump_and_save(inode_id, |i| {
            i.size = 11;
            i.dirty_mask.mark_data();
        })
        .await
        .unwrap();

    engine.push_upstream(inode_id).await.unwrap();

    let updated = engine.cache.inode_store.get(inode_id).await.unwrap().unwrap();
    assert!(updated.dirty_mask.is_clean());
    assert!(updated.remote_ref.is_some());
    let bytes = remote.get_object(updated.remote_ref.as_ref().unwrap(), None).await.unwrap();
    assert_eq!(&bytes[..], b"hello world");
}

#[tokio::test]
async fn push_upstream_is_a_no_op_on_clean_inode() {
    let (engine, _remote, _dir) = engine(16).await;
    let inode_id = new_file(&engine, "clean.txt").await;
    // Never marked dirty: push must return Ok without contacting remote.
    engine.push_upstream(inode_id).await.unwrap();
    let inode = engine.cache.inode_store.get(inode_id).await.unwrap().unwrap();
    assert_eq!(inode.version, 0);
}

#[tokio::test]
async fn concurrent_push_attempts_are_mutually_exclusive() {
    let (engine, _remote, _dir) = engine(16).await;
    let inode_id = new_file(&engine, "contended.txt").await;
    engine.cache.stage_write(inode_id, 0, b"data").await.unwrap();
    engine
        .cache
        .bump_and_save(inode_id, |i| {
            i.size = 4;
            i.dirty_mask.mark_data();
        })
        .await
        .unwrap();

    let lock_key = push_lock_key(inode_id);
    let token = engine
        .cache
        .coord_store
        .acquire(&lock_key, std::time::Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    // I5/P4: a second pusher must observe BUSY while the lock is held.
    let result = engine.push_upstream(inode_id).await;
    assert!(matches!(result, Err(Error::Busy)));

    engine.cache.coord_store.release(&lock_key, &token).await.unwrap();
    engine.push_upstream(inode_id).await.unwrap();
}

#[tokio::test]
async fn pull_downstream_hydrates_blocks_from_remote() {
    let (engine, remote, _dir) = engine(4).await;
    let remote_ref = crate::remote::RemoteRef("URI:MEM:seeded".into());
    remote.seed_object(remote_ref.clone(), Bytes::from_static(b"abcdefgh"));

    let mut inode = Inode::new_file(0, ROOT_INODE, "pulled.txt", 0o644, 0, 0);
    inode.remote_ref = Some(remote_ref);
    inode.size = 8;
    let inode_id = engine.cache.inode_store.insert(inode).await.unwrap().inode_id;

    engine.pull_downstream(inode_id, None).await.unwrap();

    let resolved = engine.cache.resolve_range(inode_id, 0, 8).await.unwrap();
    assert!(resolved.misses.is_empty());
    let blocks: std::collections::HashMap<_, _> = resolved.present.into_iter().collect();
    assert_eq!(&engine.cache.assemble(0, 8, &blocks)[..], b"abcdefgh");
}

#[tokio::test]
async fn pull_downstream_on_newly_created_inode_without_remote_ref_is_noop() {
    let (engine, _remote, _dir) = engine(16).await;
    let inode_id = new_file(&engine, "new.txt").await;
    // No remote_ref yet: must not error.
    engine.pull_downstream(inode_id, None).await.unwrap();
}

#[tokio::test]
async fn push_then_pull_round_trips_file_content() {
    let (engine, _remote, _dir) = engine(4).await;
    let inode_id = new_file(&engine, "roundtrip.txt").await;
    engine.cache.stage_write(inode_id, 0, b"roundtrip-bytes").await.unwrap();
    engine
        .cache
        .bump_and_save(inode_id, |i| {
            i.size = 15;
            i.dirty_mask.mark_data();
        })
        .await
        .unwrap();
    engine.push_upstream(inode_id).await.unwrap();

    // Simulate a fresh cache: purge local blocks, then pull them back.
    engine.cache.block_store.purge_inode(inode_id).await.unwrap();
    engine.pull_downstream(inode_id, None).await.unwrap();

    let resolved = engine.cache.resolve_range(inode_id, 0, 15).await.unwrap();
    let blocks: std::collections::HashMap<_, _> = resolved.present.into_iter().collect();
    assert_eq!(&engine.cache.assemble(0, 15, &blocks)[..], b"roundtrip-bytes");
}

#[tokio::test]
async fn rebase_reapplies_local_write_when_it_is_the_newer_mtime() {
    // Scenario 3 (spec §8): a writer's locally-acknowledged write must
    // survive a STALE rebase against content another writer already
    // pushed to the remote, as long as the local write is the newer one.
    let (engine, remote, _dir) = engine(4).await;
    let inode_id = new_file(&engine, "contested.txt").await;
    engine.cache.stage_write(inode_id, 0, b"LOCAL").await.unwrap();
    let pre_push = engine
        .cache
        .bump_and_save(inode_id, |i| {
            i.size = 5;
            i.mtime = 200;
            i.dirty_mask.mark_data();
        })
        .await
        .unwrap();

    // Simulate another writer's push having already landed upstream
    // between our snapshot and our own push attempt: the stored inode now
    // points at different remote content with an older mtime and a bumped
    // version (the condition that makes our eventual `InodeStore::update`
    // observe STALE).
    let other_ref = crate::remote::RemoteRef("URI:MEM:other-writer".into());
    remote.seed_object(other_ref.clone(), Bytes::from_static(b"OTHER"));
    let mut raced = pre_push.clone();
    raced.remote_ref = Some(other_ref);
    raced.mtime = 100;
    raced.dirty_mask.clear();
    engine.cache.inode_store.update(&raced, pre_push.version).await.unwrap();

    let rebased = engine.rebase(inode_id, &pre_push).await.unwrap();

    let resolved = engine.cache.resolve_range(inode_id, 0, rebased.size).await.unwrap();
    assert!(resolved.misses.is_empty());
    let blocks: std::collections::HashMap<_, _> = resolved.present.into_iter().collect();
    assert_eq!(&engine.cache.assemble(0, rebased.size, &blocks)[..], b"LOCAL");
}

#[tokio::test]
async fn push_exhausting_retries_against_unreachable_backend_latches_degraded_mode() {
    // Scenario 5 (spec §8): once retries are exhausted, `fsync`-triggered
    // pushes return the permanent error and the mount latches read-only.
    let (engine, remote, _dir) = engine(4).await;
    let inode_id = new_file(&engine, "doomed.txt").await;
    engine.cache.stage_write(inode_id, 0, b"data").await.unwrap();
    engine
        .cache
        .bump_and_save(inode_id, |i| {
            i.size = 4;
            i.dirty_mask.mark_data();
        })
        .await
        .unwrap();

    remote.set_unreachable(true);
    assert!(!engine.cache.is_degraded());

    let err = engine.push_upstream(inode_id).await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
    assert!(engine.cache.is_degraded());
}

proptest! {
    /// For any sequence of non-overlapping chunk writes assembled back
    /// together, pushing then re-pulling into a cleared cache must return
    /// exactly the bytes that were written (P1: no silent data loss across
    /// a push/pull cycle).
    #[test]
    fn push_pull_preserves_arbitrary_content(content in proptest::collection::vec(any::<u8>(), 1..200)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (engine, _remote, _dir) = engine(7).await;
            let inode_id = new_file(&engine, "prop.bin").await;
            engine.cache.stage_write(inode_id, 0, &content).await.unwrap();
            let len = content.len() as u64;
            engine
                .cache
                .bump_and_save(inode_id, |i| {
                    i.size = len;
                    i.dirty_mask.mark_data();
                })
                .await
                .unwrap();
            engine.push_upstream(inode_id).await.unwrap();

            engine.cache.block_store.purge_inode(inode_id).await.unwrap();
            engine.pull_downstream(inode_id, None).await.unwrap();

            let resolved = engine.cache.resolve_range(inode_id, 0, len).await.unwrap();
            prop_assert!(resolved.misses.is_empty());
            let blocks: std::collections::HashMap<_, _> = resolved.present.into_iter().collect();
            let assembled = engine.cache.assemble(0, len, &blocks);
            prop_assert_eq!(assembled.to_vec(), content);
            Ok(())
        })?;
    }
}
