use super::*;
use crate::block_store::BlockStore;
use crate::cache_manager::CacheManager;
use crate::config::Config;
use crate::coord_store::MemoryCoordStore;
use crate::handle_table::HandleTable;
use crate::inode_store::MemoryInodeStore;
use crate::model::ROOT_INODE;
use crate::sync_engine::SyncEngine;
use rstest::rstest;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn test_config() -> Config {
    Config {
        cache_root: std::path::PathBuf::from("/tmp/unused"),
        cache_bytes_max: 1024 * 1024,
        block_size: 16,
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

struct Harness {
    cache: Arc<CacheManager>,
    sync: Arc<SyncEngine>,
    handles: Arc<HandleTable>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn ctx(&self) -> OpContext<'_> {
        OpContext {
            cache: &self.cache,
            sync: &self.sync,
            handles: &self.handles,
            cancel: &self.cancel,
            uid: 0,
            gid: 0,
        }
    }
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let block_store = Arc::new(BlockStore::new(dir.path(), 16));
    let inode_store = Arc::new(MemoryInodeStore::new());
    let coord_store = Arc::new(MemoryCoordStore::new());
    let cfg = test_config();
    let cache = Arc::new(CacheManager::new(block_store, inode_store, coord_store, cfg.clone()));
    let remote = Arc::new(crate::remote::MemoryRemoteBackend::new());
    let executor = Arc::new(crate::executor::Executor::new(
        cfg.download_concurrency_global,
        cfg.download_concurrency_per_inode,
        cfg.upload_concurrency_global,
    ));
    let sync = Arc::new(SyncEngine::new(cache.clone(), remote, executor, cfg));
    Harness {
        cache,
        sync,
        handles: Arc::new(HandleTable::new()),
        cancel: CancellationToken::new(),
        _dir: dir,
    }
}

/// `rmdir` vs `unlink` against every (target kind, is-target-empty) pairing:
/// only an empty directory can satisfy `expect_dir = true`, and a directory
/// can never satisfy `expect_dir = false` regardless of emptiness.
#[rstest]
#[case::unlink_file(false, false, true)]
#[case::rmdir_empty_dir(true, true, true)]
#[case::rmdir_nonempty_dir(true, false, false)]
#[case::unlink_on_dir_is_rejected(false, true, false)]
#[tokio::test]
async fn remove_honors_expect_dir_matrix(#[case] expect_dir: bool, #[case] target_is_dir: bool, #[case] should_succeed: bool) {
    let h = harness().await;

    let name = "target";
    if target_is_dir {
        crate::fsops::Mkdir { parent_id: ROOT_INODE, name: name.into(), mode: 0o755 }
            .apply(h.ctx())
            .await
            .unwrap();
        // Give the "nonempty" case a child to make rmdir's NotEmpty path reachable.
        if !should_succeed && expect_dir {
            let OpReply::Inode(dir) = crate::fsops::Lookup { parent_id: ROOT_INODE, name: name.into() }.apply(h.ctx()).await.unwrap() else {
                panic!("expected Inode reply")
            };
            crate::fsops::Mknod { parent_id: dir.inode_id, name: "child".into(), mode: 0o644 }
                .apply(h.ctx())
                .await
                .unwrap();
        }
    } else {
        crate::fsops::Mknod { parent_id: ROOT_INODE, name: name.into(), mode: 0o644 }
            .apply(h.ctx())
            .await
            .unwrap();
    }

    let result = crate::fsops::Remove { parent_id: ROOT_INODE, name: name.into(), expect_dir }
        .apply(h.ctx())
        .await;
    assert_eq!(result.is_ok(), should_succeed);
}

#[tokio::test]
async fn mknod_result_is_immediately_visible_to_a_push() {
    let h = harness().await;
    let OpReply::Inode(inode) = crate::fsops::Mknod { parent_id: ROOT_INODE, name: "new.txt".into(), mode: 0o644 }
        .apply(h.ctx())
        .await
        .unwrap()
    else {
        panic!("expected Inode reply")
    };
    // A brand-new file must not be mistaken for already-synced (P7 applies
    // only after the first successful push).
    h.sync.push_upstream(inode.inode_id).await.unwrap();
    let updated = h.cache.inode_store.get(inode.inode_id).await.unwrap().unwrap();
    assert!(updated.remote_ref.is_some());
    assert!(updated.dirty_mask.is_clean());
}
