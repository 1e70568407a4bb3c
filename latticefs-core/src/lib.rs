//! Engine crate: block cache, inode store, coordination store and sync
//! engine for a content-addressed remote object store mounted locally. No
//! FUSE wire knowledge lives here — `latticefs-fuse` is the only crate that
//! knows about `fuse_backend_rs`.

pub mod block_store;
pub mod cache_manager;
pub mod config;
pub mod coord_store;
pub mod error;
pub mod executor;
pub mod fsops;
pub mod handle_table;
pub mod inode_store;
pub mod model;
pub mod remote;
pub mod sync_engine;

use std::sync::Arc;
use tracing::info;

pub use config::Config;
pub use error::{Error, Result};

/// Everything an FSOp needs, assembled once at mount time (spec §4's
/// composition root). Kept as a single struct so `latticefs-fuse`'s
/// `FileSystem` impl has exactly one thing to hold and clone into the
/// blocking bridge.
#[derive(Clone)]
pub struct Engine {
    pub cache: Arc<cache_manager::CacheManager>,
    pub sync: Arc<sync_engine::SyncEngine>,
    pub handles: Arc<handle_table::HandleTable>,
}

impl Engine {
    /// Wires up the full backend stack (sqlite InodeStore, redis CoordStore,
    /// HTTP RemoteBackend) from `config` and runs the startup consistency
    /// sweep before returning (spec §6).
    pub async fn connect(config: Config) -> Result<Self> {
        let block_store = Arc::new(block_store::BlockStore::new(&config.cache_root, config.block_size));
        let inode_store: Arc<dyn inode_store::InodeStore> =
            Arc::new(inode_store::SqliteInodeStore::connect(&config.inode_store_url).await?);
        let coord_store: Arc<dyn coord_store::CoordStore> =
            Arc::new(coord_store::RedisCoordStore::connect(&config.coord_store_url).await?);
        let remote: Arc<dyn remote::RemoteBackend> = Arc::new(remote::HttpRemoteBackend::new(
            config.remote_endpoint.clone(),
            config.network_timeout(),
        )?);
        let executor = Arc::new(executor::Executor::new(
            config.download_concurrency_global,
            config.download_concurrency_per_inode,
            config.upload_concurrency_global,
        ));

        let cache = Arc::new(cache_manager::CacheManager::new(
            block_store,
            inode_store,
            coord_store,
            config.clone(),
        ));
        let sync = Arc::new(sync_engine::SyncEngine::new(cache.clone(), remote, executor, config.clone()));
        let handles = Arc::new(handle_table::HandleTable::new());

        // The root inode always exists locally (InodeStore seeds it), but it
        // only knows the remote root capability once we tell it. Until this
        // runs, `pull_downstream(ROOT_INODE, ..)` would be a no-op (no
        // `remote_ref` to resolve against), so the mount would never see
        // anything the backend already has.
        let root = cache
            .inode_store
            .get(model::ROOT_INODE)
            .await?
            .ok_or_else(|| Error::Fatal("root inode missing after InodeStore init".into()))?;
        if root.remote_ref.as_ref().map(|r| r.as_str()) != Some(config.root_capability.as_str()) {
            cache
                .bump_and_save(model::ROOT_INODE, |i| {
                    i.remote_ref = Some(remote::RemoteRef(config.root_capability.clone()));
                })
                .await?;
        }

        let report = cache.startup_sweep().await?;
        info!(
            orphans_removed = report.orphans_removed,
            dirty_pending = report.dirty_inodes_pending_push.len(),
            "startup consistency sweep complete"
        );
        for inode_id in report.dirty_inodes_pending_push {
            // Best-effort: a failed resume push just leaves the inode dirty
            // for the next flush cycle or explicit fsync.
            if let Err(e) = sync.push_upstream(inode_id).await {
                tracing::warn!(inode_id, error = %e, "resume push of previously-dirty inode failed");
            }
        }

        Ok(Self { cache, sync, handles })
    }

    /// Pushes every inode with outstanding dirty bytes; called on a clean
    /// unmount (spec §6).
    pub async fn drain_dirty(&self) -> Result<()> {
        let sync = self.sync.clone();
        self.cache
            .drain_dirty(|inode_id| {
                let sync = sync.clone();
                async move { sync.push_upstream(inode_id).await }
            })
            .await
    }
}
