//! Durable map from `inode_id` to Inode rows and directory entries (spec
//! §4.2), the persistent metadata store external collaborator. `update` is
//! CAS on `version`: the optimistic-concurrency key the rest of the engine
//! builds its rebase-and-retry logic on.

mod memory;
mod sqlite;

pub use memory::MemoryInodeStore;
pub use sqlite::SqliteInodeStore;

use crate::error::Result;
use crate::model::{DirEntry, Inode, InodeId};
use async_trait::async_trait;

/// A transactional row store over Inode/DirEntry, matching spec §4.2's
/// required operation set.
#[async_trait]
pub trait InodeStore: Send + Sync {
    async fn get(&self, inode_id: InodeId) -> Result<Option<Inode>>;

    async fn get_by_path(&self, parent_id: InodeId, name: &str) -> Result<Option<Inode>>;

    /// Allocates a new `inode_id` and stores the row; `inode.inode_id` on
    /// entry is ignored (InodeStore is the sole source of new ids).
    async fn insert(&self, inode: Inode) -> Result<Inode>;

    /// CAS update keyed on `inode.version`. Fails with `Error::Stale` if the
    /// stored version doesn't match what the caller read.
    async fn update(&self, inode: &Inode, expected_version: u64) -> Result<()>;

    async fn delete(&self, inode_id: InodeId) -> Result<()>;

    async fn list_children(&self, parent_id: InodeId) -> Result<Vec<DirEntry>>;

    /// Atomically replaces a directory's entire entry set (I6/P6).
    async fn replace_children(&self, parent_id: InodeId, entries: Vec<(String, InodeId)>) -> Result<()>;

    /// Every inode whose `dirty_mask` is not clean. Directories have no
    /// blocks for BlockStore-based dirty-byte accounting to see, so this is
    /// the authoritative source `drain_dirty` and the startup sweep use to
    /// find directory mutations (new/removed children, renames) that still
    /// need a `PushUpstream`.
    async fn list_dirty(&self) -> Result<Vec<InodeId>>;
}
