//! Directory-entry mutating verbs: `lookup`, `mknod`, `mkdir`, `symlink`,
//! `unlink`/`rmdir`, `rename`, `link`, `readlink`. Grounded in how
//! `tvix-castore`'s `fs/mod.rs` resolves names against its `InodeTracker`,
//! generalized from read-only lookups to full mutation against InodeStore.

use super::{require_child, require_inode, require_writable, FsOp, OpContext, OpReply};
use crate::error::{Error, Result};
use crate::model::{Inode, InodeId, Kind};

pub struct Lookup {
    pub parent_id: InodeId,
    pub name: String,
}

#[async_trait::async_trait]
impl FsOp for Lookup {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode = require_child(ctx.cache, self.parent_id, &self.name).await?;
        Ok(OpReply::Inode(inode))
    }
}

pub struct Readlink {
    pub inode_id: InodeId,
}

#[async_trait::async_trait]
impl FsOp for Readlink {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode = require_inode(ctx.cache, self.inode_id).await?;
        let target = inode.symlink_target.ok_or(Error::InvalidArg("not a symlink".into()))?;
        Ok(OpReply::Data(bytes::Bytes::from(target.into_bytes())))
    }
}

/// Appends `(name, child_id)` to `parent_id`'s entry set, failing if `name`
/// already exists. Reuses `list_children` + `replace_children` rather than
/// a dedicated single-row insert, since InodeStore's contract only offers
/// the atomic whole-set swap (spec §4.2); the parent's local mutex keeps
/// concurrent creates under the same parent from racing each other.
async fn link_child(cache: &crate::cache_manager::CacheManager, parent_id: InodeId, name: &str, child_id: InodeId) -> Result<()> {
    let _guard = cache.inode_mutex(parent_id).lock_owned().await;
    if cache.inode_store.get_by_path(parent_id, name).await?.is_some() {
        return Err(Error::Exists);
    }
    let mut children: Vec<(String, InodeId)> = cache
        .inode_store
        .list_children(parent_id)
        .await?
        .into_iter()
        .map(|e| (e.name, e.child_id))
        .collect();
    children.push((name.to_string(), child_id));
    cache.inode_store.replace_children(parent_id, children).await?;
    mark_dir_dirty(cache, parent_id).await
}

async fn unlink_child(cache: &crate::cache_manager::CacheManager, parent_id: InodeId, name: &str) -> Result<()> {
    let children: Vec<(String, InodeId)> = cache
        .inode_store
        .list_children(parent_id)
        .await?
        .into_iter()
        .filter(|e| e.name != name)
        .map(|e| (e.name, e.child_id))
        .collect();
    cache.inode_store.replace_children(parent_id, children).await?;
    cache.record_removed_name(parent_id, name.to_string());
    mark_dir_dirty(cache, parent_id).await
}

/// Marks a directory `data-dirty` after its entry set changes. Directories
/// carry no blocks for BlockStore-based dirty tracking to see (spec §3:
/// `size` is 0 for directories), so without this `PushUpstream`'s P7
/// idempotent-no-op check (`dirty_mask.is_clean()`) would treat a directory
/// with a brand-new child as already in sync with the remote.
async fn mark_dir_dirty(cache: &crate::cache_manager::CacheManager, parent_id: InodeId) -> Result<()> {
    cache
        .bump_and_save(parent_id, |i| i.dirty_mask.mark_data())
        .await
        .map(|_| ())
}

/// A freshly created file/directory/symlink has no `remote_ref` yet and
/// must not be mistaken for an already-synced object: without this,
/// `PushUpstream`'s P7 idempotent-no-op check (`dirty_mask.is_clean()`)
/// would treat it as nothing-to-do and it would never reach the remote.
async fn mark_new_inode_dirty(cache: &crate::cache_manager::CacheManager, inode_id: InodeId) -> Result<Inode> {
    cache.bump_and_save(inode_id, |i| i.dirty_mask.mark_data()).await
}

pub struct Mknod {
    pub parent_id: InodeId,
    pub name: String,
    pub mode: u32,
}

#[async_trait::async_trait]
impl FsOp for Mknod {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        let inode = Inode::new_file(0, self.parent_id, self.name.clone(), self.mode, ctx.uid, ctx.gid);
        let inserted = ctx.cache.inode_store.insert(inode).await?;
        link_child(ctx.cache, self.parent_id, &self.name, inserted.inode_id).await?;
        let inserted = mark_new_inode_dirty(ctx.cache, inserted.inode_id).await?;
        Ok(OpReply::Inode(inserted))
    }
}

pub struct Mkdir {
    pub parent_id: InodeId,
    pub name: String,
    pub mode: u32,
}

#[async_trait::async_trait]
impl FsOp for Mkdir {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        let inode = Inode::new_directory(0, Some(self.parent_id), Some(self.name.clone()), self.mode, ctx.uid, ctx.gid);
        let inserted = ctx.cache.inode_store.insert(inode).await?;
        link_child(ctx.cache, self.parent_id, &self.name, inserted.inode_id).await?;
        let inserted = mark_new_inode_dirty(ctx.cache, inserted.inode_id).await?;
        Ok(OpReply::Inode(inserted))
    }
}

pub struct Symlink {
    pub parent_id: InodeId,
    pub name: String,
    pub target: String,
}

#[async_trait::async_trait]
impl FsOp for Symlink {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        let inode = Inode::new_symlink(0, self.parent_id, self.name.clone(), self.target.clone(), ctx.uid, ctx.gid);
        let inserted = ctx.cache.inode_store.insert(inode).await?;
        link_child(ctx.cache, self.parent_id, &self.name, inserted.inode_id).await?;
        let inserted = mark_new_inode_dirty(ctx.cache, inserted.inode_id).await?;
        Ok(OpReply::Inode(inserted))
    }
}

/// Handles both `unlink` (file/symlink) and `rmdir` (empty directory only,
/// `Error::NotEmpty` otherwise) depending on `expect_dir`.
pub struct Remove {
    pub parent_id: InodeId,
    pub name: String,
    pub expect_dir: bool,
}

#[async_trait::async_trait]
impl FsOp for Remove {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        let target = require_child(ctx.cache, self.parent_id, &self.name).await?;
        match (self.expect_dir, target.kind) {
            (true, Kind::Directory) => {
                if !ctx.cache.inode_store.list_children(target.inode_id).await?.is_empty() {
                    return Err(Error::NotEmpty);
                }
            }
            (true, _) => return Err(Error::NotDir),
            (false, Kind::Directory) => return Err(Error::IsDir),
            (false, _) => {}
        }
        unlink_child(ctx.cache, self.parent_id, &self.name).await?;

        if target.nlink <= 1 {
            // POSIX unlink-while-open (spec §8 scenario 6): a process with
            // the file already open must keep reading it until its last
            // `release`. Dropping the name here is enough; `Release` does
            // the actual delete once `count_open_for_inode` hits zero.
            if ctx.handles.count_open_for_inode(target.inode_id) == 0 {
                ctx.cache.inode_store.delete(target.inode_id).await?;
                ctx.cache.block_store.purge_inode(target.inode_id).await?;
            } else {
                ctx.cache.bump_and_save(target.inode_id, |i| i.nlink = 0).await?;
            }
        } else {
            ctx.cache
                .bump_and_save(target.inode_id, |i| i.nlink = i.nlink.saturating_sub(1))
                .await?;
        }
        Ok(OpReply::Unit)
    }
}

pub struct Rename {
    pub old_parent: InodeId,
    pub old_name: String,
    pub new_parent: InodeId,
    pub new_name: String,
}

#[async_trait::async_trait]
impl FsOp for Rename {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        let moved = require_child(ctx.cache, self.old_parent, &self.old_name).await?;
        // POSIX rename(2): replacing an existing non-empty directory target
        // is an error; anything else at the destination is simply replaced.
        if let Some(existing) = ctx.cache.inode_store.get_by_path(self.new_parent, &self.new_name).await? {
            if existing.kind == Kind::Directory && !ctx.cache.inode_store.list_children(existing.inode_id).await?.is_empty() {
                return Err(Error::NotEmpty);
            }
            unlink_child(ctx.cache, self.new_parent, &self.new_name).await?;
            ctx.cache.inode_store.delete(existing.inode_id).await?;
            ctx.cache.block_store.purge_inode(existing.inode_id).await?;
        }

        unlink_child(ctx.cache, self.old_parent, &self.old_name).await?;
        link_child(ctx.cache, self.new_parent, &self.new_name, moved.inode_id).await?;
        ctx.cache
            .bump_and_save(moved.inode_id, |i| {
                i.parent_id = Some(self.new_parent);
                i.name_in_parent = Some(self.new_name.clone());
            })
            .await?;
        Ok(OpReply::Unit)
    }
}

/// Hard link: a second directory entry naming the same inode. The data
/// model's `parent_id`/`name_in_parent` remain the inode's *original*
/// parent (SyncEngine and `getattr`'s `..` convenience both treat it as
/// advisory), while `dir_entries` correctly holds both names — a
/// documented simplification, see DESIGN.md.
pub struct Link {
    pub inode_id: InodeId,
    pub new_parent: InodeId,
    pub new_name: String,
}

#[async_trait::async_trait]
impl FsOp for Link {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        let target = require_inode(ctx.cache, self.inode_id).await?;
        if target.kind == Kind::Directory {
            return Err(Error::IsDir);
        }
        link_child(ctx.cache, self.new_parent, &self.new_name, self.inode_id).await?;
        let updated = ctx.cache.bump_and_save(self.inode_id, |i| i.nlink += 1).await?;
        Ok(OpReply::Inode(updated))
    }
}
