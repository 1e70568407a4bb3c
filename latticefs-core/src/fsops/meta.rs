//! `getattr`, `setattr`, `statfs`, `access` — the verbs spec §4.6 calls out
//! as "ordinary POSIX semantics", implemented directly against InodeStore.

use super::{require_inode, require_writable, FsOp, OpContext, OpReply};
use crate::error::{Error, Result};
use crate::model::{now_secs, InodeId};

pub struct GetAttr {
    pub inode_id: InodeId,
}

#[async_trait::async_trait]
impl FsOp for GetAttr {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        Ok(OpReply::Inode(require_inode(ctx.cache, self.inode_id).await?))
    }
}

/// Fields omitted (`None`) are left unchanged; this mirrors FUSE's
/// `setattr` callback, which receives a bitmask of which of `st_*` the
/// caller actually wants to change.
#[derive(Default)]
pub struct SetAttr {
    pub inode_id: InodeId,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

#[async_trait::async_trait]
impl FsOp for SetAttr {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        if let Some(size) = self.size {
            let inode = require_inode(ctx.cache, self.inode_id).await?;
            if size < inode.size {
                ctx.cache.truncate_blocks(self.inode_id, size).await?;
            } else if size > inode.size {
                let gap = size - inode.size;
                let block_size = ctx.cache.block_store.block_size();
                let zeros = vec![0u8; block_size.min(gap) as usize];
                let mut written = 0u64;
                while written < gap {
                    let take = (gap - written).min(block_size);
                    ctx.cache.stage_write(self.inode_id, inode.size + written, &zeros[..take as usize]).await?;
                    written += take;
                }
            }
        }
        let updated = ctx
            .cache
            .bump_and_save(self.inode_id, |i| {
                if let Some(mode) = self.mode {
                    i.mode = mode;
                    i.dirty_mask.mark_meta();
                }
                if let Some(uid) = self.uid {
                    i.uid = uid;
                    i.dirty_mask.mark_meta();
                }
                if let Some(gid) = self.gid {
                    i.gid = gid;
                    i.dirty_mask.mark_meta();
                }
                if let Some(size) = self.size {
                    i.size = size;
                    i.dirty_mask.mark_data();
                }
                i.atime = self.atime.unwrap_or(i.atime);
                i.mtime = self.mtime.unwrap_or(now_secs());
            })
            .await?;
        Ok(OpReply::Inode(updated))
    }
}

pub struct StatFs;

#[async_trait::async_trait]
impl FsOp for StatFs {
    async fn apply(&self, _ctx: OpContext<'_>) -> Result<OpReply> {
        // The remote object store has no fixed capacity; report a large
        // nominal size rather than fabricating a meaningful free-space
        // figure no caller can act on.
        Ok(OpReply::StatFs {
            blocks_total: u64::MAX / 4096,
            blocks_free: u64::MAX / 4096,
            files_total: u64::MAX,
            files_free: u64::MAX,
        })
    }
}

pub struct Access {
    pub inode_id: InodeId,
    pub mode: u32,
}

#[async_trait::async_trait]
impl FsOp for Access {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode = require_inode(ctx.cache, self.inode_id).await?;
        if ctx.uid == 0 {
            return Ok(OpReply::Unit);
        }
        let shift = if inode.uid == ctx.uid {
            6
        } else if inode.gid == ctx.gid {
            3
        } else {
            0
        };
        let granted = (inode.mode >> shift) & 0o7;
        if self.mode & !granted & 0o7 != 0 {
            return Err(Error::Permission);
        }
        Ok(OpReply::Unit)
    }
}
