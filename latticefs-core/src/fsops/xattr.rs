//! `getxattr`/`setxattr`/`listxattr`/`removexattr` against the supplemental
//! `Inode::xattrs` field (SPEC_FULL §3.1 — surfaces `tahoe:ro_uri`/
//! `tahoe:rw_uri` capability strings without a side channel).

use super::{require_inode, require_writable, FsOp, OpContext, OpReply};
use crate::error::{Error, Result};
use crate::model::InodeId;

pub struct GetXattr {
    pub inode_id: InodeId,
    pub name: String,
}

#[async_trait::async_trait]
impl FsOp for GetXattr {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode = require_inode(ctx.cache, self.inode_id).await?;
        let value = inode.xattrs.get(&self.name).cloned().ok_or(Error::NotFound)?;
        Ok(OpReply::Xattr(value))
    }
}

pub struct ListXattr {
    pub inode_id: InodeId,
}

#[async_trait::async_trait]
impl FsOp for ListXattr {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode = require_inode(ctx.cache, self.inode_id).await?;
        Ok(OpReply::XattrList(inode.xattrs.keys().cloned().collect()))
    }
}

pub struct SetXattr {
    pub inode_id: InodeId,
    pub name: String,
    pub value: Vec<u8>,
}

#[async_trait::async_trait]
impl FsOp for SetXattr {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        ctx.cache
            .bump_and_save(self.inode_id, |i| {
                i.xattrs.insert(self.name.clone(), self.value.clone());
                i.dirty_mask.mark_meta();
            })
            .await?;
        Ok(OpReply::Unit)
    }
}

pub struct RemoveXattr {
    pub inode_id: InodeId,
    pub name: String,
}

#[async_trait::async_trait]
impl FsOp for RemoveXattr {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        let inode = require_inode(ctx.cache, self.inode_id).await?;
        if !inode.xattrs.contains_key(&self.name) {
            return Err(Error::NotFound);
        }
        ctx.cache
            .bump_and_save(self.inode_id, |i| {
                i.xattrs.remove(&self.name);
                i.dirty_mask.mark_meta();
            })
            .await?;
        Ok(OpReply::Unit)
    }
}
