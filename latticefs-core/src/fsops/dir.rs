//! `opendir`, `readdir`, `releasedir`, `fsyncdir` (spec §4.5/§4.6).

use super::{require_inode, FsOp, OpContext, OpReply};
use crate::error::{Error, Result};
use crate::model::{InodeId, Kind};

pub struct OpenDir {
    pub inode_id: InodeId,
}

#[async_trait::async_trait]
impl FsOp for OpenDir {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode = require_inode(ctx.cache, self.inode_id).await?;
        if inode.kind != Kind::Directory {
            return Err(Error::NotDir);
        }
        let snapshot: Vec<(String, InodeId)> = ctx
            .cache
            .inode_store
            .list_children(self.inode_id)
            .await?
            .into_iter()
            .map(|e| (e.name, e.child_id))
            .collect();
        let handle_id = ctx.handles.open_dir(self.inode_id, snapshot);
        Ok(OpReply::Handle(handle_id))
    }
}

pub struct ReadDir {
    pub handle_id: u64,
    pub cursor: Option<String>,
    pub batch: usize,
}

#[async_trait::async_trait]
impl FsOp for ReadDir {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let entries = ctx.handles.dir_entries_from(self.handle_id, self.cursor.as_deref(), self.batch);
        let next_cursor = entries.last().map(|(name, _)| name.clone());
        let mut with_kind = Vec::with_capacity(entries.len());
        for (name, child_id) in entries {
            let kind = ctx
                .cache
                .inode_store
                .get(child_id)
                .await?
                .map(|i| i.kind)
                .unwrap_or(Kind::File);
            with_kind.push((name, child_id, kind));
        }
        Ok(OpReply::DirEntries {
            entries: with_kind,
            next_cursor,
        })
    }
}

pub struct ReleaseDir {
    pub handle_id: u64,
}

#[async_trait::async_trait]
impl FsOp for ReleaseDir {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        ctx.handles.release(self.handle_id);
        Ok(OpReply::Unit)
    }
}

pub struct FsyncDir {
    pub inode_id: InodeId,
}

#[async_trait::async_trait]
impl FsOp for FsyncDir {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        ctx.sync.push_upstream(self.inode_id).await?;
        Ok(OpReply::Unit)
    }
}
