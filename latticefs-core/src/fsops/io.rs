//! `open`, `read`, `write`, `flush`, `release`, `fsync`, `truncate` —
//! everything that reads or writes file bytes, and the open-handle
//! bookkeeping around it (spec §4.5/§4.6).

use super::{require_inode, require_writable, FsOp, OpContext, OpReply};
use crate::error::Result;
use crate::handle_table::OpenFlags;
use crate::model::InodeId;
use std::collections::HashMap;

pub struct Open {
    pub inode_id: InodeId,
    pub flags: u32,
}

#[async_trait::async_trait]
impl FsOp for Open {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_inode(ctx.cache, self.inode_id).await?;
        let handle_id = ctx.handles.open_file(self.inode_id, OpenFlags::from_posix(self.flags));
        Ok(OpReply::Handle(handle_id))
    }
}

pub struct Read {
    pub handle_id: u64,
    pub offset: u64,
    pub length: u64,
}

#[async_trait::async_trait]
impl FsOp for Read {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode_id = ctx.handles.file_inode(self.handle_id).ok_or(crate::error::Error::InvalidArg("stale file handle".into()))?;
        let resolved = ctx.cache.resolve_range(inode_id, self.offset, self.length).await?;
        let mut blocks: HashMap<_, _> = resolved.present.into_iter().collect();

        if !resolved.misses.is_empty() {
            let block_size = ctx.cache.block_store.block_size();
            for miss in &resolved.misses {
                let block_offset = miss.index * block_size;
                let pull = ctx.sync.pull_downstream(inode_id, Some((block_offset, block_size)));
                tokio::select! {
                    result = pull => { result?; }
                    _ = ctx.cancel.cancelled() => {
                        return Err(crate::error::Error::InvalidArg("read cancelled".into()));
                    }
                }
            }
            let refilled = ctx.cache.resolve_range(inode_id, self.offset, self.length).await?;
            blocks.extend(refilled.present);
        }

        let data = ctx.cache.assemble(self.offset, self.length, &blocks);
        ctx.handles.set_position(self.handle_id, self.offset + data.len() as u64);
        Ok(OpReply::Data(data))
    }
}

pub struct Write {
    pub handle_id: u64,
    pub offset: u64,
    pub data: bytes::Bytes,
}

#[async_trait::async_trait]
impl FsOp for Write {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        require_writable(ctx.cache)?;
        let inode_id = ctx.handles.file_inode(self.handle_id).ok_or(crate::error::Error::InvalidArg("stale file handle".into()))?;

        // O_APPEND must resolve `offset = size` atomically against
        // concurrent writers on the same inode (spec §4.6 `write`): the
        // size read and the staged write are bracketed by the inode's
        // metadata mutex, released before `ensure_capacity` so a forced
        // flush on this same inode (which re-acquires the mutex inside
        // `SyncEngine::push_upstream`) can't deadlock against it.
        let append = ctx.handles.file_flags(self.handle_id).map(|f| f.append).unwrap_or(false);
        let offset = {
            let inode_mutex = ctx.cache.inode_mutex(inode_id);
            let _guard = inode_mutex.lock().await;
            let offset = if append {
                require_inode(ctx.cache, inode_id).await?.size
            } else {
                self.offset
            };
            ctx.cache.stage_write(inode_id, offset, &self.data).await?;
            offset
        };
        let new_len = offset + self.data.len() as u64;
        ctx.cache
            .bump_and_save(inode_id, |i| {
                i.size = i.size.max(new_len);
                i.dirty_mask.mark_data();
            })
            .await?;
        ctx.handles.set_position(self.handle_id, new_len);
        ctx.cache
            .ensure_capacity(|victim| {
                let sync = ctx.sync.clone();
                async move { sync.push_upstream(victim).await }
            })
            .await?;
        Ok(OpReply::Written(self.data.len() as u32))
    }
}

/// POSIX `flush` fires on every `close()` of a descriptor, potentially more
/// than once for the same handle (e.g. `dup`); per spec it must not force
/// an upstream push (that's `fsync`'s job), so this is a no-op placeholder
/// for a future write-back hook.
pub struct Flush {
    pub handle_id: u64,
}

#[async_trait::async_trait]
impl FsOp for Flush {
    async fn apply(&self, _ctx: OpContext<'_>) -> Result<OpReply> {
        Ok(OpReply::Unit)
    }
}

pub struct Release {
    pub handle_id: u64,
}

#[async_trait::async_trait]
impl FsOp for Release {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode_id = ctx.handles.file_inode(self.handle_id);
        ctx.handles.release(self.handle_id);

        // Finish an unlink that was deferred by `Remove` while this handle
        // (or a sibling) was still open: nlink was already dropped to 0,
        // so once nobody else holds the inode open, delete it for real and
        // tell the remote, best-effort, to forget it too.
        if let Some(inode_id) = inode_id {
            if ctx.handles.count_open_for_inode(inode_id) == 0 {
                if let Some(inode) = ctx.cache.inode_store.get(inode_id).await? {
                    if inode.nlink == 0 {
                        ctx.cache.inode_store.delete(inode_id).await?;
                        ctx.cache.block_store.purge_inode(inode_id).await?;
                        if let Some(remote_ref) = inode.remote_ref {
                            let _ = ctx.sync.remote.delete(&remote_ref).await;
                        }
                    }
                }
            }
        }
        Ok(OpReply::Unit)
    }
}

pub struct Fsync {
    pub handle_id: u64,
}

#[async_trait::async_trait]
impl FsOp for Fsync {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let inode_id = ctx.handles.file_inode(self.handle_id).ok_or(crate::error::Error::InvalidArg("stale file handle".into()))?;
        ctx.sync.push_upstream(inode_id).await?;
        Ok(OpReply::Unit)
    }
}

pub struct Truncate {
    pub inode_id: InodeId,
    pub size: u64,
}

#[async_trait::async_trait]
impl FsOp for Truncate {
    async fn apply(&self, ctx: OpContext<'_>) -> Result<OpReply> {
        let reply = super::SetAttr {
            inode_id: self.inode_id,
            size: Some(self.size),
            ..Default::default()
        }
        .apply(ctx)
        .await?;
        Ok(reply)
    }
}
