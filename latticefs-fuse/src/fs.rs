//! `fuse_backend_rs::api::filesystem::FileSystem` adapter over
//! `latticefs_core::Engine`. Generalized from `tvix-castore`'s
//! `fs/mod.rs::TvixStoreFs`: same synchronous-trait-over-async-engine
//! bridge (`tokio_handle.block_on(tokio_handle.spawn(..))`), but without an
//! `InodeTracker`-style indirection layer, since our inodes are already
//! stable ids assigned by `InodeStore` rather than derived from content
//! digests (tvix needs the tracker to paper over that; we don't).

use std::ffi::CStr;
use std::io;
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::{stat64, CreateIn, SetattrValid};
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, GetxattrReply, ListxattrReply, OpenOptions,
    ZeroCopyReader, ZeroCopyWriter,
};
use latticefs_core::fsops::{self, FsOp, OpContext, OpReply};
use latticefs_core::model::{Inode, InodeId, Kind};
use latticefs_core::Engine;
use tokio_util::sync::CancellationToken;

use crate::attr::{gen_attr, sanitize_mode};

/// Caps the set of FUSE callbacks are answered from Engine/FsOps; the entry
/// and attribute cache timeouts are short because, unlike tvix's
/// content-addressed immutable store, anything behind these inodes can
/// change underneath the kernel's cache (spec §3's mutable POSIX surface).
const ATTR_TIMEOUT: Duration = Duration::from_secs(1);

pub struct LatticeFs {
    engine: Engine,
    tokio_handle: tokio::runtime::Handle,
}

impl LatticeFs {
    pub fn new(engine: Engine, tokio_handle: tokio::runtime::Handle) -> Self {
        Self { engine, tokio_handle }
    }

    /// Runs one [`FsOp`] to completion, bridging this blocking FUSE callback
    /// into the async engine the same way `TvixStoreFs` bridges into its
    /// async blob/directory services.
    fn exec<O>(&self, uid: u32, gid: u32, op: O) -> io::Result<OpReply>
    where
        O: FsOp + Send + 'static,
    {
        let engine = self.engine.clone();
        let task = self.tokio_handle.spawn(async move {
            let cancel = CancellationToken::new();
            let ctx = OpContext {
                cache: &engine.cache,
                sync: &engine.sync,
                handles: &engine.handles,
                cancel: &cancel,
                uid,
                gid,
            };
            op.apply(ctx).await
        });
        self.tokio_handle
            .block_on(task)
            .expect("engine task panicked")
            .map_err(io::Error::from)
    }

    fn name_str(name: &CStr) -> io::Result<String> {
        name.to_str()
            .map(str::to_owned)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
    }
}

fn entry_for(inode: &Inode) -> Entry {
    Entry {
        inode: inode.inode_id,
        generation: 0,
        attr: gen_attr(inode).into(),
        attr_flags: 0,
        attr_timeout: ATTR_TIMEOUT,
        entry_timeout: ATTR_TIMEOUT,
    }
}

fn expect_inode(reply: OpReply) -> io::Result<Inode> {
    match reply {
        OpReply::Inode(inode) => Ok(inode),
        _ => Err(io::Error::from_raw_os_error(libc::EIO)),
    }
}

impl FileSystem for LatticeFs {
    type Inode = InodeId;
    type Handle = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent))]
    fn lookup(&self, ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let name = Self::name_str(name)?;
        let inode = expect_inode(self.exec(ctx.uid, ctx.gid, fsops::Lookup { parent_id: parent, name })?)?;
        Ok(entry_for(&inode))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(&self, ctx: &Context, inode: Self::Inode, _handle: Option<Self::Handle>) -> io::Result<(stat64, Duration)> {
        let inode = expect_inode(self.exec(ctx.uid, ctx.gid, fsops::GetAttr { inode_id: inode })?)?;
        Ok((gen_attr(&inode).into(), ATTR_TIMEOUT))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn setattr(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        attr: stat64,
        _handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        let op = fsops::SetAttr {
            inode_id: inode,
            mode: valid.contains(SetattrValid::MODE).then_some(sanitize_mode(attr.st_mode as u32)),
            uid: valid.contains(SetattrValid::UID).then_some(attr.st_uid),
            gid: valid.contains(SetattrValid::GID).then_some(attr.st_gid),
            size: valid.contains(SetattrValid::SIZE).then_some(attr.st_size as u64),
            atime: valid.contains(SetattrValid::ATIME).then_some(attr.st_atime as u64),
            mtime: valid.contains(SetattrValid::MTIME).then_some(attr.st_mtime as u64),
        };
        let updated = expect_inode(self.exec(ctx.uid, ctx.gid, op)?)?;
        Ok((gen_attr(&updated).into(), ATTR_TIMEOUT))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        match self.exec(ctx.uid, ctx.gid, fsops::Readlink { inode_id: inode })? {
            OpReply::Data(bytes) => Ok(bytes.to_vec()),
            _ => Err(io::Error::from_raw_os_error(libc::EIO)),
        }
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent))]
    fn symlink(&self, ctx: &Context, linkname: &CStr, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let name = Self::name_str(name)?;
        let target = Self::name_str(linkname)?;
        let inode = expect_inode(self.exec(ctx.uid, ctx.gid, fsops::Symlink { parent_id: parent, name, target })?)?;
        Ok(entry_for(&inode))
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent))]
    fn mknod(&self, ctx: &Context, parent: Self::Inode, name: &CStr, mode: u32, _rdev: u32, _umask: u32) -> io::Result<Entry> {
        if mode & libc::S_IFMT as u32 != 0 && mode & libc::S_IFMT as u32 != libc::S_IFREG as u32 {
            // Device nodes, fifos and sockets have no representation in a
            // content-addressed object store.
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        let name = Self::name_str(name)?;
        let op = fsops::Mknod { parent_id: parent, name, mode: sanitize_mode(mode) };
        let inode = expect_inode(self.exec(ctx.uid, ctx.gid, op)?)?;
        Ok(entry_for(&inode))
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent))]
    fn mkdir(&self, ctx: &Context, parent: Self::Inode, name: &CStr, mode: u32, _umask: u32) -> io::Result<Entry> {
        let name = Self::name_str(name)?;
        let op = fsops::Mkdir { parent_id: parent, name, mode: sanitize_mode(mode) };
        let inode = expect_inode(self.exec(ctx.uid, ctx.gid, op)?)?;
        Ok(entry_for(&inode))
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent))]
    fn unlink(&self, ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let name = Self::name_str(name)?;
        self.exec(ctx.uid, ctx.gid, fsops::Remove { parent_id: parent, name, expect_dir: false })?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent))]
    fn rmdir(&self, ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let name = Self::name_str(name)?;
        self.exec(ctx.uid, ctx.gid, fsops::Remove { parent_id: parent, name, expect_dir: true })?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.old_parent = olddir, rq.new_parent = newdir))]
    fn rename(
        &self,
        ctx: &Context,
        olddir: Self::Inode,
        oldname: &CStr,
        newdir: Self::Inode,
        newname: &CStr,
        flags: u32,
    ) -> io::Result<()> {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE are not implemented.
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let old_name = Self::name_str(oldname)?;
        let new_name = Self::name_str(newname)?;
        let op = fsops::Rename { old_parent: olddir, old_name, new_parent: newdir, new_name };
        self.exec(ctx.uid, ctx.gid, op)?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.new_parent = newparent))]
    fn link(&self, ctx: &Context, inode: Self::Inode, newparent: Self::Inode, newname: &CStr) -> io::Result<Entry> {
        let new_name = Self::name_str(newname)?;
        let op = fsops::Link { inode_id: inode, new_parent: newparent, new_name };
        let inode = expect_inode(self.exec(ctx.uid, ctx.gid, op)?)?;
        Ok(entry_for(&inode))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn open(&self, ctx: &Context, inode: Self::Inode, flags: u32, _fuse_flags: u32) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        let reply = self.exec(ctx.uid, ctx.gid, fsops::Open { inode_id: inode, flags })?;
        match reply {
            OpReply::Handle(h) => Ok((Some(h), OpenOptions::empty())),
            _ => Err(io::Error::from_raw_os_error(libc::EIO)),
        }
    }

    #[tracing::instrument(skip_all, fields(rq.parent = parent))]
    fn create(&self, ctx: &Context, parent: Self::Inode, name: &CStr, args: CreateIn) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions)> {
        let name_s = Self::name_str(name)?;
        let mknod_op = fsops::Mknod { parent_id: parent, name: name_s, mode: sanitize_mode(args.mode) };
        let inode = expect_inode(self.exec(ctx.uid, ctx.gid, mknod_op)?)?;
        let open_reply = self.exec(ctx.uid, ctx.gid, fsops::Open { inode_id: inode.inode_id, flags: args.flags })?;
        let handle = match open_reply {
            OpReply::Handle(h) => h,
            _ => return Err(io::Error::from_raw_os_error(libc::EIO)),
        };
        Ok((entry_for(&inode), Some(handle), OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn release(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        let _ = inode;
        self.exec(ctx.uid, ctx.gid, fsops::Release { handle_id: handle })?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle, rq.size = size, rq.offset = offset))]
    fn read(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let _ = inode;
        let reply = self.exec(ctx.uid, ctx.gid, fsops::Read { handle_id: handle, offset, length: size as u64 })?;
        match reply {
            OpReply::Data(data) => w.write(&data),
            _ => Err(io::Error::from_raw_os_error(libc::EIO)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle, rq.size = size, rq.offset = offset))]
    fn write(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let _ = inode;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = r.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        let op = fsops::Write { handle_id: handle, offset, data: bytes::Bytes::from(buf) };
        match self.exec(ctx.uid, ctx.gid, op)? {
            OpReply::Written(n) => Ok(n as usize),
            _ => Err(io::Error::from_raw_os_error(libc::EIO)),
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn flush(&self, ctx: &Context, inode: Self::Inode, handle: Self::Handle, _lock_owner: u64) -> io::Result<()> {
        let _ = inode;
        self.exec(ctx.uid, ctx.gid, fsops::Flush { handle_id: handle })?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn fsync(&self, ctx: &Context, inode: Self::Inode, _datasync: bool, handle: Self::Handle) -> io::Result<()> {
        let _ = inode;
        self.exec(ctx.uid, ctx.gid, fsops::Fsync { handle_id: handle })?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn opendir(&self, ctx: &Context, inode: Self::Inode, _flags: u32) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        match self.exec(ctx.uid, ctx.gid, fsops::OpenDir { inode_id: inode })? {
            OpReply::Handle(h) => Ok((Some(h), OpenOptions::empty())),
            _ => Err(io::Error::from_raw_os_error(libc::EIO)),
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle, rq.offset = offset))]
    fn readdir(
        &self,
        ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let _ = inode;
        let op = fsops::ReadDir { handle_id: handle, cursor: None, batch: usize::MAX };
        let (entries, _) = match self.exec(ctx.uid, ctx.gid, op)? {
            OpReply::DirEntries { entries, next_cursor } => (entries, next_cursor),
            _ => return Err(io::Error::from_raw_os_error(libc::EIO)),
        };

        for (i, (name, child_id, kind)) in entries.iter().enumerate().skip(offset as usize) {
            let type_ = match kind {
                Kind::Directory => libc::S_IFDIR as u32,
                Kind::File => libc::S_IFREG as u32,
                Kind::Symlink => libc::S_IFLNK as u32,
            };
            let written = add_entry(DirEntry {
                ino: *child_id,
                offset: i as u64 + 1,
                type_,
                name: name.as_bytes(),
            })?;
            if written == 0 {
                break;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn releasedir(&self, ctx: &Context, inode: Self::Inode, _flags: u32, handle: Self::Handle) -> io::Result<()> {
        let _ = inode;
        self.exec(ctx.uid, ctx.gid, fsops::ReleaseDir { handle_id: handle })?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn fsyncdir(&self, ctx: &Context, inode: Self::Inode, _datasync: bool, _handle: Self::Handle) -> io::Result<()> {
        self.exec(ctx.uid, ctx.gid, fsops::FsyncDir { inode_id: inode })?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    fn statfs(&self, ctx: &Context, inode: Self::Inode) -> io::Result<libc::statvfs64> {
        let _ = inode;
        let reply = self.exec(ctx.uid, ctx.gid, fsops::StatFs)?;
        let OpReply::StatFs { blocks_total, blocks_free, files_total, files_free } = reply else {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        };
        let mut out: libc::statvfs64 = unsafe { std::mem::zeroed() };
        out.f_bsize = 4096;
        out.f_frsize = 4096;
        out.f_blocks = blocks_total;
        out.f_bfree = blocks_free;
        out.f_bavail = blocks_free;
        out.f_files = files_total;
        out.f_ffree = files_free;
        out.f_favail = files_free;
        out.f_namemax = 255;
        Ok(out)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn access(&self, ctx: &Context, inode: Self::Inode, mask: u32) -> io::Result<()> {
        self.exec(ctx.uid, ctx.gid, fsops::Access { inode_id: inode, mode: mask })?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getxattr(&self, ctx: &Context, inode: Self::Inode, name: &CStr, size: u32) -> io::Result<GetxattrReply> {
        let name = Self::name_str(name)?;
        let value = match self.exec(ctx.uid, ctx.gid, fsops::GetXattr { inode_id: inode, name })? {
            OpReply::Xattr(v) => v,
            _ => return Err(io::Error::from_raw_os_error(libc::EIO)),
        };
        if size == 0 {
            Ok(GetxattrReply::Count(value.len() as u32))
        } else if value.len() as u32 > size {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        } else {
            Ok(GetxattrReply::Value(value))
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn setxattr(&self, ctx: &Context, inode: Self::Inode, name: &CStr, value: &[u8], _flags: u32) -> io::Result<()> {
        let name = Self::name_str(name)?;
        self.exec(ctx.uid, ctx.gid, fsops::SetXattr { inode_id: inode, name, value: value.to_vec() })?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn listxattr(&self, ctx: &Context, inode: Self::Inode, size: u32) -> io::Result<ListxattrReply> {
        let names = match self.exec(ctx.uid, ctx.gid, fsops::ListXattr { inode_id: inode })? {
            OpReply::XattrList(names) => names,
            _ => return Err(io::Error::from_raw_os_error(libc::EIO)),
        };
        let mut buf = Vec::new();
        for name in &names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        if size == 0 {
            Ok(ListxattrReply::Count(buf.len() as u32))
        } else if buf.len() as u32 > size {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        } else {
            Ok(ListxattrReply::Names(buf))
        }
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn removexattr(&self, ctx: &Context, inode: Self::Inode, name: &CStr) -> io::Result<()> {
        let name = Self::name_str(name)?;
        self.exec(ctx.uid, ctx.gid, fsops::RemoveXattr { inode_id: inode, name })?;
        Ok(())
    }
}
