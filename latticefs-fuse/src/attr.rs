//! `Inode` -> `fuse_backend_rs` attribute conversion, generalized from
//! `tvix-castore`'s `fs/file_attr.rs` (there a const for the synthetic root
//! node; here every inode, root included, carries real stat fields fetched
//! from InodeStore, so one function covers all of them).

use fuse_backend_rs::abi::fuse_abi::Attr;
use latticefs_core::model::{Inode, Kind};

fn type_bits(kind: Kind) -> u32 {
    match kind {
        Kind::Directory => libc::S_IFDIR as u32,
        Kind::File => libc::S_IFREG as u32,
        Kind::Symlink => libc::S_IFLNK as u32,
    }
}

/// Builds the `fuse_backend_rs` attribute struct for `inode`. `mode` only
/// ever stores permission bits (see `fs.rs`'s `sanitize_mode`); the type bits
/// are reconstructed here from `Kind` rather than trusted from storage.
pub fn gen_attr(inode: &Inode) -> Attr {
    Attr {
        ino: inode.inode_id,
        size: inode.size,
        blksize: 4096,
        blocks: inode.size.div_ceil(512),
        mode: type_bits(inode.kind) | (inode.mode & 0o7777),
        atime: inode.atime,
        mtime: inode.mtime,
        ctime: inode.ctime,
        atimensec: 0,
        mtimensec: 0,
        ctimensec: 0,
        nlink: inode.nlink,
        uid: inode.uid,
        gid: inode.gid,
        rdev: 0,
        flags: 0,
        #[cfg(target_os = "macos")]
        crtime: inode.ctime,
        #[cfg(target_os = "macos")]
        crtimensec: 0,
        #[cfg(target_os = "macos")]
        padding: 0,
    }
}

/// Strips any type bits a caller's `mode` argument to `mknod`/`mkdir`/
/// `create` might carry; `Inode::mode` only ever stores the permission bits,
/// with `gen_attr` reconstructing `S_IFMT` from `Kind` on the way out.
pub fn sanitize_mode(mode: u32) -> u32 {
    mode & 0o7777
}
