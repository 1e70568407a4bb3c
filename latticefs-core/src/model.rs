//! Core data types shared by BlockStore, InodeStore, CacheManager and
//! SyncEngine (spec §3). Kept free of any storage-backend detail so the
//! rest of the crate can depend on plain values.

use crate::remote::RemoteRef;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub type InodeId = u64;
pub type BlockIndex = u64;

/// Root directory's stable inode id. Never reused.
pub const ROOT_INODE: InodeId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    File,
    Directory,
    Symlink,
}

/// `dirty_mask` from spec §3: clean / meta-dirty / data-dirty / both,
/// modeled as two independent flags rather than a four-way enum so callers
/// can `|=` in either dimension without a match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyMask {
    pub meta: bool,
    pub data: bool,
}

impl DirtyMask {
    pub const CLEAN: DirtyMask = DirtyMask {
        meta: false,
        data: false,
    };

    pub fn is_clean(&self) -> bool {
        !self.meta && !self.data
    }

    pub fn mark_meta(&mut self) {
        self.meta = true;
    }

    pub fn mark_data(&mut self) {
        self.data = true;
    }

    pub fn clear(&mut self) {
        self.meta = false;
        self.data = false;
    }
}

/// Current wall-clock time in whole seconds, the unit every timestamp field
/// in the data model uses.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The logical identity of a filesystem object, independent of any name
/// (spec §3 "Inode").
#[derive(Debug, Clone)]
pub struct Inode {
    pub inode_id: InodeId,
    pub kind: Kind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub nlink: u32,
    pub remote_ref: Option<RemoteRef>,
    pub parent_id: Option<InodeId>,
    pub name_in_parent: Option<String>,
    pub version: u64,
    pub dirty_mask: DirtyMask,
    pub last_sync_ts: u64,
    /// Supplemental field (SPEC_FULL §3.1): `tahoe:ro_uri`/`tahoe:rw_uri`-
    /// style capability attributes and any other xattrs set via `setxattr`.
    pub xattrs: BTreeMap<String, Vec<u8>>,
    /// Symlink target, only meaningful for `Kind::Symlink`.
    pub symlink_target: Option<String>,
}

impl Inode {
    pub fn new_file(inode_id: InodeId, parent_id: InodeId, name: impl Into<String>, mode: u32, uid: u32, gid: u32) -> Self {
        let now = now_secs();
        Inode {
            inode_id,
            kind: Kind::File,
            mode,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            nlink: 1,
            remote_ref: None,
            parent_id: Some(parent_id),
            name_in_parent: Some(name.into()),
            version: 0,
            dirty_mask: DirtyMask::default(),
            last_sync_ts: 0,
            xattrs: BTreeMap::new(),
            symlink_target: None,
        }
    }

    pub fn new_directory(inode_id: InodeId, parent_id: Option<InodeId>, name: Option<String>, mode: u32, uid: u32, gid: u32) -> Self {
        let now = now_secs();
        Inode {
            inode_id,
            kind: Kind::Directory,
            mode,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            nlink: 2,
            remote_ref: None,
            parent_id,
            name_in_parent: name,
            version: 0,
            dirty_mask: DirtyMask::default(),
            last_sync_ts: 0,
            xattrs: BTreeMap::new(),
            symlink_target: None,
        }
    }

    pub fn new_symlink(inode_id: InodeId, parent_id: InodeId, name: impl Into<String>, target: impl Into<String>, uid: u32, gid: u32) -> Self {
        let now = now_secs();
        let target = target.into();
        Inode {
            inode_id,
            kind: Kind::Symlink,
            mode: 0o777,
            uid,
            gid,
            size: target.len() as u64,
            atime: now,
            mtime: now,
            ctime: now,
            nlink: 1,
            remote_ref: None,
            parent_id: Some(parent_id),
            name_in_parent: Some(name.into()),
            version: 0,
            dirty_mask: DirtyMask::default(),
            last_sync_ts: 0,
            xattrs: BTreeMap::new(),
            symlink_target: Some(target),
        }
    }

    /// Whether readers of `remote_ref` must first resolve through
    /// SyncEngine before trusting it (invariant I4).
    pub fn remote_ref_may_be_stale(&self) -> bool {
        !self.dirty_mask.is_clean()
    }
}

/// `(parent_id, name) -> child_inode_id`, unique on `(parent_id, name)`
/// (spec §3 "Directory entry").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub parent_id: InodeId,
    pub name: String,
    pub child_id: InodeId,
}

/// Per-block cache metadata (spec §3 "Block"). The block body itself lives
/// in a BlockStore-managed file; this is the sidecar's in-memory shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub length: u32,
    pub dirty: bool,
    pub present: bool,
    pub last_access_ts: u64,
    pub checksum: Option<[u8; 32]>,
}

impl BlockMeta {
    pub fn not_present() -> Self {
        BlockMeta {
            length: 0,
            dirty: false,
            present: false,
            last_access_ts: 0,
            checksum: None,
        }
    }
}
