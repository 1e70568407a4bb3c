//! Open file/directory handle bookkeeping (spec §4.5). Handles exist
//! strictly between `open`/`opendir` and `release`/`releasedir`; directory
//! handles additionally carry a snapshot of the parent's children taken at
//! open time (or the last `rewinddir`), per spec's "POSIX permits either"
//! wording on readdir-during-mutation.

use crate::model::InodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Open-mode flags a handle was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
}

impl OpenFlags {
    pub fn from_posix(flags: u32) -> Self {
        let access_mode = flags & libc::O_ACCMODE as u32;
        OpenFlags {
            read: access_mode == libc::O_RDONLY as u32 || access_mode == libc::O_RDWR as u32,
            write: access_mode == libc::O_WRONLY as u32 || access_mode == libc::O_RDWR as u32,
            append: flags & libc::O_APPEND as u32 != 0,
        }
    }
}

pub type HandleId = u64;

pub struct FileHandle {
    pub inode_id: InodeId,
    pub flags: OpenFlags,
    pub position: Mutex<u64>,
    pub opened_at: u64,
}

pub struct DirHandle {
    pub inode_id: InodeId,
    pub opened_at: u64,
    /// Snapshot of `(name, child_inode_id)` taken at `opendir`/`rewinddir`.
    pub snapshot: Mutex<Vec<(String, InodeId)>>,
}

pub enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Tracks every currently-open handle. `open`/`opendir` assign monotonic
/// ids; `release`/`releasedir` drop the entry. Permission checks against
/// the inode's mode happen at the FSOps layer (spec §4.5 describes the
/// validation as part of `open`, but the inode lookup that makes it
/// possible lives in InodeStore, not here).
pub struct HandleTable {
    handles: Mutex<HashMap<HandleId, Handle>>,
    next_id: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn open_file(&self, inode_id: InodeId, flags: OpenFlags) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(
            id,
            Handle::File(FileHandle {
                inode_id,
                flags,
                position: Mutex::new(0),
                opened_at: now_secs(),
            }),
        );
        id
    }

    pub fn open_dir(&self, inode_id: InodeId, snapshot: Vec<(String, InodeId)>) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(
            id,
            Handle::Dir(DirHandle {
                inode_id,
                opened_at: now_secs(),
                snapshot: Mutex::new(snapshot),
            }),
        );
        id
    }

    pub fn rewind_dir(&self, handle_id: HandleId, snapshot: Vec<(String, InodeId)>) -> bool {
        let handles = self.handles.lock();
        match handles.get(&handle_id) {
            Some(Handle::Dir(dir)) => {
                *dir.snapshot.lock() = snapshot;
                true
            }
            _ => false,
        }
    }

    pub fn file_inode(&self, handle_id: HandleId) -> Option<InodeId> {
        match self.handles.lock().get(&handle_id) {
            Some(Handle::File(f)) => Some(f.inode_id),
            _ => None,
        }
    }

    pub fn dir_inode(&self, handle_id: HandleId) -> Option<InodeId> {
        match self.handles.lock().get(&handle_id) {
            Some(Handle::Dir(d)) => Some(d.inode_id),
            _ => None,
        }
    }

    pub fn file_flags(&self, handle_id: HandleId) -> Option<OpenFlags> {
        match self.handles.lock().get(&handle_id) {
            Some(Handle::File(f)) => Some(f.flags),
            _ => None,
        }
    }

    pub fn position(&self, handle_id: HandleId) -> Option<u64> {
        match self.handles.lock().get(&handle_id) {
            Some(Handle::File(f)) => Some(*f.position.lock()),
            _ => None,
        }
    }

    pub fn set_position(&self, handle_id: HandleId, pos: u64) {
        if let Some(Handle::File(f)) = self.handles.lock().get(&handle_id) {
            *f.position.lock() = pos;
        }
    }

    /// Returns the next batch of directory entries at-or-after the
    /// lexicographic cursor, and the cursor to resume from.
    pub fn dir_entries_from(&self, handle_id: HandleId, cursor: Option<&str>, batch: usize) -> Vec<(String, InodeId)> {
        let handles = self.handles.lock();
        let Some(Handle::Dir(dir)) = handles.get(&handle_id) else {
            return Vec::new();
        };
        let snapshot = dir.snapshot.lock();
        let start = match cursor {
            Some(c) => snapshot.iter().position(|(name, _)| name.as_str() > c).unwrap_or(snapshot.len()),
            None => 0,
        };
        snapshot[start..].iter().take(batch).cloned().collect()
    }

    pub fn release(&self, handle_id: HandleId) -> Option<Handle> {
        self.handles.lock().remove(&handle_id)
    }

    pub fn count_open_for_inode(&self, inode_id: InodeId) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|h| match h {
                Handle::File(f) => f.inode_id == inode_id,
                Handle::Dir(d) => d.inode_id == inode_id,
            })
            .count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_release_file_handle() {
        let table = HandleTable::new();
        let id = table.open_file(42, OpenFlags { read: true, write: false, append: false });
        assert_eq!(table.file_inode(id), Some(42));
        table.release(id);
        assert_eq!(table.file_inode(id), None);
    }

    #[test]
    fn dir_cursor_resumes_lexicographically() {
        let table = HandleTable::new();
        let id = table.open_dir(1, vec![("a".into(), 2), ("b".into(), 3), ("c".into(), 4)]);
        let first = table.dir_entries_from(id, None, 2);
        assert_eq!(first, vec![("a".into(), 2), ("b".into(), 3)]);
        let next = table.dir_entries_from(id, Some("b"), 2);
        assert_eq!(next, vec![("c".into(), 4)]);
    }

    #[test]
    fn count_open_for_inode_tracks_multiple_handles() {
        let table = HandleTable::new();
        let flags = OpenFlags { read: true, write: false, append: false };
        let a = table.open_file(1, flags);
        let _b = table.open_file(1, flags);
        assert_eq!(table.count_open_for_inode(1), 2);
        table.release(a);
        assert_eq!(table.count_open_for_inode(1), 1);
    }
}
