use super::InodeStore;
use crate::error::{Error, Result};
use crate::model::{DirEntry, Inode, InodeId, ROOT_INODE};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-process stand-in for the relational InodeStore, used by tests
/// exercising CacheManager/SyncEngine/FSOps without a database.
pub struct MemoryInodeStore {
    inodes: Mutex<BTreeMap<InodeId, Inode>>,
    children: Mutex<BTreeMap<InodeId, BTreeMap<String, InodeId>>>,
    next_id: AtomicU64,
}

impl MemoryInodeStore {
    /// Constructs a store pre-seeded with an empty root directory.
    pub fn new() -> Self {
        let root = Inode::new_directory(ROOT_INODE, None, None, 0o755, 0, 0);
        let mut inodes = BTreeMap::new();
        inodes.insert(ROOT_INODE, root);
        let mut children = BTreeMap::new();
        children.insert(ROOT_INODE, BTreeMap::new());
        Self {
            inodes: Mutex::new(inodes),
            children: Mutex::new(children),
            next_id: AtomicU64::new(ROOT_INODE + 1),
        }
    }
}

impl Default for MemoryInodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InodeStore for MemoryInodeStore {
    async fn get(&self, inode_id: InodeId) -> Result<Option<Inode>> {
        Ok(self.inodes.lock().get(&inode_id).cloned())
    }

    async fn get_by_path(&self, parent_id: InodeId, name: &str) -> Result<Option<Inode>> {
        let child_id = self
            .children
            .lock()
            .get(&parent_id)
            .and_then(|m| m.get(name).copied());
        match child_id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn insert(&self, mut inode: Inode) -> Result<Inode> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        inode.inode_id = id;
        // Deliberately does NOT touch `children`/`(parent,name)` linkage:
        // that's `link_child`'s (or `replace_children`'s) job, so a caller
        // that wants both a fresh row and a directory entry always goes
        // through exactly one place that checks for a name collision.
        if inode.kind == crate::model::Kind::Directory {
            self.children.lock().entry(id).or_default();
        }
        self.inodes.lock().insert(id, inode.clone());
        Ok(inode)
    }

    async fn update(&self, inode: &Inode, expected_version: u64) -> Result<()> {
        let mut inodes = self.inodes.lock();
        let Some(existing) = inodes.get(&inode.inode_id) else {
            return Err(Error::NotFound);
        };
        if existing.version != expected_version {
            return Err(Error::Stale);
        }
        inodes.insert(inode.inode_id, inode.clone());
        Ok(())
    }

    async fn delete(&self, inode_id: InodeId) -> Result<()> {
        self.inodes.lock().remove(&inode_id);
        self.children.lock().remove(&inode_id);
        Ok(())
    }

    async fn list_children(&self, parent_id: InodeId) -> Result<Vec<DirEntry>> {
        Ok(self
            .children
            .lock()
            .get(&parent_id)
            .map(|m| {
                m.iter()
                    .map(|(name, child_id)| DirEntry {
                        parent_id,
                        name: name.clone(),
                        child_id: *child_id,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn replace_children(&self, parent_id: InodeId, entries: Vec<(String, InodeId)>) -> Result<()> {
        let mut children = self.children.lock();
        let map: BTreeMap<String, InodeId> = entries.into_iter().collect();
        children.insert(parent_id, map);
        Ok(())
    }

    async fn list_dirty(&self) -> Result<Vec<InodeId>> {
        Ok(self
            .inodes
            .lock()
            .values()
            .filter(|i| !i.dirty_mask.is_clean())
            .map(|i| i.inode_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Inode;

    #[tokio::test]
    async fn insert_allocates_but_does_not_link_child() {
        let store = MemoryInodeStore::new();
        let inode = Inode::new_file(0, ROOT_INODE, "a.txt", 0o644, 0, 0);
        let inserted = store.insert(inode).await.unwrap();
        assert!(inserted.inode_id > ROOT_INODE);
        // `insert` alone never creates the `(parent,name)` entry; only
        // `replace_children` (or `link_child` above it) does.
        assert!(store.get_by_path(ROOT_INODE, "a.txt").await.unwrap().is_none());
        store
            .replace_children(ROOT_INODE, vec![("a.txt".into(), inserted.inode_id)])
            .await
            .unwrap();
        let found = store.get_by_path(ROOT_INODE, "a.txt").await.unwrap().unwrap();
        assert_eq!(found.inode_id, inserted.inode_id);
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let store = MemoryInodeStore::new();
        let inode = store
            .insert(Inode::new_file(0, ROOT_INODE, "a.txt", 0o644, 0, 0))
            .await
            .unwrap();
        let mut newer = inode.clone();
        newer.version = 1;
        store.update(&newer, 0).await.unwrap();

        let mut conflicting = inode.clone();
        conflicting.version = 5;
        let err = store.update(&conflicting, 0).await.unwrap_err();
        assert!(matches!(err, Error::Stale));
    }

    #[tokio::test]
    async fn replace_children_is_atomic_swap() {
        let store = MemoryInodeStore::new();
        let a = store
            .insert(Inode::new_file(0, ROOT_INODE, "a", 0o644, 0, 0))
            .await
            .unwrap();
        store.replace_children(ROOT_INODE, vec![("b".into(), a.inode_id)]).await.unwrap();
        let children = store.list_children(ROOT_INODE).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "b");
    }
}
