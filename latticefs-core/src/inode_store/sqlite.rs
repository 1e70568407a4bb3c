//! `sqlx`-backed InodeStore over an embedded SQLite database, realizing
//! spec §6's "transactional row store" literally (SPEC_FULL §4.2): a real
//! relational engine, not a KV store pretending to be one.

use super::InodeStore;
use crate::error::{Error, Result};
use crate::model::{DirEntry, DirtyMask, Inode, InodeId, Kind, ROOT_INODE};
use crate::remote::RemoteRef;
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::instrument;

pub struct SqliteInodeStore {
    pool: SqlitePool,
}

fn kind_to_str(kind: Kind) -> &'static str {
    match kind {
        Kind::File => "file",
        Kind::Directory => "directory",
        Kind::Symlink => "symlink",
    }
}

fn str_to_kind(s: &str) -> Result<Kind> {
    match s {
        "file" => Ok(Kind::File),
        "directory" => Ok(Kind::Directory),
        "symlink" => Ok(Kind::Symlink),
        other => Err(Error::Storage(format!("unknown inode kind {other}"))),
    }
}

impl SqliteInodeStore {
    /// Connects (creating the database file if needed) and runs the schema
    /// migration. `url` is a `sqlite:` connection string, e.g.
    /// `sqlite:///var/lib/latticefs/inodes.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inodes (
                inode_id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL,
                mode INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                gid INTEGER NOT NULL,
                size INTEGER NOT NULL,
                atime INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                ctime INTEGER NOT NULL,
                nlink INTEGER NOT NULL,
                remote_ref TEXT,
                parent_id INTEGER,
                name_in_parent TEXT,
                version INTEGER NOT NULL,
                dirty_meta INTEGER NOT NULL,
                dirty_data INTEGER NOT NULL,
                last_sync_ts INTEGER NOT NULL,
                xattrs TEXT NOT NULL,
                symlink_target TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dir_entries (
                parent_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                child_inode_id INTEGER NOT NULL,
                PRIMARY KEY (parent_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Seed the root directory on first migration.
        let root_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM inodes WHERE inode_id = ?")
            .bind(ROOT_INODE as i64)
            .fetch_optional(&self.pool)
            .await?;
        if root_exists.is_none() {
            let root = Inode::new_directory(ROOT_INODE, None, None, 0o755, 0, 0);
            self.insert_row(&root).await?;
        }
        Ok(())
    }

    async fn insert_row(&self, inode: &Inode) -> Result<()> {
        let xattrs = serde_json::to_string(&inode.xattrs).map_err(|e| Error::Storage(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO inodes
                (inode_id, kind, mode, uid, gid, size, atime, mtime, ctime, nlink,
                 remote_ref, parent_id, name_in_parent, version, dirty_meta, dirty_data,
                 last_sync_ts, xattrs, symlink_target)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(inode.inode_id as i64)
        .bind(kind_to_str(inode.kind))
        .bind(inode.mode as i64)
        .bind(inode.uid as i64)
        .bind(inode.gid as i64)
        .bind(inode.size as i64)
        .bind(inode.atime as i64)
        .bind(inode.mtime as i64)
        .bind(inode.ctime as i64)
        .bind(inode.nlink as i64)
        .bind(inode.remote_ref.as_ref().map(|r| r.as_str().to_string()))
        .bind(inode.parent_id.map(|p| p as i64))
        .bind(inode.name_in_parent.clone())
        .bind(inode.version as i64)
        .bind(inode.dirty_mask.meta as i64)
        .bind(inode.dirty_mask.data as i64)
        .bind(inode.last_sync_ts as i64)
        .bind(xattrs)
        .bind(inode.symlink_target.clone())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_inode(row: &sqlx::sqlite::SqliteRow) -> Result<Inode> {
        let xattrs_json: String = row.try_get("xattrs")?;
        let xattrs: BTreeMap<String, Vec<u8>> =
            serde_json::from_str(&xattrs_json).map_err(|e| Error::Storage(e.to_string()))?;
        let remote_ref: Option<String> = row.try_get("remote_ref")?;
        Ok(Inode {
            inode_id: row.try_get::<i64, _>("inode_id")? as u64,
            kind: str_to_kind(row.try_get::<String, _>("kind")?.as_str())?,
            mode: row.try_get::<i64, _>("mode")? as u32,
            uid: row.try_get::<i64, _>("uid")? as u32,
            gid: row.try_get::<i64, _>("gid")? as u32,
            size: row.try_get::<i64, _>("size")? as u64,
            atime: row.try_get::<i64, _>("atime")? as u64,
            mtime: row.try_get::<i64, _>("mtime")? as u64,
            ctime: row.try_get::<i64, _>("ctime")? as u64,
            nlink: row.try_get::<i64, _>("nlink")? as u32,
            remote_ref: remote_ref.map(RemoteRef),
            parent_id: row.try_get::<Option<i64>, _>("parent_id")?.map(|v| v as u64),
            name_in_parent: row.try_get("name_in_parent")?,
            version: row.try_get::<i64, _>("version")? as u64,
            dirty_mask: DirtyMask {
                meta: row.try_get::<i64, _>("dirty_meta")? != 0,
                data: row.try_get::<i64, _>("dirty_data")? != 0,
            },
            last_sync_ts: row.try_get::<i64, _>("last_sync_ts")? as u64,
            xattrs,
            symlink_target: row.try_get("symlink_target")?,
        })
    }
}

#[async_trait]
impl InodeStore for SqliteInodeStore {
    #[instrument(skip(self))]
    async fn get(&self, inode_id: InodeId) -> Result<Option<Inode>> {
        let row = sqlx::query("SELECT * FROM inodes WHERE inode_id = ?")
            .bind(inode_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_inode).transpose()
    }

    #[instrument(skip(self))]
    async fn get_by_path(&self, parent_id: InodeId, name: &str) -> Result<Option<Inode>> {
        let child_id: Option<i64> =
            sqlx::query_scalar("SELECT child_inode_id FROM dir_entries WHERE parent_id = ? AND name = ?")
                .bind(parent_id as i64)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        match child_id {
            Some(id) => self.get(id as u64).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self, inode))]
    async fn insert(&self, mut inode: Inode) -> Result<Inode> {
        let mut tx = self.pool.begin().await?;
        let next_id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(inode_id), 0) + 1 FROM inodes")
            .fetch_one(&mut *tx)
            .await?;
        inode.inode_id = next_id as u64;

        let xattrs = serde_json::to_string(&inode.xattrs).map_err(|e| Error::Storage(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO inodes
                (inode_id, kind, mode, uid, gid, size, atime, mtime, ctime, nlink,
                 remote_ref, parent_id, name_in_parent, version, dirty_meta, dirty_data,
                 last_sync_ts, xattrs, symlink_target)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(inode.inode_id as i64)
        .bind(kind_to_str(inode.kind))
        .bind(inode.mode as i64)
        .bind(inode.uid as i64)
        .bind(inode.gid as i64)
        .bind(inode.size as i64)
        .bind(inode.atime as i64)
        .bind(inode.mtime as i64)
        .bind(inode.ctime as i64)
        .bind(inode.nlink as i64)
        .bind(inode.remote_ref.as_ref().map(|r| r.as_str().to_string()))
        .bind(inode.parent_id.map(|p| p as i64))
        .bind(inode.name_in_parent.clone())
        .bind(inode.version as i64)
        .bind(inode.dirty_mask.meta as i64)
        .bind(inode.dirty_mask.data as i64)
        .bind(inode.last_sync_ts as i64)
        .bind(xattrs)
        .bind(inode.symlink_target.clone())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        // Deliberately does NOT write a `dir_entries` row even when
        // `parent_id`/`name_in_parent` are set: that linkage is
        // `link_child`'s (or `replace_children`'s) job, so there is exactly
        // one place that checks for a name collision before creating one.
        Ok(inode)
    }

    #[instrument(skip(self, inode))]
    async fn update(&self, inode: &Inode, expected_version: u64) -> Result<()> {
        let xattrs = serde_json::to_string(&inode.xattrs).map_err(|e| Error::Storage(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE inodes SET
                kind = ?, mode = ?, uid = ?, gid = ?, size = ?, atime = ?, mtime = ?,
                ctime = ?, nlink = ?, remote_ref = ?, parent_id = ?, name_in_parent = ?,
                version = ?, dirty_meta = ?, dirty_data = ?, last_sync_ts = ?, xattrs = ?,
                symlink_target = ?
            WHERE inode_id = ? AND version = ?
            "#,
        )
        .bind(kind_to_str(inode.kind))
        .bind(inode.mode as i64)
        .bind(inode.uid as i64)
        .bind(inode.gid as i64)
        .bind(inode.size as i64)
        .bind(inode.atime as i64)
        .bind(inode.mtime as i64)
        .bind(inode.ctime as i64)
        .bind(inode.nlink as i64)
        .bind(inode.remote_ref.as_ref().map(|r| r.as_str().to_string()))
        .bind(inode.parent_id.map(|p| p as i64))
        .bind(inode.name_in_parent.clone())
        .bind(inode.version as i64)
        .bind(inode.dirty_mask.meta as i64)
        .bind(inode.dirty_mask.data as i64)
        .bind(inode.last_sync_ts as i64)
        .bind(xattrs)
        .bind(inode.symlink_target.clone())
        .bind(inode.inode_id as i64)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.get(inode.inode_id).await?.is_none() {
                return Err(Error::NotFound);
            }
            return Err(Error::Stale);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, inode_id: InodeId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM inodes WHERE inode_id = ?")
            .bind(inode_id as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM dir_entries WHERE parent_id = ? OR child_inode_id = ?")
            .bind(inode_id as i64)
            .bind(inode_id as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_children(&self, parent_id: InodeId) -> Result<Vec<DirEntry>> {
        let rows = sqlx::query("SELECT name, child_inode_id FROM dir_entries WHERE parent_id = ? ORDER BY name")
            .bind(parent_id as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(DirEntry {
                    parent_id,
                    name: row.try_get("name")?,
                    child_id: row.try_get::<i64, _>("child_inode_id")? as u64,
                })
            })
            .collect()
    }

    #[instrument(skip(self, entries))]
    async fn replace_children(&self, parent_id: InodeId, entries: Vec<(String, InodeId)>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dir_entries WHERE parent_id = ?")
            .bind(parent_id as i64)
            .execute(&mut *tx)
            .await?;
        for (name, child_id) in entries {
            sqlx::query("INSERT INTO dir_entries (parent_id, name, child_inode_id) VALUES (?, ?, ?)")
                .bind(parent_id as i64)
                .bind(name)
                .bind(child_id as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_dirty(&self) -> Result<Vec<InodeId>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            "SELECT inode_id FROM inodes WHERE dirty_meta != 0 OR dirty_data != 0",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|id| id as u64).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_seeds_root_directory() {
        let store = SqliteInodeStore::connect("sqlite::memory:").await.unwrap();
        let root = store.get(ROOT_INODE).await.unwrap().unwrap();
        assert_eq!(root.kind, Kind::Directory);
    }

    #[tokio::test]
    async fn insert_get_update_round_trip() {
        let store = SqliteInodeStore::connect("sqlite::memory:").await.unwrap();
        let inode = Inode::new_file(0, ROOT_INODE, "a.txt", 0o644, 1000, 1000);
        let inserted = store.insert(inode).await.unwrap();
        assert!(inserted.inode_id > ROOT_INODE);

        let mut updated = inserted.clone();
        updated.size = 42;
        updated.version = 1;
        store.update(&updated, 0).await.unwrap();

        let fetched = store.get(inserted.inode_id).await.unwrap().unwrap();
        assert_eq!(fetched.size, 42);
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let store = SqliteInodeStore::connect("sqlite::memory:").await.unwrap();
        let inode = store
            .insert(Inode::new_file(0, ROOT_INODE, "a.txt", 0o644, 0, 0))
            .await
            .unwrap();
        let mut stale = inode.clone();
        stale.version = 7;
        let err = store.update(&stale, 99).await.unwrap_err();
        assert!(matches!(err, Error::Stale));
    }

    #[tokio::test]
    async fn replace_children_swaps_atomically() {
        let store = SqliteInodeStore::connect("sqlite::memory:").await.unwrap();
        let a = store
            .insert(Inode::new_file(0, ROOT_INODE, "a", 0o644, 0, 0))
            .await
            .unwrap();
        store
            .replace_children(ROOT_INODE, vec![("only".into(), a.inode_id)])
            .await
            .unwrap();
        let children = store.list_children(ROOT_INODE).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "only");
    }
}
