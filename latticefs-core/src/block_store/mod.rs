//! Fixed-size on-disk blocks, addressed by `(inode_id, block_index)`, with a
//! JSON sidecar carrying the metadata spec §4.1 requires. Mirrors the
//! `blobservice`/`chunkservice` split in the teacher: content lives in plain
//! files, small metadata lives in a side-channel, everything async over
//! `tokio::fs` so FSOps never block the executor on local disk I/O.

mod sidecar;

use crate::error::{Error, Result};
use crate::model::{BlockIndex, BlockMeta, InodeId};
use bytes::Bytes;
use sidecar::Sidecar;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{instrument, warn};

/// Number of shard directories blocks are spread across, matching spec §6's
/// persisted layout (`cache_root/blocks/<shard>/<inode_id>/<block_index>`).
const SHARD_COUNT: u64 = 256;

pub struct BlockStore {
    root: PathBuf,
    block_size: u64,
}

/// Outcome of [`BlockStore::read_block`].
pub enum ReadBlock {
    Present { data: Bytes, meta: BlockMeta },
    Missing,
}

impl BlockStore {
    pub fn new(cache_root: impl Into<PathBuf>, block_size: u64) -> Self {
        Self {
            root: cache_root.into().join("blocks"),
            block_size,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    fn shard_dir(&self, inode_id: InodeId) -> PathBuf {
        self.root.join(format!("{:03}", inode_id % SHARD_COUNT))
    }

    fn inode_dir(&self, inode_id: InodeId) -> PathBuf {
        self.shard_dir(inode_id).join(inode_id.to_string())
    }

    fn block_path(&self, inode_id: InodeId, index: BlockIndex) -> PathBuf {
        self.inode_dir(inode_id).join(index.to_string())
    }

    fn sidecar_path(&self, inode_id: InodeId, index: BlockIndex) -> PathBuf {
        self.inode_dir(inode_id).join(format!("{index}.meta"))
    }

    async fn ensure_inode_dir(&self, inode_id: InodeId) -> Result<()> {
        fs::create_dir_all(self.inode_dir(inode_id)).await?;
        Ok(())
    }

    /// Reads up to `meta.length` bytes of the block if `present`. A
    /// sidecar/body length mismatch is treated as `CORRUPT` and the caller
    /// is expected to purge and re-fetch (spec §7).
    #[instrument(skip(self), fields(inode_id, index))]
    pub async fn read_block(&self, inode_id: InodeId, index: BlockIndex) -> Result<ReadBlock> {
        let sidecar_path = self.sidecar_path(inode_id, index);
        let meta = match Sidecar::load(&sidecar_path).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return Ok(ReadBlock::Missing),
            Err(e) => {
                warn!(error = %e, "sidecar unreadable, treating block as missing");
                return Ok(ReadBlock::Missing);
            }
        };
        if !meta.present {
            return Ok(ReadBlock::Missing);
        }

        let block_path = self.block_path(inode_id, index);
        let mut file = match fs::File::open(&block_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("sidecar present but block file missing, treating as missing");
                return Ok(ReadBlock::Missing);
            }
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::with_capacity(meta.length as usize);
        file.read_to_end(&mut data).await?;
        if data.len() != meta.length as usize {
            warn!(
                on_disk = data.len(),
                sidecar = meta.length,
                "block/sidecar length mismatch, purging"
            );
            self.purge(inode_id, index).await?;
            return Ok(ReadBlock::Missing);
        }
        if let Some(expected) = meta.checksum {
            let actual = blake3::hash(&data);
            if actual.as_bytes() != &expected {
                warn!("block checksum mismatch, purging");
                self.purge(inode_id, index).await?;
                return Err(Error::Corrupt(format!(
                    "checksum mismatch for inode {inode_id} block {index}"
                )));
            }
        }
        Ok(ReadBlock::Present {
            data: Bytes::from(data),
            meta,
        })
    }

    /// Writes `data` at `offset_in_block`, extending `length` if needed.
    /// Marks the block dirty and present. I/O failure aborts before the
    /// sidecar is updated, so `length`/`dirty` are never advanced past what
    /// actually landed on disk.
    #[instrument(skip(self, data), fields(inode_id, index, offset_in_block, len = data.len()))]
    pub async fn write_block(
        &self,
        inode_id: InodeId,
        index: BlockIndex,
        offset_in_block: u32,
        data: &[u8],
    ) -> Result<BlockMeta> {
        if offset_in_block as u64 + data.len() as u64 > self.block_size {
            return Err(Error::InvalidArg(format!(
                "write of {} bytes at offset {offset_in_block} exceeds block size {}",
                data.len(),
                self.block_size
            )));
        }
        self.ensure_inode_dir(inode_id).await?;
        let block_path = self.block_path(inode_id, index);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&block_path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset_in_block as u64))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        let sidecar_path = self.sidecar_path(inode_id, index);
        let mut meta = Sidecar::load(&sidecar_path)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(BlockMeta::not_present);
        meta.length = meta.length.max(offset_in_block + data.len() as u32);
        meta.dirty = true;
        meta.present = true;
        meta.last_access_ts = crate::model::now_secs();
        meta.checksum = None;
        Sidecar::store(&sidecar_path, &meta).await?;
        Ok(meta)
    }

    /// Writes a block fetched from the remote backend: `present=true`,
    /// `dirty=false`, stamped with the backend-supplied checksum if any
    /// (spec §4.7 `PullDownstream`'s main phase).
    #[instrument(skip(self, data), fields(inode_id, index, len = data.len()))]
    pub async fn write_pulled_block(
        &self,
        inode_id: InodeId,
        index: BlockIndex,
        data: &[u8],
        checksum: Option<[u8; 32]>,
    ) -> Result<()> {
        self.ensure_inode_dir(inode_id).await?;
        let block_path = self.block_path(inode_id, index);
        fs::write(&block_path, data).await?;
        let meta = BlockMeta {
            length: data.len() as u32,
            dirty: false,
            present: true,
            last_access_ts: crate::model::now_secs(),
            checksum,
        };
        Sidecar::store(&self.sidecar_path(inode_id, index), &meta).await
    }

    /// Clears `dirty` only if `expected_version` matches the version the
    /// caller pushed under; a stale caller (another push raced in) is a
    /// silent no-op so the block stays dirty for the next push attempt.
    #[instrument(skip(self))]
    pub async fn mark_clean(
        &self,
        inode_id: InodeId,
        index: BlockIndex,
        expected_version: u64,
        actual_version: u64,
        checksum: Option<[u8; 32]>,
    ) -> Result<()> {
        if expected_version != actual_version {
            return Ok(());
        }
        let sidecar_path = self.sidecar_path(inode_id, index);
        let Some(mut meta) = Sidecar::load(&sidecar_path).await? else {
            return Ok(());
        };
        meta.dirty = false;
        meta.checksum = checksum;
        Sidecar::store(&sidecar_path, &meta).await
    }

    /// Removes block and sidecar. Refuses if `dirty=true` so P3
    /// (dirty-no-evict) is enforced even at this layer, not only by
    /// CacheManager's eviction policy.
    #[instrument(skip(self))]
    pub async fn evict(&self, inode_id: InodeId, index: BlockIndex) -> Result<()> {
        let sidecar_path = self.sidecar_path(inode_id, index);
        if let Some(meta) = Sidecar::load(&sidecar_path).await? {
            if meta.dirty {
                return Err(Error::InvalidArg(
                    "refusing to evict a dirty block".to_string(),
                ));
            }
        }
        self.purge(inode_id, index).await
    }

    async fn purge(&self, inode_id: InodeId, index: BlockIndex) -> Result<()> {
        let _ = fs::remove_file(self.block_path(inode_id, index)).await;
        let _ = fs::remove_file(self.sidecar_path(inode_id, index)).await;
        Ok(())
    }

    /// Unconditionally removes a block and its sidecar, bypassing the
    /// dirty check `evict` enforces. Used by `truncate` to drop blocks
    /// beyond the new end of file, where any dirty data they held is gone
    /// by definition (there's nothing left to push).
    #[instrument(skip(self))]
    pub async fn purge_inode_block(&self, inode_id: InodeId, index: BlockIndex) -> Result<()> {
        self.purge(inode_id, index).await
    }

    /// Enumerates present blocks for an inode in ascending index order.
    #[instrument(skip(self))]
    pub async fn iterate(&self, inode_id: InodeId) -> Result<Vec<(BlockIndex, BlockMeta)>> {
        let dir = self.inode_dir(inode_id);
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(index_str) = name.strip_suffix(".meta") else {
                continue;
            };
            let Ok(index) = index_str.parse::<BlockIndex>() else {
                continue;
            };
            if let Some(meta) = Sidecar::load(&self.sidecar_path(inode_id, index)).await? {
                if meta.present {
                    out.push((index, meta));
                }
            }
        }
        out.sort_by_key(|(index, _)| *index);
        Ok(out)
    }

    /// Deletes every block belonging to an inode (used on unlink
    /// finalization and GC of orphans found during the startup sweep).
    #[instrument(skip(self))]
    pub async fn purge_inode(&self, inode_id: InodeId) -> Result<()> {
        let dir = self.inode_dir(inode_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All inode ids for which a shard directory currently exists on disk;
    /// used by the startup consistency sweep (spec §6, invariant I1) to
    /// find blocks with no InodeStore row.
    pub async fn all_inode_ids(&self) -> Result<Vec<InodeId>> {
        let mut out = Vec::new();
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut inodes = fs::read_dir(shard.path()).await?;
            while let Some(inode_dir) = inodes.next_entry().await? {
                if let Ok(id) = inode_dir.file_name().to_string_lossy().parse::<InodeId>() {
                    out.push(id);
                }
            }
        }
        Ok(out)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (BlockStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (BlockStore::new(dir.path(), 16), dir)
    }

    #[tokio::test]
    async fn missing_block_reads_as_missing() {
        let (bs, _dir) = store().await;
        match bs.read_block(1, 0).await.unwrap() {
            ReadBlock::Missing => {}
            _ => panic!("expected missing"),
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (bs, _dir) = store().await;
        bs.write_block(1, 0, 0, b"hello").await.unwrap();
        match bs.read_block(1, 0).await.unwrap() {
            ReadBlock::Present { data, meta } => {
                assert_eq!(&data[..], b"hello");
                assert!(meta.dirty);
                assert_eq!(meta.length, 5);
            }
            ReadBlock::Missing => panic!("expected present"),
        }
    }

    #[tokio::test]
    async fn write_extends_length_without_truncating_prior_bytes() {
        let (bs, _dir) = store().await;
        bs.write_block(1, 0, 0, b"abcdefgh").await.unwrap();
        bs.write_block(1, 0, 8, b"ij").await.unwrap();
        match bs.read_block(1, 0).await.unwrap() {
            ReadBlock::Present { data, .. } => assert_eq!(&data[..], b"abcdefghij"),
            ReadBlock::Missing => panic!("expected present"),
        }
    }

    #[tokio::test]
    async fn evict_refuses_dirty_block() {
        let (bs, _dir) = store().await;
        bs.write_block(1, 0, 0, b"x").await.unwrap();
        assert!(bs.evict(1, 0).await.is_err());
    }

    #[tokio::test]
    async fn mark_clean_then_evict_succeeds() {
        let (bs, _dir) = store().await;
        bs.write_block(1, 0, 0, b"x").await.unwrap();
        bs.mark_clean(1, 0, 0, 0, None).await.unwrap();
        bs.evict(1, 0).await.unwrap();
        match bs.read_block(1, 0).await.unwrap() {
            ReadBlock::Missing => {}
            _ => panic!("expected missing after evict"),
        }
    }

    #[tokio::test]
    async fn mark_clean_rejects_mismatched_version() {
        let (bs, _dir) = store().await;
        bs.write_block(1, 0, 0, b"x").await.unwrap();
        bs.mark_clean(1, 0, 5, 0, None).await.unwrap();
        match bs.read_block(1, 0).await.unwrap() {
            ReadBlock::Present { meta, .. } => assert!(meta.dirty),
            ReadBlock::Missing => panic!("expected present"),
        }
    }

    #[tokio::test]
    async fn iterate_returns_ascending_order() {
        let (bs, _dir) = store().await;
        bs.write_block(1, 2, 0, b"c").await.unwrap();
        bs.write_block(1, 0, 0, b"a").await.unwrap();
        bs.write_block(1, 1, 0, b"b").await.unwrap();
        let indices: Vec<_> = bs.iterate(1).await.unwrap().into_iter().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
