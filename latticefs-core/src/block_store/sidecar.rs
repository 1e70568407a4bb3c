//! Per-block metadata file. Plain `serde_json`, matching the teacher's
//! preference for human-inspectable manifests over a binary format for data
//! this small and infrequently written (SPEC_FULL §4.1).

use crate::error::Result;
use crate::model::BlockMeta;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Serialize, Deserialize)]
struct OnDisk {
    length: u32,
    dirty: bool,
    present: bool,
    last_access_ts: u64,
    checksum: Option<[u8; 32]>,
}

impl From<&BlockMeta> for OnDisk {
    fn from(m: &BlockMeta) -> Self {
        OnDisk {
            length: m.length,
            dirty: m.dirty,
            present: m.present,
            last_access_ts: m.last_access_ts,
            checksum: m.checksum,
        }
    }
}

impl From<OnDisk> for BlockMeta {
    fn from(d: OnDisk) -> Self {
        BlockMeta {
            length: d.length,
            dirty: d.dirty,
            present: d.present,
            last_access_ts: d.last_access_ts,
            checksum: d.checksum,
        }
    }
}

pub struct Sidecar;

impl Sidecar {
    pub async fn load(path: &Path) -> Result<Option<BlockMeta>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let on_disk: OnDisk = serde_json::from_slice(&bytes)
                    .map_err(|e| crate::error::Error::Corrupt(e.to_string()))?;
                Ok(Some(on_disk.into()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn store(path: &Path, meta: &BlockMeta) -> Result<()> {
        let on_disk: OnDisk = meta.into();
        let bytes = serde_json::to_vec(&on_disk)
            .map_err(|e| crate::error::Error::Storage(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, bytes).await?;
        Ok(())
    }
}
