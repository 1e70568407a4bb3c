//! The configuration object the mount driver is responsible for assembling
//! (spec §6). The CLI/mount driver itself is an external collaborator; this
//! struct is the contract it must fill in before calling [`crate::mount`].

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_block_size() -> u64 {
    128 * 1024
}

fn default_cache_bytes_max() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_block_ttl_secs() -> u64 {
    300
}

fn default_network_timeout_secs() -> u64 {
    30
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_download_concurrency_global() -> usize {
    16
}

fn default_download_concurrency_per_inode() -> usize {
    4
}

fn default_upload_concurrency_global() -> usize {
    4
}

fn default_push_retry_attempts() -> u32 {
    5
}

fn default_dirty_flush_interval_secs() -> u64 {
    10
}

/// Mount-time configuration. Deserializable from the JSON/TOML file the CLI
/// driver loads, matching the object named in spec §6.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for the local block cache and its metadata sidecar.
    pub cache_root: PathBuf,

    /// Soft cap on local cache size, in bytes. Exceeding it triggers LRU
    /// eviction of clean blocks (spec §4.4).
    #[serde(default = "default_cache_bytes_max")]
    pub cache_bytes_max: u64,

    /// Fixed block size. Mount-time constant; default 128 KiB (spec §4.1).
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Freshness window for present blocks before they're treated as a miss.
    #[serde(default = "default_block_ttl_secs")]
    pub block_ttl_secs: u64,

    /// Timeout applied to every remote backend call.
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,

    /// Base URL of the remote (Tahoe-LAFS-style) backend's capability API.
    pub remote_endpoint: String,

    /// The capability naming the mount's root directory.
    pub root_capability: String,

    /// Connection string for the InodeStore (a SQLite database file URL, or
    /// `sqlite::memory:` for ephemeral testing mounts).
    pub inode_store_url: String,

    /// Connection string for the CoordStore (a `redis://` URL).
    pub coord_store_url: String,

    /// TTL applied to CoordStore lock acquisitions.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Global concurrent-download budget.
    #[serde(default = "default_download_concurrency_global")]
    pub download_concurrency_global: usize,

    /// Per-inode concurrent-download budget.
    #[serde(default = "default_download_concurrency_per_inode")]
    pub download_concurrency_per_inode: usize,

    /// Global concurrent-upload budget (uploads are also serialized
    /// per-inode by CoordStore, independent of this limit).
    #[serde(default = "default_upload_concurrency_global")]
    pub upload_concurrency_global: usize,

    /// Bounded retry attempts for a rebase-and-retry push after STALE.
    #[serde(default = "default_push_retry_attempts")]
    pub push_retry_attempts: u32,

    /// How often the mount proactively flushes dirty blocks in the
    /// background, independent of explicit fsync calls.
    #[serde(default = "default_dirty_flush_interval_secs")]
    pub dirty_flush_interval_secs: u64,

    /// Whether to list elements at the root of the mount (some backends
    /// can't enumerate their root cheaply).
    #[serde(default)]
    pub list_root: bool,
}

impl Config {
    pub fn block_ttl(&self) -> Duration {
        Duration::from_secs(self.block_ttl_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn dirty_flush_interval(&self) -> Duration {
        Duration::from_secs(self.dirty_flush_interval_secs)
    }

    /// Load from a JSON config file. Left minimal deliberately: the actual
    /// argument grammar (env vars, CLI flags overriding file values) is the
    /// mount driver's concern, not the core's.
    pub fn from_json_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| crate::error::Error::InvalidArg(format!("invalid config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_omitted() {
        let json = serde_json::json!({
            "cache_root": "/var/cache/latticefs",
            "remote_endpoint": "https://example.invalid/uri",
            "root_capability": "URI:DIR2:abc:def",
            "inode_store_url": "sqlite::memory:",
            "coord_store_url": "redis://127.0.0.1/",
        });
        let cfg: Config = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.block_size, default_block_size());
        assert_eq!(cfg.cache_bytes_max, default_cache_bytes_max());
        assert_eq!(cfg.push_retry_attempts, 5);
        assert!(!cfg.list_root);
    }
}
