//! The downward external interface (spec §6): a minimal capability-style
//! client the core consumes to talk to the distributed, content-addressed
//! remote backend. The transport itself (HTTP to a Tahoe-LAFS-style WAPI) is
//! an external collaborator; this module only defines and consumes its
//! contract.

mod http;
mod memory;

pub use http::HttpRemoteBackend;
pub use memory::MemoryRemoteBackend;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An opaque capability/identifier understood by the remote backend. Never
/// interpreted locally beyond byte-equality and round-tripping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef(pub String);

impl RemoteRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteNodeKind {
    File,
    Directory,
    Symlink,
}

/// One entry as returned by `get_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDirEntry {
    pub name: String,
    pub child_ref: RemoteRef,
    pub kind: RemoteNodeKind,
}

/// A byte range for partial `get_object` reads.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// The capability interface the core consumes from the remote backend, per
/// spec §6's table. Implementations must apply `network_timeout` themselves
/// and translate transport failures into [`crate::error::Error::BackendUnavailable`].
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Fetch bytes for `r`, optionally restricted to `range`. `NotFound` if
    /// the capability does not resolve.
    async fn get_object(&self, r: &RemoteRef, range: Option<ByteRange>) -> Result<Bytes>;

    /// Upload `bytes` as a new object, returning the capability naming it.
    async fn put_object(&self, bytes: Bytes) -> Result<RemoteRef>;

    /// List the entries of a directory capability.
    async fn get_dir(&self, r: &RemoteRef) -> Result<Vec<RemoteDirEntry>>;

    /// Replace a directory's entries, returning the new capability.
    async fn put_dir(&self, r: &RemoteRef, entries: Vec<RemoteDirEntry>) -> Result<RemoteRef>;

    /// Delete the object named by `r`. `NotFound` is not an error here: a
    /// delete of an already-gone object is treated as success by callers.
    async fn delete(&self, r: &RemoteRef) -> Result<()>;
}
