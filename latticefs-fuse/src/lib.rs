//! FUSE wire glue for `latticefs-core`'s engine. Everything that knows about
//! `fuse_backend_rs` lives here; everything that knows about the remote
//! backend, the block cache and the sync protocol lives in
//! `latticefs-core`, which has no idea FUSE exists.

mod attr;
mod daemon;
mod fs;

pub use daemon::FuseDaemon;
pub use fs::LatticeFs;
