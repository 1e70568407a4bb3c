//! Mount/unmount lifecycle, copied nearly verbatim from `tvix-castore`'s
//! `fs/fuse.rs`: one `FuseChannel`-reading thread per configured worker,
//! feeding `fuse_backend_rs::api::server::Server::handle_message`.

use std::path::Path;
use std::{io, thread};

use fuse_backend_rs::api::filesystem::FileSystem;
use fuse_backend_rs::transport::{FuseChannel, FuseSession};
use std::sync::Arc;
use tracing::{error, instrument};

struct FuseServer<FS>
where
    FS: FileSystem + Sync + Send,
{
    server: Arc<fuse_backend_rs::api::server::Server<Arc<FS>>>,
    channel: FuseChannel,
}

#[cfg(target_os = "macos")]
const BADFD: libc::c_int = libc::EBADF;
#[cfg(target_os = "linux")]
const BADFD: libc::c_int = libc::EBADFD;

impl<FS> FuseServer<FS>
where
    FS: FileSystem + Sync + Send,
{
    fn start(&mut self) -> io::Result<()> {
        while let Some((reader, writer)) = self
            .channel
            .get_request()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?
        {
            if let Err(e) = self.server.handle_message(reader, writer.into(), None, None) {
                match e {
                    fuse_backend_rs::Error::EncodeMessage(e) if e.raw_os_error() == Some(BADFD) => break,
                    error => {
                        error!(?error, "failed to handle fuse request");
                        continue;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Owns the mounted `FuseSession` and its worker threads; dropping it
/// unmounts.
pub struct FuseDaemon {
    session: FuseSession,
    threads: Vec<thread::JoinHandle<()>>,
}

impl FuseDaemon {
    #[instrument(skip(fs, mountpoint), fields(mountpoint = ?mountpoint.as_ref()), err)]
    pub fn new<FS, P>(fs: FS, mountpoint: P, threads: usize, allow_other: bool) -> io::Result<Self>
    where
        FS: FileSystem + Sync + Send + 'static,
        P: AsRef<Path>,
    {
        let server = Arc::new(fuse_backend_rs::api::server::Server::new(Arc::new(fs)));

        let mut session = FuseSession::new(mountpoint.as_ref(), "latticefs", "", true)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        #[cfg(target_os = "linux")]
        session.set_allow_other(allow_other);
        #[cfg(not(target_os = "linux"))]
        let _ = allow_other;

        session.mount().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let mut join_handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let mut worker = FuseServer {
                server: server.clone(),
                channel: session
                    .new_channel()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?,
            };
            let join_handle = thread::Builder::new()
                .name("latticefs-fuse-worker".to_string())
                .spawn(move || {
                    let _ = worker.start();
                })?;
            join_handles.push(join_handle);
        }

        Ok(FuseDaemon { session, threads: join_handles })
    }

    #[instrument(skip_all, err)]
    pub fn unmount(&mut self) -> io::Result<()> {
        self.session.umount().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        for thread in self.threads.drain(..) {
            thread
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "failed to join fuse worker thread"))?;
        }
        Ok(())
    }
}

impl Drop for FuseDaemon {
    fn drop(&mut self) {
        if let Err(error) = self.unmount() {
            error!(?error, "failed to unmount latticefs");
        }
    }
}
