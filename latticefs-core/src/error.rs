use thiserror::Error;

/// Errors the core distinguishes, per the error-kind taxonomy of the mount's
/// design: deterministic POSIX translations, optimistic-concurrency/lock
/// recoveries that should never reach a caller, and backend/storage failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    Permission,
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Optimistic-concurrency failure on an InodeStore `update`. Recovered
    /// internally by SyncEngine's rebase-and-retry; never surfaced to FUSE
    /// callers.
    #[error("stale version")]
    Stale,

    /// Lock contention in CoordStore. Recovered by bounded retry with
    /// backoff; never surfaced to FUSE callers.
    #[error("busy")]
    Busy,

    /// The remote backend could not be reached, or returned an error, after
    /// exhausting retries.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Cache capacity could not be reclaimed (all blocks dirty, forced flush
    /// also failed). Surfaced as ENOSPC.
    #[error("cache full")]
    CacheFull,

    /// Sidecar/block mismatch or checksum failure. Surfaced only if re-fetch
    /// also fails.
    #[error("corrupt block: {0}")]
    Corrupt(String),

    /// Invariant violation. The mount is marked read-only; a diagnostic event
    /// is published.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// POSIX errno this error kind translates to at the FUSE boundary.
    ///
    /// `Stale` and `Busy` have no entry here: both are recovered internally
    /// (rebase-and-retry, bounded backoff) and must never escape to a caller.
    /// Reaching this function with either is a bug in the caller, so we map
    /// them to `EIO` rather than panic.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::Exists => libc::EEXIST,
            Error::NotDir => libc::ENOTDIR,
            Error::IsDir => libc::EISDIR,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::Permission => libc::EACCES,
            Error::InvalidArg(_) => libc::EINVAL,
            Error::Stale | Error::Busy => libc::EIO,
            Error::BackendUnavailable(_) => libc::EIO,
            Error::CacheFull => libc::ENOSPC,
            Error::Corrupt(_) => libc::EIO,
            Error::Fatal(_) => libc::EROFS,
            Error::Storage(_) => libc::EIO,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        std::io::Error::from_raw_os_error(value.to_errno())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound,
            std::io::ErrorKind::AlreadyExists => Error::Exists,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                Error::InvalidArg(value.to_string())
            }
            _ => Error::Storage(value.to_string()),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => Error::NotFound,
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        Error::Storage(value.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::BackendUnavailable(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
