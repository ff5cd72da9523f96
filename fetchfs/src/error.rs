use std::io;

use thiserror::Error;

/// Failures reported by a remote transport.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote object does not exist.
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// The session could not be established, was closed, or a remote call
    /// failed for any reason other than object absence.
    #[error("remote connection error: {0}")]
    Connection(String),

    /// Writing the fetched content into the local cache failed.
    #[error(transparent)]
    Local(#[from] io::Error),
}

impl RemoteError {
    pub fn connection(msg: impl Into<String>) -> Self {
        RemoteError::Connection(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// Errors surfaced by the overlay engine to the filesystem bridge.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("local I/O error: {0}")]
    LocalIo(#[from] io::Error),
}

impl FsError {
    /// POSIX errno the bridge replies with.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Connection(_) => libc::EIO,
            FsError::LocalIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<RemoteError> for FsError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(path) => FsError::NotFound(path),
            RemoteError::Connection(msg) => FsError::Connection(msg),
            RemoteError::Local(e) => FsError::LocalIo(e),
        }
    }
}

impl From<nix::Error> for FsError {
    fn from(err: nix::Error) -> Self {
        FsError::LocalIo(io::Error::from(err))
    }
}

impl From<FsError> for rfuse3::Errno {
    fn from(err: FsError) -> Self {
        rfuse3::Errno::from(err.errno())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
