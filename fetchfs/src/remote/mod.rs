//! Remote store adapters
//!
//! Submodules:
//! - `session`: the lazily connected, process-wide serialized session handle
//! - `sftp`: SFTP transport over SSH (`ssh2`)
//! - `localfs`: a directory on the local host standing in for the remote
//!   store, used by the `mount_local` demo and tests
//!
//! The engine never writes to the remote side, so the contract is read-only:
//! stat, list and full-file fetch.
use crate::error::RemoteError;
use crate::vfs::attr::{Attributes, DirEntry};
use async_trait::async_trait;
use std::path::Path;

pub mod localfs;
pub mod session;
pub mod sftp;

pub use localfs::LocalDirTransport;
pub use session::RemoteSession;
pub use sftp::SftpTransport;

/// Establishes connections to a remote store.
#[async_trait]
pub trait Transport: Send + Sync {
    type Conn: Connection + 'static;

    async fn connect(&self) -> Result<Self::Conn, RemoteError>;
}

/// One authenticated connection. Callers serialize access through
/// [`RemoteSession`], implementations need not be safe for concurrent use.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Metadata of the object itself (symlinks are not followed).
    async fn stat(&self, path: &Path) -> Result<Attributes, RemoteError>;

    /// Entries of a directory, without `.` and `..`.
    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, RemoteError>;

    /// Copy the whole remote file into `dest`, creating or truncating it.
    async fn fetch(&self, remote: &Path, dest: &Path) -> Result<(), RemoteError>;

    async fn close(&self) -> Result<(), RemoteError>;
}
