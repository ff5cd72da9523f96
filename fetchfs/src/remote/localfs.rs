//! Local directory transport: the "remote" store is a tree on this host.

use crate::error::RemoteError;
use crate::remote::{Connection, Transport};
use crate::vfs::attr::{Attributes, DirEntry, FileKind};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Clone, Debug, Default)]
pub struct LocalDirTransport;

impl LocalDirTransport {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
pub struct LocalDirConnection;

#[async_trait]
impl Transport for LocalDirTransport {
    type Conn = LocalDirConnection;

    async fn connect(&self) -> Result<Self::Conn, RemoteError> {
        Ok(LocalDirConnection)
    }
}

fn classify(err: std::io::Error, path: &Path) -> RemoteError {
    if err.kind() == ErrorKind::NotFound {
        RemoteError::NotFound(path.display().to_string())
    } else {
        RemoteError::connection(format!("{}: {err}", path.display()))
    }
}

#[async_trait]
impl Connection for LocalDirConnection {
    async fn stat(&self, path: &Path) -> Result<Attributes, RemoteError> {
        let md = fs::symlink_metadata(path)
            .await
            .map_err(|e| classify(e, path))?;
        Ok(Attributes::from(&md))
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>, RemoteError> {
        let mut rd = fs::read_dir(path).await.map_err(|e| classify(e, path))?;
        let mut entries = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(|e| classify(e, path))? {
            let ft = entry.file_type().await.map_err(|e| classify(e, path))?;
            let kind = if ft.is_dir() {
                FileKind::Dir
            } else if ft.is_symlink() {
                FileKind::Symlink
            } else {
                FileKind::File
            };
            entries.push(DirEntry::new(entry.file_name().to_string_lossy(), kind));
        }
        Ok(entries)
    }

    async fn fetch(&self, remote: &Path, dest: &Path) -> Result<(), RemoteError> {
        let mut src = fs::File::open(remote)
            .await
            .map_err(|e| classify(e, remote))?;
        let mut out = fs::File::create(dest).await?;
        tokio::io::copy(&mut src, &mut out).await?;
        out.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}
