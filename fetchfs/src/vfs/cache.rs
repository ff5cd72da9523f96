//! Fetch-on-demand cache fill.
//!
//! Cache membership is exactly "something exists at the local path": there is
//! no index beside the filesystem. Once present, the local copy is
//! authoritative forever and is never compared against the remote again. A
//! fetch finishing after a local create or write leaves the local object alone.

use crate::error::{FsError, Result};
use crate::remote::{RemoteSession, Transport};
use crate::vfs::attr::FileKind;
use crate::vfs::path::{PathResolver, VirtualPath};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::{debug, info, warn};

/// Name prefix of in-flight downloads. They live next to their final path and
/// are hidden from directory listings.
pub const STAGING_PREFIX: &str = ".fetchfs-partial.";

pub fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX)
}

/// Whether anything (file, directory or symlink) exists at `path`.
pub(crate) async fn local_exists(path: &Path) -> std::io::Result<bool> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub struct CacheFill<T: Transport> {
    resolver: PathResolver,
    session: Arc<RemoteSession<T>>,
    // one lock per local path with a fetch in progress
    inflight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: Transport> CacheFill<T> {
    pub fn new(resolver: PathResolver, session: Arc<RemoteSession<T>>) -> Self {
        Self {
            resolver,
            session,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure the local cache holds `vp`. Returns whether the local path
    /// exists afterwards; `false` means the remote has no such object either,
    /// which is not an error here.
    ///
    /// Concurrent callers for the same path wait for the first one and then
    /// observe its result, so each path is fetched at most once.
    pub async fn ensure_cached(&self, vp: &VirtualPath) -> Result<bool> {
        let local = self.resolver.local(vp);
        if local_exists(&local).await? {
            return Ok(true);
        }

        let lock = self.lock_for(&local);
        let result = {
            let _guard = lock.lock().await;
            match local_exists(&local).await {
                Ok(true) => Ok(true),
                Ok(false) => self.fill(vp, &local).await,
                Err(e) => Err(e.into()),
            }
        };
        self.release(&local, lock);
        result
    }

    fn lock_for(&self, local: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(local.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release(&self, local: &Path, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(l) = map.get(local)
            && Arc::strong_count(l) == 1
        {
            map.remove(local);
        }
    }

    async fn fill(&self, vp: &VirtualPath, local: &Path) -> Result<bool> {
        let remote = self.resolver.remote(vp);
        let attr = match self.session.stat(&remote).await {
            Ok(attr) => attr,
            Err(e) if e.is_not_found() => {
                debug!("{vp}: not present remotely, nothing to cache");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = local.parent() {
            // tolerates concurrent creation of the same directories
            fs::create_dir_all(parent).await?;
        }

        let perm = std::fs::Permissions::from_mode(u32::from(attr.perm));
        if attr.kind == FileKind::Dir {
            match fs::create_dir(local).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(true),
                Err(e) => return Err(e.into()),
            }
            fs::set_permissions(local, perm).await?;
            debug!("{vp}: materialized remote directory");
            return Ok(true);
        }

        let staging = staging_path(local);
        match self.session.fetch(&remote, &staging).await {
            Ok(()) => {}
            Err(e) => {
                discard(&staging).await;
                if e.is_not_found() {
                    debug!("{vp}: vanished remotely before fetch");
                    return Ok(false);
                }
                warn!("{vp}: fetch from {} failed: {e}", remote.display());
                return Err(FsError::from(e));
            }
        }
        let published = publish(&staging, local, perm).await;
        discard(&staging).await;
        if !published? {
            debug!("{vp}: created locally during fetch, keeping the local copy");
            return Ok(true);
        }
        info!("{vp}: fetched {} bytes", attr.size);
        Ok(true)
    }
}

fn staging_path(local: &Path) -> PathBuf {
    let name = format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4());
    match local.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Link the finished download to its final name. Never replaces an object
/// that appeared at `local` while the fetch ran; returns `false` in that case.
/// The staging name stays behind for the caller to remove.
async fn publish(staging: &Path, local: &Path, perm: std::fs::Permissions) -> std::io::Result<bool> {
    fs::set_permissions(staging, perm).await?;
    match fs::hard_link(staging, local).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

async fn discard(staging: &Path) {
    if let Err(e) = fs::remove_file(staging).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!("failed to remove staging file {}: {e}", staging.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::remote::localfs::LocalDirConnection;
    use crate::remote::{Connection, LocalDirTransport};
    use crate::vfs::attr::{Attributes, DirEntry};

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, CacheFill<LocalDirTransport>) {
        let cache = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(cache.path(), remote.path());
        let session = Arc::new(RemoteSession::new(LocalDirTransport::new()));
        (cache, remote, CacheFill::new(resolver, session))
    }

    #[tokio::test]
    async fn test_fetch_creates_parents_and_copies_content() {
        let (cache, remote, fill) = setup();
        std::fs::create_dir_all(remote.path().join("a/b")).unwrap();
        std::fs::write(remote.path().join("a/b/c.bin"), b"remote-bytes").unwrap();

        assert!(fill.ensure_cached(&VirtualPath::new("/a/b/c.bin")).await.unwrap());
        assert_eq!(
            std::fs::read(cache.path().join("a/b/c.bin")).unwrap(),
            b"remote-bytes"
        );
        assert!(fill.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_remote_creates_nothing() {
        let (cache, _remote, fill) = setup();
        assert!(!fill.ensure_cached(&VirtualPath::new("/x/y.txt")).await.unwrap());
        assert!(!cache.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_remote_directory_is_materialized() {
        let (cache, remote, fill) = setup();
        std::fs::create_dir(remote.path().join("dir")).unwrap();
        std::fs::write(remote.path().join("dir/inner"), b"i").unwrap();

        assert!(fill.ensure_cached(&VirtualPath::new("dir")).await.unwrap());
        assert!(cache.path().join("dir").is_dir());
        // directory contents are not fetched eagerly
        assert!(!cache.path().join("dir/inner").exists());
    }

    #[tokio::test]
    async fn test_remote_permissions_carried_over() {
        let (cache, remote, fill) = setup();
        let p = remote.path().join("script.sh");
        std::fs::write(&p, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o751)).unwrap();

        fill.ensure_cached(&VirtualPath::new("script.sh")).await.unwrap();
        let md = std::fs::metadata(cache.path().join("script.sh")).unwrap();
        assert_eq!(md.permissions().mode() & 0o7777, 0o751);
    }

    #[tokio::test]
    async fn test_cached_copy_is_never_refreshed() {
        let (cache, remote, fill) = setup();
        std::fs::write(remote.path().join("f"), b"v1").unwrap();
        fill.ensure_cached(&VirtualPath::new("f")).await.unwrap();
        std::fs::write(remote.path().join("f"), b"version-2").unwrap();
        fill.ensure_cached(&VirtualPath::new("f")).await.unwrap();
        assert_eq!(std::fs::read(cache.path().join("f")).unwrap(), b"v1");
    }

    /// Writes part of the content, then loses the connection.
    struct BrokenFetch;

    struct BrokenFetchConn;

    #[async_trait::async_trait]
    impl Transport for BrokenFetch {
        type Conn = BrokenFetchConn;

        async fn connect(&self) -> std::result::Result<Self::Conn, RemoteError> {
            Ok(BrokenFetchConn)
        }
    }

    #[async_trait::async_trait]
    impl Connection for BrokenFetchConn {
        async fn stat(&self, path: &Path) -> std::result::Result<Attributes, RemoteError> {
            LocalDirConnection.stat(path).await
        }

        async fn list_dir(&self, path: &Path) -> std::result::Result<Vec<DirEntry>, RemoteError> {
            LocalDirConnection.list_dir(path).await
        }

        async fn fetch(&self, _remote: &Path, dest: &Path) -> std::result::Result<(), RemoteError> {
            std::fs::write(dest, b"half")?;
            Err(RemoteError::connection("stream reset mid-transfer"))
        }

        async fn close(&self) -> std::result::Result<(), RemoteError> {
            Ok(())
        }
    }

    fn staging_leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| is_staging_name(name))
            .collect()
    }

    #[tokio::test]
    async fn test_interrupted_fetch_leaves_nothing_behind() {
        let cache = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        std::fs::create_dir(remote.path().join("d")).unwrap();
        std::fs::write(remote.path().join("d/big.bin"), b"complete remote body").unwrap();
        let resolver = PathResolver::new(cache.path(), remote.path());
        let fill = CacheFill::new(resolver, Arc::new(RemoteSession::new(BrokenFetch)));

        let err = fill
            .ensure_cached(&VirtualPath::new("d/big.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Connection(_)), "{err:?}");
        assert!(!cache.path().join("d/big.bin").exists());
        assert!(staging_leftovers(&cache.path().join("d")).is_empty());
        assert!(fill.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_keeps_object_created_meanwhile() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("f");
        let staging = staging_path(&local);
        std::fs::write(&staging, b"remote").unwrap();
        std::fs::write(&local, b"local").unwrap();

        let perm = std::fs::Permissions::from_mode(0o644);
        assert!(!publish(&staging, &local, perm.clone()).await.unwrap());
        assert_eq!(std::fs::read(&local).unwrap(), b"local");

        std::fs::remove_file(&local).unwrap();
        assert!(publish(&staging, &local, perm).await.unwrap());
        assert_eq!(std::fs::read(&local).unwrap(), b"remote");
    }

    #[test]
    fn test_staging_names() {
        let p = staging_path(Path::new("/cache/a/file"));
        assert_eq!(p.parent(), Some(Path::new("/cache/a")));
        assert!(is_staging_name(p.file_name().unwrap().to_str().unwrap()));
        assert!(!is_staging_name("file"));
    }
}
