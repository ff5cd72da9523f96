//! Path-based overlay operations: reads consult the local cache first and the
//! remote store second; mutations pull the object into the cache and then
//! touch the local copy only. Nothing is ever written to the remote store.

use crate::config::Config;
use crate::error::{FsError, Result};
use crate::remote::{RemoteSession, SftpTransport, Transport};
use crate::vfs::attr::{Attributes, DirEntry, FileKind};
use crate::vfs::cache::{CacheFill, is_staging_name, local_exists};
use crate::vfs::path::{PathResolver, VirtualPath};
use nix::sys::stat::{UtimensatFlags, utimensat};
use nix::sys::time::TimeSpec;
use nix::unistd::{Gid, Uid};
use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Capacity figures of the filesystem holding the cache root.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub frsize: u32,
    pub namelen: u32,
}

pub struct OverlayFs<T: Transport> {
    resolver: PathResolver,
    session: Arc<RemoteSession<T>>,
    cache: CacheFill<T>,
}

impl OverlayFs<SftpTransport> {
    /// Engine over the SFTP store described by `cfg`. No connection is made
    /// until the first remote access.
    pub fn from_config(cfg: &Config) -> Self {
        OverlayFs::new(
            cfg.cache_root(),
            cfg.ssh.path.clone(),
            SftpTransport::from_config(&cfg.ssh),
        )
    }
}

impl<T: Transport> OverlayFs<T> {
    pub fn new(cache_root: impl AsRef<Path>, remote_root: impl AsRef<Path>, transport: T) -> Self {
        let resolver = PathResolver::new(cache_root.as_ref(), remote_root.as_ref());
        let session = Arc::new(RemoteSession::new(transport));
        let cache = CacheFill::new(resolver.clone(), session.clone());
        Self {
            resolver,
            session,
            cache,
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn session(&self) -> &RemoteSession<T> {
        &self.session
    }

    pub async fn ensure_cached(&self, vp: &VirtualPath) -> Result<bool> {
        self.cache.ensure_cached(vp).await
    }

    /// Local metadata when the path is cached, otherwise the remote's.
    #[instrument(level = "debug", skip(self))]
    pub async fn getattr(&self, vp: &VirtualPath) -> Result<Attributes> {
        let local = self.resolver.local(vp);
        match fs::symlink_metadata(&local).await {
            Ok(md) => return Ok(Attributes::from(&md)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.session
            .stat(&self.resolver.remote(vp))
            .await
            .map_err(FsError::from)
    }

    /// Union of the local and remote listings plus `.` and `..`, sorted by
    /// name. A name present on both sides is reported once with the local
    /// type.
    #[instrument(level = "debug", skip(self))]
    pub async fn readdir(&self, vp: &VirtualPath) -> Result<Vec<DirEntry>> {
        let mut merged: BTreeMap<String, FileKind> = BTreeMap::new();

        let local = self.resolver.local(vp);
        let local_dir = match fs::symlink_metadata(&local).await {
            Ok(md) if md.is_dir() => true,
            Ok(_) => return Err(std::io::Error::from_raw_os_error(libc::ENOTDIR).into()),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        match self.session.list_dir(&self.resolver.remote(vp)).await {
            Ok(entries) => {
                for e in entries {
                    merged.insert(e.name, e.kind);
                }
            }
            // a directory made locally with mkdir has no remote counterpart
            Err(e) if e.is_not_found() && local_dir => {}
            Err(e) => return Err(e.into()),
        }

        if local_dir {
            let mut rd = fs::read_dir(&local).await?;
            while let Some(entry) = rd.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_staging_name(&name) {
                    continue;
                }
                let ft = entry.file_type().await?;
                let kind = if ft.is_dir() {
                    FileKind::Dir
                } else if ft.is_symlink() {
                    FileKind::Symlink
                } else {
                    FileKind::File
                };
                merged.insert(name, kind);
            }
        }

        let mut out = Vec::with_capacity(merged.len() + 2);
        out.push(DirEntry::new(".", FileKind::Dir));
        out.push(DirEntry::new("..", FileKind::Dir));
        out.extend(
            merged
                .into_iter()
                .filter(|(name, _)| name != "." && name != "..")
                .map(|(name, kind)| DirEntry::new(name, kind)),
        );
        Ok(out)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn read(&self, vp: &VirtualPath, offset: u64, size: u32) -> Result<Vec<u8>> {
        if !self.cache.ensure_cached(vp).await? {
            return Err(FsError::NotFound(vp.to_string()));
        }
        let mut file = fs::File::open(self.resolver.local(vp)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(size as usize);
        file.take(u64::from(size)).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Write at `offset` into the cached copy, fetching the full remote file
    /// first. A path unknown on both sides becomes a new local file.
    #[instrument(level = "debug", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, vp: &VirtualPath, offset: u64, data: &[u8]) -> Result<usize> {
        let local = self.resolver.local(vp);
        if !self.cache.ensure_cached(vp).await? {
            create_parents(&local).await?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&local)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }

    /// New empty local file; an existing cached file is left untouched.
    #[instrument(level = "debug", skip(self))]
    pub async fn create(&self, vp: &VirtualPath, mode: u32) -> Result<Attributes> {
        let local = self.resolver.local(vp);
        create_parents(&local).await?;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(mode & 0o7777)
            .open(&local)
            .await?;
        self.getattr(vp).await
    }

    /// Local only: nothing is fetched for a directory that is being created.
    #[instrument(level = "debug", skip(self))]
    pub async fn mkdir(&self, vp: &VirtualPath, mode: u32) -> Result<()> {
        let local = self.resolver.local(vp);
        create_parents(&local).await?;
        fs::DirBuilder::new().mode(mode & 0o7777).create(&local).await?;
        Ok(())
    }

    /// Removes the local directory; succeeds without effect when there is none.
    #[instrument(level = "debug", skip(self))]
    pub async fn rmdir(&self, vp: &VirtualPath) -> Result<()> {
        let local = self.resolver.local(vp);
        if !local_exists(&local).await? {
            debug!("{vp}: no local directory, rmdir is a no-op");
            return Ok(());
        }
        fs::remove_dir(&local).await?;
        Ok(())
    }

    /// Removes the cached copy only. The remote object stays, so the path
    /// resolves to it again afterwards.
    #[instrument(level = "debug", skip(self))]
    pub async fn unlink(&self, vp: &VirtualPath) -> Result<()> {
        fs::remove_file(self.resolver.local(vp)).await?;
        Ok(())
    }

    /// Caches the source and renames it locally. The remote object under the
    /// old name is untouched: once the old local entry is gone, the old path
    /// resolves to (and re-fetches) the remote object again.
    #[instrument(level = "debug", skip(self))]
    pub async fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> Result<()> {
        self.cache.ensure_cached(from).await?;
        let dest = self.resolver.local(to);
        create_parents(&dest).await?;
        fs::rename(self.resolver.local(from), &dest).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn chmod(&self, vp: &VirtualPath, mode: u32) -> Result<()> {
        let local = self.cached_local(vp).await?;
        fs::set_permissions(&local, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn chown(&self, vp: &VirtualPath, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let local = self.cached_local(vp).await?;
        nix::unistd::chown(&local, uid.map(Uid::from_raw), gid.map(Gid::from_raw))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn truncate(&self, vp: &VirtualPath, size: u64) -> Result<()> {
        let local = self.cached_local(vp).await?;
        let file = fs::OpenOptions::new().write(true).open(&local).await?;
        file.set_len(size).await?;
        Ok(())
    }

    /// Access and modification times of the cached copy; `None` leaves a
    /// timestamp as it is.
    #[instrument(level = "debug", skip(self))]
    pub async fn set_times(
        &self,
        vp: &VirtualPath,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let local = self.cached_local(vp).await?;
        utimensat(
            None,
            &local,
            &to_timespec(atime),
            &to_timespec(mtime),
            UtimensatFlags::NoFollowSymlink,
        )?;
        Ok(())
    }

    pub async fn statfs(&self) -> Result<FsStats> {
        let st = nix::sys::statvfs::statvfs(self.resolver.cache_root())?;
        Ok(FsStats {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            frsize: st.fragment_size() as u32,
            namelen: st.name_max() as u32,
        })
    }

    /// Unmount hook: closes the remote session. Later remote access fails
    /// with a connection error.
    pub async fn destroy(&self) {
        if let Err(e) = self.session.close().await {
            warn!("closing remote session failed: {e}");
        }
    }

    async fn cached_local(&self, vp: &VirtualPath) -> Result<std::path::PathBuf> {
        if !self.cache.ensure_cached(vp).await? {
            return Err(FsError::NotFound(vp.to_string()));
        }
        Ok(self.resolver.local(vp))
    }
}

fn to_timespec(t: Option<SystemTime>) -> TimeSpec {
    match t.map(|t| t.duration_since(UNIX_EPOCH)) {
        None => TimeSpec::UTIME_OMIT,
        Some(Ok(d)) => TimeSpec::from(d),
        // pre-epoch times are clamped
        Some(Err(_)) => TimeSpec::new(0, 0),
    }
}

async fn create_parents(local: &Path) -> std::io::Result<()> {
    match local.parent() {
        Some(parent) => fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}
