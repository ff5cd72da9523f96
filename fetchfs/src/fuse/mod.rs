//! FUSE bridge
//!
//! Translates kernel requests (inode based) into calls on the path based
//! [`OverlayFs`] engine and maps its errors onto errno values.
//!
//! Submodules:
//! - `inode`: stable inode numbers for the virtual paths seen so far
//! - `mount`: mount options and the mount entry point
pub(crate) mod inode;
pub mod mount;

use crate::error::FsError;
use crate::remote::Transport;
use crate::vfs::attr::{Attributes, FileKind, epoch_secs};
use crate::vfs::cache::is_staging_name;
use crate::vfs::fs::OverlayFs;
use crate::vfs::path::VirtualPath;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use inode::{InodeTable, ROOT_INO};
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::{Errno, FileType as FuseFileType, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 1024 * 1024;

/// The mounted filesystem: an overlay engine plus the inode numbering the
/// kernel needs on top of it.
pub struct FetchFs<T: Transport> {
    engine: OverlayFs<T>,
    inodes: InodeTable,
}

impl<T: Transport> FetchFs<T> {
    pub fn new(engine: OverlayFs<T>) -> Self {
        Self {
            engine,
            inodes: InodeTable::new(),
        }
    }

    pub fn engine(&self) -> &OverlayFs<T> {
        &self.engine
    }

    fn path_of(&self, ino: u64) -> FuseResult<VirtualPath> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> FuseResult<VirtualPath> {
        let name = name.to_string_lossy();
        // partially fetched files never show through the mount
        if is_staging_name(&name) {
            return Err(libc::ENOENT.into());
        }
        Ok(self.path_of(parent)?.join(&name))
    }

    async fn stat(&self, vp: &VirtualPath) -> FuseResult<FileAttr> {
        let attr = self.engine.getattr(vp).await.map_err(reply_err)?;
        Ok(to_fuse_attr(self.inodes.get_or_insert(vp), &attr))
    }

    async fn entry(&self, vp: &VirtualPath) -> FuseResult<ReplyEntry> {
        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.stat(vp).await?,
            generation: 0,
        })
    }

    fn parent_ino(&self, vp: &VirtualPath) -> u64 {
        vp.parent()
            .map(|p| self.inodes.get_or_insert(&p))
            .unwrap_or(ROOT_INO)
    }
}

fn reply_err(err: FsError) -> Errno {
    debug!("request failed: {err}");
    err.into()
}

impl<T> Filesystem for FetchFs<T>
where
    T: Transport + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        info!(
            "fetchfs mounted, cache at {}",
            self.engine.resolver().cache_root().display()
        );
        let max_write = NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        self.engine.destroy().await;
        info!("fetchfs unmounted");
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let vp = self.child_of(parent, name)?;
        self.entry(&vp).await
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let vp = self.path_of(ino)?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.stat(&vp).await?,
        })
    }

    // mode, ownership, size and times; each change lands on the cached copy
    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let vp = self.path_of(ino)?;
        if let Some(mode) = set_attr.mode {
            self.engine.chmod(&vp, mode).await.map_err(reply_err)?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.engine
                .chown(&vp, set_attr.uid, set_attr.gid)
                .await
                .map_err(reply_err)?;
        }
        if let Some(size) = set_attr.size {
            self.engine.truncate(&vp, size).await.map_err(reply_err)?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let atime = set_attr.atime.map(to_system_time);
            let mtime = set_attr.mtime.map(to_system_time);
            self.engine
                .set_times(&vp, atime, mtime)
                .await
                .map_err(reply_err)?;
        }
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.stat(&vp).await?,
        })
    }

    // stateless I/O: every read and write goes through the path, fh is 0
    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let vp = self.path_of(ino)?;
        let attr = self.engine.getattr(&vp).await.map_err(reply_err)?;
        if attr.is_dir() {
            return Err(libc::EISDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let vp = self.path_of(ino)?;
        let attr = self.engine.getattr(&vp).await.map_err(reply_err)?;
        if !attr.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let vp = self.path_of(ino)?;
        let data = self
            .engine
            .read(&vp, offset, size)
            .await
            .map_err(reply_err)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let vp = self.path_of(ino)?;
        let n = self
            .engine
            .write(&vp, offset, data)
            .await
            .map_err(reply_err)?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let vp = self.child_of(parent, name)?;
        let attr = self.engine.create(&vp, mode).await.map_err(reply_err)?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: to_fuse_attr(self.inodes.get_or_insert(&vp), &attr),
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let vp = self.child_of(parent, name)?;
        self.engine
            .mkdir(&vp, mode & !umask)
            .await
            .map_err(reply_err)?;
        self.entry(&vp).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let vp = self.child_of(parent, name)?;
        self.engine.unlink(&vp).await.map_err(reply_err)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let vp = self.child_of(parent, name)?;
        self.engine.rmdir(&vp).await.map_err(reply_err)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.child_of(parent, name)?;
        let to = self.child_of(new_parent, new_name)?;
        self.engine.rename(&from, &to).await.map_err(reply_err)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    // merged listing; offsets are 1-based positions in the sorted result
    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let vp = self.path_of(ino)?;
        let entries = self.engine.readdir(&vp).await.map_err(reply_err)?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(entries.len());
        for (i, e) in entries.into_iter().enumerate() {
            let inode = match e.name.as_str() {
                "." => ino,
                ".." => self.parent_ino(&vp),
                name => self.inodes.get_or_insert(&vp.join(name)),
            };
            all.push(DirectoryEntry {
                inode,
                kind: to_fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: i as i64 + 1,
            });
        }

        let slice: Vec<DirectoryEntry> = all.into_iter().filter(|e| e.offset > offset).collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    // an entry removed between listing and stat is left out; its offset is
    // not reused, so resuming stays aligned with the full listing
    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let vp = self.path_of(ino)?;
        let entries = self.engine.readdir(&vp).await.map_err(reply_err)?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len());
        for (i, e) in entries.into_iter().enumerate() {
            let next = i as i64 + 1;
            if next <= offset as i64 {
                continue;
            }
            let target = match e.name.as_str() {
                "." => vp.clone(),
                ".." => vp.parent().unwrap_or_else(VirtualPath::root),
                name => vp.join(name),
            };
            let attr = match self.engine.getattr(&target).await {
                Ok(attr) => to_fuse_attr(self.inodes.get_or_insert(&target), &attr),
                Err(FsError::NotFound(_)) => continue,
                Err(err) => return Err(reply_err(err)),
            };
            all.push(DirectoryEntryPlus {
                inode: attr.ino,
                generation: 0,
                kind: attr.kind,
                name: OsString::from(e.name),
                offset: next,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let st = self.engine.statfs().await.map_err(reply_err)?;
        Ok(ReplyStatFs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    // writes are flushed to the cached copy before they are acknowledged
    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    // inode numbers live for the whole mount
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn to_fuse_kind(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::File => FuseFileType::RegularFile,
        FileKind::Dir => FuseFileType::Directory,
        FileKind::Symlink => FuseFileType::Symlink,
    }
}

fn to_system_time(ts: Timestamp) -> SystemTime {
    epoch_secs(ts.sec, i64::from(ts.nsec))
}

fn to_fuse_attr(ino: u64, attr: &Attributes) -> FileAttr {
    let mtime = Timestamp::from(attr.mtime);
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: Timestamp::from(attr.atime),
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: to_fuse_kind(attr.kind),
        perm: attr.perm,
        nlink: if attr.is_dir() { 2 } else { 1 },
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
