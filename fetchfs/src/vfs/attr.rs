use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
}

impl FileKind {
    /// Classify from the `S_IFMT` bits of a mode; anything that is neither a
    /// directory nor a symlink is served as a regular file.
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileKind::Dir,
            libc::S_IFLNK => FileKind::Symlink,
            _ => FileKind::File,
        }
    }
}

/// The fixed metadata set the overlay reports, filled from either the local
/// cache or the remote store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub kind: FileKind,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only (`0o7777`), without the file type.
    pub perm: u16,
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }
}

/// One name in a directory listing together with its type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl From<&Metadata> for Attributes {
    fn from(md: &Metadata) -> Self {
        Attributes {
            kind: FileKind::from_mode(md.mode()),
            size: md.size(),
            atime: epoch_secs(md.atime(), md.atime_nsec()),
            mtime: epoch_secs(md.mtime(), md.mtime_nsec()),
            uid: md.uid(),
            gid: md.gid(),
            perm: (md.mode() & 0o7777) as u16,
        }
    }
}

pub(crate) fn epoch_secs(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}
