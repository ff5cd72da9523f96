//! Virtual path normalization and the mapping onto the cache and remote roots.

use std::fmt;
use std::path::{Path, PathBuf};

/// A client-visible path, kept normalized: segments joined by `/` with no
/// leading separator, no empty or `.` segments and no `..`. The root is the
/// empty string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualPath(String);

impl VirtualPath {
    pub fn root() -> Self {
        VirtualPath(String::new())
    }

    /// Normalize an arbitrary client path. `..` is resolved against the
    /// preceding segments and clamps at the root, so the result can never
    /// escape whichever root it is later joined to.
    pub fn new(raw: &str) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for seg in raw.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                s => parts.push(s),
            }
        }
        VirtualPath(parts.join("/"))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one directory entry name.
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            VirtualPath::new(name)
        } else {
            VirtualPath::new(&format!("{}/{}", self.0, name))
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(n) => Some(VirtualPath(self.0[..n].to_string())),
            None => Some(VirtualPath::root()),
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        Some(self.0.rsplit('/').next().unwrap_or(&self.0))
    }

    /// True when `self` equals `ancestor` or lies underneath it.
    pub fn starts_with(&self, ancestor: &VirtualPath) -> bool {
        ancestor.is_root()
            || self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0) && self.0.as_bytes()[ancestor.0.len()] == b'/')
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for VirtualPath {
    fn from(raw: &str) -> Self {
        VirtualPath::new(raw)
    }
}

/// Maps virtual paths onto the local cache root and the remote root. Both
/// physical forms are recomputed on every call and never stored.
#[derive(Clone, Debug)]
pub struct PathResolver {
    cache_root: PathBuf,
    remote_root: PathBuf,
}

impl PathResolver {
    pub fn new(cache_root: impl Into<PathBuf>, remote_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            remote_root: remote_root.into(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn local(&self, vp: &VirtualPath) -> PathBuf {
        join_under(&self.cache_root, vp)
    }

    pub fn remote(&self, vp: &VirtualPath) -> PathBuf {
        join_under(&self.remote_root, vp)
    }

    pub fn resolve(&self, vp: &VirtualPath) -> (PathBuf, PathBuf) {
        (self.local(vp), self.remote(vp))
    }
}

fn join_under(root: &Path, vp: &VirtualPath) -> PathBuf {
    if vp.is_root() {
        // an empty root means "the session's working directory"
        if root.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            root.to_path_buf()
        }
    } else {
        root.join(vp.as_str())
    }
}
