//! Inode numbering for the path-based engine.
//!
//! The kernel addresses objects by inode while the overlay works on paths,
//! so every path that has been looked up gets a stable number here. Numbers
//! are never reused during a mount.

use crate::vfs::path::VirtualPath;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub const ROOT_INO: u64 = 1;

struct InodeMap {
    by_ino: HashMap<u64, VirtualPath>,
    by_path: HashMap<VirtualPath, u64>,
    next: u64,
}

pub struct InodeTable {
    inner: Mutex<InodeMap>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut map = InodeMap {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INO + 1,
        };
        map.by_ino.insert(ROOT_INO, VirtualPath::root());
        map.by_path.insert(VirtualPath::root(), ROOT_INO);
        Self {
            inner: Mutex::new(map),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InodeMap> {
        // entries are inserted atomically, a poisoned map is still consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path_of(&self, ino: u64) -> Option<VirtualPath> {
        self.lock().by_ino.get(&ino).cloned()
    }

    /// Inode of `vp`, allocating a fresh number on first sight.
    pub fn get_or_insert(&self, vp: &VirtualPath) -> u64 {
        let mut map = self.lock();
        if let Some(ino) = map.by_path.get(vp) {
            return *ino;
        }
        let ino = map.next;
        map.next += 1;
        map.by_ino.insert(ino, vp.clone());
        map.by_path.insert(vp.clone(), ino);
        ino
    }

    /// Move `from` and everything under it to `to`, keeping inode numbers.
    /// Whatever was known under `to` before is dropped.
    pub fn rename(&self, from: &VirtualPath, to: &VirtualPath) {
        let mut map = self.lock();
        let stale: Vec<VirtualPath> = map
            .by_path
            .keys()
            .filter(|p| p.starts_with(to) && !p.is_root())
            .cloned()
            .collect();
        for p in stale {
            if let Some(ino) = map.by_path.remove(&p) {
                map.by_ino.remove(&ino);
            }
        }

        let moved: Vec<(VirtualPath, u64)> = map
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let suffix = old.as_str()[from.as_str().len()..].trim_start_matches('/');
            let new = if suffix.is_empty() {
                to.clone()
            } else {
                to.join(suffix)
            };
            map.by_path.remove(&old);
            map.by_path.insert(new.clone(), ino);
            map.by_ino.insert(ino, new);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().by_ino.len()
    }
}
