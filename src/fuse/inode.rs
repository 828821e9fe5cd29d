//! Inode <-> virtual path mapping
//!
//! The kernel addresses entries by inode number while the translator works
//! on virtual paths. Inodes are allocated on first sight and follow their
//! subtree across renames and removals.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode <-> virtual path table
pub struct InodeTable {
    inode_to_path: DashMap<u64, PathBuf>,
    path_to_inode: DashMap<PathBuf, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            inode_to_path: DashMap::new(),
            path_to_inode: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };

        let root = PathBuf::from("/");
        table.inode_to_path.insert(ROOT_INODE, root.clone());
        table.path_to_inode.insert(root, ROOT_INODE);

        table
    }

    /// Inode for a virtual path, allocating one on first sight
    pub fn get_or_create_inode(&self, path: &Path) -> u64 {
        let path = rooted(path);
        if let Some(inode) = self.path_to_inode.get(&path) {
            return *inode;
        }

        // The entry guard serializes racing allocations for the same path
        *self.path_to_inode.entry(path.clone()).or_insert_with(|| {
            let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
            self.inode_to_path.insert(inode, path);
            inode
        })
    }

    pub fn get_path(&self, inode: u64) -> Option<PathBuf> {
        self.inode_to_path.get(&inode).map(|p| p.clone())
    }

    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        self.path_to_inode.get(&rooted(path)).map(|i| *i)
    }

    /// Inode of the directory containing `path`
    pub fn parent_inode(&self, path: &Path) -> u64 {
        path.parent()
            .and_then(|p| self.get_inode(p))
            .unwrap_or(ROOT_INODE)
    }

    /// Forget a path and everything below it
    pub fn remove_path(&self, path: &Path) {
        let path = rooted(path);
        for stale in self.subtree(&path) {
            if let Some((_, inode)) = self.path_to_inode.remove(&stale) {
                self.inode_to_path.remove(&inode);
            }
        }
    }

    /// Move a path and everything below it, keeping inode numbers
    pub fn rename_path(&self, old: &Path, new: &Path) {
        let old = rooted(old);
        let new = rooted(new);

        for moved in self.subtree(&old) {
            let Some((_, inode)) = self.path_to_inode.remove(&moved) else {
                continue;
            };
            let target = match moved.strip_prefix(&old) {
                Ok(rel) if !rel.as_os_str().is_empty() => new.join(rel),
                _ => new.clone(),
            };
            self.inode_to_path.insert(inode, target.clone());
            self.path_to_inode.insert(target, inode);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }

    fn subtree(&self, path: &Path) -> Vec<PathBuf> {
        self.path_to_inode
            .iter()
            .filter(|entry| entry.key().starts_with(path) && *entry.value() != ROOT_INODE)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn rooted(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new("/").join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode() {
        let table = InodeTable::new();
        assert_eq!(table.get_inode(Path::new("/")), Some(ROOT_INODE));
        assert_eq!(table.get_path(ROOT_INODE), Some(PathBuf::from("/")));
    }

    #[test]
    fn test_allocation_is_stable() {
        let table = InodeTable::new();

        let a = table.get_or_create_inode(Path::new("/foo"));
        let b = table.get_or_create_inode(Path::new("foo"));

        assert_eq!(a, b);
        assert_ne!(a, ROOT_INODE);
        assert_eq!(table.parent_inode(Path::new("/foo")), ROOT_INODE);
    }

    #[test]
    fn test_remove_drops_subtree() {
        let table = InodeTable::new();
        let dir = table.get_or_create_inode(Path::new("/d"));
        let child = table.get_or_create_inode(Path::new("/d/x"));
        let sibling = table.get_or_create_inode(Path::new("/dx"));

        table.remove_path(Path::new("/d"));
        assert!(table.get_path(dir).is_none());
        assert!(table.get_path(child).is_none());
        assert_eq!(table.get_path(sibling), Some(PathBuf::from("/dx")));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.get_or_create_inode(Path::new("/d"));
        let child = table.get_or_create_inode(Path::new("/d/sub/x"));

        table.rename_path(Path::new("/d"), Path::new("/e"));

        assert!(table.get_inode(Path::new("/d")).is_none());
        assert_eq!(table.get_path(dir), Some(PathBuf::from("/e")));
        assert_eq!(table.get_path(child), Some(PathBuf::from("/e/sub/x")));
        assert_eq!(table.parent_inode(Path::new("/e/sub/x")), ROOT_INODE);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_root_survives_removal() {
        let table = InodeTable::new();
        table.get_or_create_inode(Path::new("/a"));
        table.remove_path(Path::new("/"));
        assert_eq!(table.get_inode(Path::new("/")), Some(ROOT_INODE));
        assert_eq!(table.len(), 1);
    }
}
