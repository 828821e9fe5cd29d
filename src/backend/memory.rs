//! In-memory backend
//!
//! Models an object-store style namespace: an ordered map from path to node,
//! where directories exist either as explicit nodes or implicitly because
//! some entry lives below them. Used by `memory://` mounts and by tests.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::RwLock;
use tracing::trace;

use crate::backend::{
    Backend, DirEntry, DirEntryStream, FileType, Metadata, ReadStream, WriteStream,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Node {
    File { data: Bytes, mtime: SystemTime },
    Dir { mtime: SystemTime },
}

type Tree = BTreeMap<PathBuf, Node>;

/// Largest file a write stream will grow to
const MAX_FILE_SIZE: usize = 1 << 32;

/// In-memory backend. Clones share the same namespace.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    tree: Arc<RwLock<Tree>>,
    seekable: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(RwLock::new(BTreeMap::new())),
            seekable: true,
        }
    }

    /// Control whether opened streams report themselves as seekable
    pub fn with_seekable(mut self, seekable: bool) -> Self {
        self.seekable = seekable;
        self
    }

    /// Store a file directly, bypassing the stream interface
    pub fn insert_file(&self, path: impl AsRef<Path>, data: impl Into<Bytes>) {
        self.tree.write().insert(
            path.as_ref().to_path_buf(),
            Node::File {
                data: data.into(),
                mtime: SystemTime::now(),
            },
        );
    }

    /// Current content of a file, if present
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Bytes> {
        match self.tree.read().get(path.as_ref()) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Number of explicit entries
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}

fn is_root(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::RootDir))
}

/// Entries strictly below `path`, in order
fn descendants<'a>(tree: &'a Tree, path: &'a Path) -> impl Iterator<Item = (&'a PathBuf, &'a Node)> {
    tree.range(path.to_path_buf()..)
        .take_while(move |(k, _)| k.starts_with(path))
        .filter(move |(k, _)| k.as_path() != path)
}

fn lookup(tree: &Tree, path: &Path) -> Option<Metadata> {
    match tree.get(path) {
        Some(Node::File { data, mtime }) => Some(Metadata::file(data.len() as u64, *mtime)),
        Some(Node::Dir { mtime }) => Some(Metadata::directory(*mtime)),
        None if is_root(path) => Some(Metadata::directory(SystemTime::UNIX_EPOCH)),
        None => {
            // Implicit directory: newest descendant decides the mtime
            descendants(tree, path)
                .map(|(_, node)| match node {
                    Node::File { mtime, .. } | Node::Dir { mtime } => *mtime,
                })
                .max()
                .map(Metadata::directory)
        }
    }
}

fn not_found(path: &Path) -> Error {
    Error::NotFound(path.display().to_string())
}

struct MemoryReadStream {
    data: Bytes,
    pos: usize,
    seekable: bool,
    path: PathBuf,
}

#[async_trait]
impl ReadStream for MemoryReadStream {
    fn seekable(&self) -> bool {
        self.seekable
    }

    async fn seek(&mut self, offset: u64) -> Result<()> {
        if !self.seekable {
            return Err(Error::NotSeekable(self.path.display().to_string()));
        }
        self.pos = usize::try_from(offset).unwrap_or(usize::MAX);
        Ok(())
    }

    async fn read(&mut self, size: usize) -> Result<Bytes> {
        let start = self.pos.min(self.data.len());
        let end = start.saturating_add(size).min(self.data.len());
        self.pos = end;
        Ok(self.data.slice(start..end))
    }
}

struct MemoryWriteStream {
    tree: Arc<RwLock<Tree>>,
    buf: Vec<u8>,
    pos: usize,
    seekable: bool,
    path: PathBuf,
}

#[async_trait]
impl WriteStream for MemoryWriteStream {
    fn seekable(&self) -> bool {
        self.seekable
    }

    async fn seek(&mut self, offset: u64) -> Result<()> {
        if !self.seekable {
            return Err(Error::NotSeekable(self.path.display().to_string()));
        }
        self.pos = usize::try_from(offset)
            .map_err(|_| Error::InvalidPath(format!("offset {} too large", offset)))?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let end = self
            .pos
            .checked_add(data.len())
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or_else(|| {
                Error::Backend(format!(
                    "write of {} bytes at offset {} exceeds the {} byte limit for {:?}",
                    data.len(),
                    self.pos,
                    MAX_FILE_SIZE,
                    self.path
                ))
            })?;
        if self.buf.len() < end {
            self.buf
                .try_reserve(end - self.buf.len())
                .map_err(|e| Error::Backend(format!("cannot grow {:?}: {}", self.path, e)))?;
            self.buf.resize(end, 0);
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let MemoryWriteStream { tree, buf, path, .. } = *self;
        trace!("commit: {:?} ({} bytes)", path, buf.len());
        tree.write().insert(
            path,
            Node::File {
                data: Bytes::from(buf),
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn stat(&self, path: &Path) -> Result<Metadata> {
        lookup(&self.tree.read(), path).ok_or_else(|| not_found(path))
    }

    fn list(&self, path: &Path) -> DirEntryStream {
        let tree = self.tree.read();

        let result = match lookup(&tree, path) {
            None => Err(not_found(path)),
            Some(meta) if meta.is_file() => Err(Error::NotADirectory(path.display().to_string())),
            Some(_) => {
                let mut children: BTreeMap<OsString, FileType> = BTreeMap::new();
                for (key, node) in descendants(&tree, path) {
                    let Ok(rel) = key.strip_prefix(path) else {
                        continue;
                    };
                    let mut parts = rel.components();
                    let Some(first) = parts.next() else {
                        continue;
                    };
                    let nested = parts.next().is_some();
                    let kind = if nested || matches!(node, Node::Dir { .. }) {
                        FileType::Directory
                    } else {
                        FileType::File
                    };
                    children
                        .entry(first.as_os_str().to_os_string())
                        .and_modify(|k| {
                            if kind == FileType::Directory {
                                *k = FileType::Directory;
                            }
                        })
                        .or_insert(kind);
                }
                Ok(children
                    .into_iter()
                    .map(|(name, file_type)| Ok(DirEntry { name, file_type }))
                    .collect::<Vec<_>>())
            }
        };

        match result {
            Ok(entries) => Box::pin(stream::iter(entries)),
            Err(e) => Box::pin(stream::once(async move { Err(e) })),
        }
    }

    async fn open_read(&self, path: &Path) -> Result<Box<dyn ReadStream>> {
        let tree = self.tree.read();
        match tree.get(path) {
            Some(Node::File { data, .. }) => Ok(Box::new(MemoryReadStream {
                data: data.clone(),
                pos: 0,
                seekable: self.seekable,
                path: path.to_path_buf(),
            })),
            Some(Node::Dir { .. }) => Err(Error::IsADirectory(path.display().to_string())),
            None if lookup(&tree, path).is_some() => {
                Err(Error::IsADirectory(path.display().to_string()))
            }
            None => Err(not_found(path)),
        }
    }

    async fn open_write(&self, path: &Path) -> Result<Box<dyn WriteStream>> {
        let mut tree = self.tree.write();
        if lookup(&tree, path).is_some_and(|m| m.is_dir()) {
            return Err(Error::IsADirectory(path.display().to_string()));
        }
        tree.insert(
            path.to_path_buf(),
            Node::File {
                data: Bytes::new(),
                mtime: SystemTime::now(),
            },
        );

        Ok(Box::new(MemoryWriteStream {
            tree: self.tree.clone(),
            buf: Vec::new(),
            pos: 0,
            seekable: self.seekable,
            path: path.to_path_buf(),
        }))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.write();
        match lookup(&tree, path) {
            None => Err(not_found(path)),
            Some(meta) if meta.is_dir() => Err(Error::IsADirectory(path.display().to_string())),
            Some(_) => {
                tree.remove(path);
                Ok(())
            }
        }
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.write();
        match lookup(&tree, path) {
            None => Err(not_found(path)),
            Some(meta) if meta.is_file() => Err(Error::NotADirectory(path.display().to_string())),
            Some(_) => {
                tree.retain(|key, _| !key.starts_with(path));
                Ok(())
            }
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut tree = self.tree.write();
        if lookup(&tree, from).is_none() {
            return Err(not_found(from));
        }
        if lookup(&tree, to).is_some() {
            return Err(Error::AlreadyExists(to.display().to_string()));
        }
        if to.starts_with(from) {
            return Err(Error::InvalidPath(format!(
                "cannot move {} into itself",
                from.display()
            )));
        }

        let moved: Vec<PathBuf> = tree
            .keys()
            .filter(|key| key.starts_with(from))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = tree.remove(&key) {
                let rel = key.strip_prefix(from).unwrap_or(Path::new(""));
                let target = if rel.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rel)
                };
                tree.insert(target, node);
            }
        }
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.write();
        if lookup(&tree, path).is_some() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        tree.insert(
            path.to_path_buf(),
            Node::Dir {
                mtime: SystemTime::now(),
            },
        );
        Ok(())
    }
}
