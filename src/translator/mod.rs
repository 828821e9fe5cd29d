//! Request translator
//!
//! Turns path-addressed filesystem requests into calls on a [`Backend`] and
//! folds every backend outcome into either a POSIX-shaped result or an
//! [`FsError`] kind. The translator holds no per-request state: handles are
//! a constant placeholder and every read or write reopens the entry by path.

pub mod path;

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::backend::{Backend, DirEntry, Metadata};
use crate::error::{Error, FsError, FsResult};

/// The only file handle ever handed out
pub const PLACEHOLDER_HANDLE: u64 = 0;

/// How `mkdir` is carried out on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MkdirPolicy {
    /// Ask the backend to create the directory (or its marker object)
    #[default]
    Marker,
    /// Stat the target and succeed only if it already exists; nothing is
    /// ever created
    Probe,
}

impl FromStr for MkdirPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "marker" => Ok(MkdirPolicy::Marker),
            "probe" => Ok(MkdirPolicy::Probe),
            other => Err(format!(
                "unknown mkdir policy '{}' (expected 'marker' or 'probe')",
                other
            )),
        }
    }
}

impl fmt::Display for MkdirPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MkdirPolicy::Marker => f.write_str("marker"),
            MkdirPolicy::Probe => f.write_str("probe"),
        }
    }
}

/// Volume statistics. No backend exposes these, so the record is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        // Block sizes must still be a power of two for macOS
        Self {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 512,
            namelen: 255,
            frsize: 512,
        }
    }
}

/// Translates filesystem requests onto a backend rooted at `root`
pub struct Translator {
    backend: Arc<dyn Backend>,
    root: PathBuf,
    read_only: bool,
    mkdir_policy: MkdirPolicy,
}

impl Translator {
    pub fn new(backend: Arc<dyn Backend>, root: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            root: root.into(),
            read_only: false,
            mkdir_policy: MkdirPolicy::default(),
        }
    }

    /// Reject every structural change before it reaches the backend
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_mkdir_policy(mut self, policy: MkdirPolicy) -> Self {
        self.mkdir_policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Map a virtual path into the backend namespace
    pub fn resolve(&self, virtual_path: &Path) -> PathBuf {
        path::join(&self.root, virtual_path)
    }

    /// Resolve the target of a mutating request, refusing it on read-only mounts
    fn resolve_mutable(&self, virtual_path: &Path, op: &str) -> FsResult<PathBuf> {
        if self.read_only {
            return Err(FsError::read_only(
                virtual_path,
                format!("{} on read-only mount", op),
            ));
        }
        Ok(self.resolve(virtual_path))
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    pub async fn attributes(&self, path: &Path) -> FsResult<Metadata> {
        let resolved = self.resolve(path);
        trace!("attributes: {:?} -> {:?}", path, resolved);
        self.backend.stat(&resolved).await.map_err(|e| {
            trace!("stat {:?} failed: {}", resolved, e);
            FsError::NotFound(path.to_path_buf())
        })
    }

    /// Directory listing, led by the synthetic `.` and `..` entries
    pub async fn list(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let resolved = self.resolve(path);
        trace!("list: {:?} -> {:?}", path, resolved);

        let children: Vec<DirEntry> = self
            .backend
            .list(&resolved)
            .try_collect()
            .await
            .map_err(|e| {
                debug!("list {:?} failed: {}", resolved, e);
                FsError::NotFound(path.to_path_buf())
            })?;

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(DirEntry::directory("."));
        entries.push(DirEntry::directory(".."));
        entries.extend(children);
        Ok(entries)
    }

    // -------------------------------------------------------------------------
    // Data
    // -------------------------------------------------------------------------

    pub async fn read(&self, path: &Path, size: u32, offset: u64) -> FsResult<Bytes> {
        let resolved = self.resolve(path);
        trace!("read: {:?} size={} offset={}", resolved, size, offset);

        let mut stream = self
            .backend
            .open_read(&resolved)
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => FsError::NotFound(path.to_path_buf()),
                other => FsError::io(path, other),
            })?;

        if offset != 0 {
            if !stream.seekable() {
                return Err(FsError::io(
                    path,
                    format!("cannot read at offset {} from a non-seekable stream", offset),
                ));
            }
            stream
                .seek(offset)
                .await
                .map_err(|e| FsError::io(path, e))?;
        }

        stream
            .read(size as usize)
            .await
            .map_err(|e| FsError::io(path, e))
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    ///
    /// The entry is reopened (and truncated) on every call.
    pub async fn write(&self, path: &Path, data: &[u8], offset: u64) -> FsResult<usize> {
        let resolved = self.resolve_mutable(path, "write")?;
        trace!("write: {:?} len={} offset={}", resolved, data.len(), offset);

        let mut stream = self
            .backend
            .open_write(&resolved)
            .await
            .map_err(|e| FsError::read_only(path, e))?;

        if offset != 0 {
            if !stream.seekable() {
                return Err(FsError::read_only(
                    path,
                    format!("cannot write at offset {} to a non-seekable stream", offset),
                ));
            }
            stream
                .seek(offset)
                .await
                .map_err(|e| FsError::read_only(path, e))?;
        }

        stream
            .write(data)
            .await
            .map_err(|e| FsError::read_only(path, e))?;
        stream
            .close()
            .await
            .map_err(|e| FsError::read_only(path, e))?;

        Ok(data.len())
    }

    // -------------------------------------------------------------------------
    // Namespace
    // -------------------------------------------------------------------------

    /// Materialize an empty entry
    pub async fn create(&self, path: &Path) -> FsResult<()> {
        let resolved = self.resolve_mutable(path, "create")?;
        debug!("create: {:?}", resolved);

        let stream = self
            .backend
            .open_write(&resolved)
            .await
            .map_err(|e| FsError::read_only(path, e))?;
        stream
            .close()
            .await
            .map_err(|e| FsError::read_only(path, e))
    }

    /// Create a directory according to the configured [`MkdirPolicy`],
    /// returning its attributes
    pub async fn mkdir(&self, path: &Path) -> FsResult<Metadata> {
        let resolved = self.resolve_mutable(path, "mkdir")?;
        debug!("mkdir: {:?} policy={}", resolved, self.mkdir_policy);

        match self.mkdir_policy {
            MkdirPolicy::Marker => {
                self.backend
                    .create_dir(&resolved)
                    .await
                    .map_err(|e| FsError::read_only(path, e))?;
                // Object stores may not list a fresh marker yet
                Ok(self
                    .backend
                    .stat(&resolved)
                    .await
                    .unwrap_or_else(|_| Metadata::directory(SystemTime::now())))
            }
            MkdirPolicy::Probe => self
                .backend
                .stat(&resolved)
                .await
                .map_err(|e| FsError::read_only(path, e)),
        }
    }

    /// Remove a directory and everything below it
    pub async fn rmdir(&self, path: &Path) -> FsResult<()> {
        let resolved = self.resolve_mutable(path, "rmdir")?;
        debug!("rmdir: {:?}", resolved);
        self.backend
            .remove_tree(&resolved)
            .await
            .map_err(|e| FsError::read_only(path, e))
    }

    pub async fn unlink(&self, path: &Path) -> FsResult<()> {
        let resolved = self.resolve_mutable(path, "unlink")?;
        debug!("unlink: {:?}", resolved);
        self.backend
            .remove(&resolved)
            .await
            .map_err(|e| FsError::read_only(path, e))
    }

    /// Rename without ever replacing an existing destination
    pub async fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        let from = self.resolve_mutable(old, "rename")?;
        let to = self.resolve(new);
        debug!("rename: {:?} -> {:?}", from, to);
        self.backend
            .rename(&from, &to)
            .await
            .map_err(|e| FsError::read_only(old, e))
    }

    // -------------------------------------------------------------------------
    // Handles and no-ops
    // -------------------------------------------------------------------------

    pub fn open(&self, _path: &Path) -> u64 {
        PLACEHOLDER_HANDLE
    }

    pub fn opendir(&self, _path: &Path) -> u64 {
        PLACEHOLDER_HANDLE
    }

    pub fn release(&self, _path: &Path, _fh: u64) -> FsResult<()> {
        Ok(())
    }

    pub fn releasedir(&self, _path: &Path, _fh: u64) -> FsResult<()> {
        Ok(())
    }

    pub fn flush(&self, _path: &Path, _fh: u64) -> FsResult<()> {
        Ok(())
    }

    pub fn fsync(&self, _path: &Path, _fh: u64) -> FsResult<()> {
        Ok(())
    }

    pub fn fsyncdir(&self, _path: &Path, _fh: u64) -> FsResult<()> {
        Ok(())
    }

    pub fn utimens(&self, _path: &Path) -> FsResult<()> {
        Ok(())
    }

    pub fn access(&self, _path: &Path, _mask: i32) -> FsResult<()> {
        Ok(())
    }

    pub fn statfs(&self, _path: &Path) -> StatFs {
        StatFs::default()
    }

    // -------------------------------------------------------------------------
    // Operations with no backend primitive
    // -------------------------------------------------------------------------

    pub fn chmod(&self, path: &Path, _mode: u32) -> FsResult<()> {
        Err(FsError::read_only(path, "chmod"))
    }

    pub fn chown(&self, path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> FsResult<()> {
        Err(FsError::read_only(path, "chown"))
    }

    pub fn truncate(&self, path: &Path, _length: u64) -> FsResult<()> {
        Err(FsError::read_only(path, "truncate"))
    }

    // Node creation with no backend counterpart always fails, so these
    // return the error itself

    pub fn mknod(&self, path: &Path, _mode: u32, _rdev: u32) -> FsError {
        FsError::read_only(path, "mknod")
    }

    pub fn link(&self, _target: &Path, link: &Path) -> FsError {
        FsError::read_only(link, "link")
    }

    pub fn symlink(&self, link: &Path, _target: &Path) -> FsError {
        FsError::read_only(link, "symlink")
    }

    pub fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        Err(FsError::NotFound(path.to_path_buf()))
    }

    pub fn getxattr(&self, _path: &Path, _name: &OsStr) -> FsResult<Vec<u8>> {
        Err(FsError::Unsupported("getxattr"))
    }

    pub fn setxattr(&self, _path: &Path, _name: &OsStr, _value: &[u8]) -> FsResult<()> {
        Err(FsError::Unsupported("setxattr"))
    }

    pub fn listxattr(&self, _path: &Path) -> FsError {
        FsError::Unsupported("listxattr")
    }

    pub fn removexattr(&self, _path: &Path, _name: &OsStr) -> FsResult<()> {
        Err(FsError::Unsupported("removexattr"))
    }

    pub fn ioctl(&self, _path: &Path, _cmd: u32) -> FsResult<Vec<u8>> {
        Err(FsError::NotTty)
    }
}
