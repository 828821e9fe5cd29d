pub mod local;
pub mod memory;
pub mod s3;

use std::ffi::OsString;
use std::path::Path;
use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Result;

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

/// Metadata for a backend entry
#[derive(Debug, Clone)]
pub struct Metadata {
    pub file_type: FileType,
    pub size: u64,
    pub mtime: SystemTime,
}

impl Metadata {
    pub fn file(size: u64, mtime: SystemTime) -> Self {
        Self {
            file_type: FileType::File,
            size,
            mtime,
        }
    }

    pub fn directory(mtime: SystemTime) -> Self {
        Self {
            file_type: FileType::Directory,
            size: 0,
            mtime,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.file_type, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }
}

/// Directory entry returned by `Backend::list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub file_type: FileType,
}

impl DirEntry {
    pub fn file(name: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::File,
        }
    }

    pub fn directory(name: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            file_type: FileType::Directory,
        }
    }
}

/// Stream type for directory listings
pub type DirEntryStream = Pin<Box<dyn Stream<Item = Result<DirEntry>> + Send>>;

/// A stream opened for reading
#[async_trait]
pub trait ReadStream: Send {
    /// Whether `seek` can reposition this stream
    fn seekable(&self) -> bool;

    /// Move the read position to `offset` bytes from the start
    async fn seek(&mut self, offset: u64) -> Result<()>;

    /// Read up to `size` bytes; a short result means end of file
    async fn read(&mut self, size: usize) -> Result<Bytes>;
}

/// A stream opened for writing.
///
/// Opening truncates the entry. Written data is only guaranteed durable once
/// `close` returns.
#[async_trait]
pub trait WriteStream: Send {
    /// Whether `seek` can reposition this stream
    fn seekable(&self) -> bool;

    /// Move the write position to `offset` bytes from the start
    async fn seek(&mut self, offset: u64) -> Result<()>;

    /// Write all of `data` at the current position
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Commit the written content
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Capability interface for storage backends
///
/// Backends are path-addressed and hold no per-request state. Paths passed
/// in are already resolved against the mount root.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Get metadata for a path
    async fn stat(&self, path: &Path) -> Result<Metadata>;

    /// List directory contents as a stream
    fn list(&self, path: &Path) -> DirEntryStream;

    /// Open an entry for reading
    async fn open_read(&self, path: &Path) -> Result<Box<dyn ReadStream>>;

    /// Open an entry for writing, truncating any existing content
    async fn open_write(&self, path: &Path) -> Result<Box<dyn WriteStream>>;

    /// Remove a single entry
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Remove a directory and everything below it
    async fn remove_tree(&self, path: &Path) -> Result<()>;

    /// Rename an entry; fails with `AlreadyExists` when `to` is present
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Create a directory (or the backend's marker for one)
    async fn create_dir(&self, path: &Path) -> Result<()>;
}

/// Fill a buffer from an async reader until `size` bytes or end of file
pub(crate) async fn read_up_to<R>(reader: &mut R, size: usize) -> std::io::Result<Bytes>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}
