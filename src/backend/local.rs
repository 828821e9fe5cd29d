//! Local disk backend
//!
//! Resolved paths are plain OS paths. Streams are tokio files and are
//! always seekable.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::backend::{
    read_up_to, Backend, DirEntry, DirEntryStream, Metadata, ReadStream, WriteStream,
};
use crate::error::{Error, Result};

/// Backend over the local filesystem
#[derive(Debug, Default, Clone)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

struct LocalReadStream {
    file: File,
    path: PathBuf,
}

#[async_trait]
impl ReadStream for LocalReadStream {
    fn seekable(&self) -> bool {
        true
    }

    async fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::from_io(e, &self.path))?;
        Ok(())
    }

    async fn read(&mut self, size: usize) -> Result<Bytes> {
        read_up_to(&mut self.file, size)
            .await
            .map_err(|e| Error::from_io(e, &self.path))
    }
}

struct LocalWriteStream {
    file: File,
    path: PathBuf,
}

#[async_trait]
impl WriteStream for LocalWriteStream {
    fn seekable(&self) -> bool {
        true
    }

    async fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::from_io(e, &self.path))?;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| Error::from_io(e, &self.path))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let LocalWriteStream { mut file, path } = *self;
        // tokio files complete pending writes on flush, not on drop
        file.flush().await.map_err(|e| Error::from_io(e, &path))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn stat(&self, path: &Path) -> Result<Metadata> {
        trace!("stat: {:?}", path);
        let meta = fs::metadata(path)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        Ok(if meta.is_dir() {
            Metadata::directory(mtime)
        } else {
            Metadata::file(meta.len(), mtime)
        })
    }

    fn list(&self, path: &Path) -> DirEntryStream {
        let path = path.to_path_buf();

        Box::pin(try_stream! {
            let mut entries = fs::read_dir(&path)
                .await
                .map_err(|e| Error::from_io(e, &path))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::from_io(e, &path))?
            {
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|ft| ft.is_dir())
                    .unwrap_or(false);

                if is_dir {
                    yield DirEntry::directory(entry.file_name());
                } else {
                    yield DirEntry::file(entry.file_name());
                }
            }
        })
    }

    async fn open_read(&self, path: &Path) -> Result<Box<dyn ReadStream>> {
        let file = File::open(path)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        Ok(Box::new(LocalReadStream {
            file,
            path: path.to_path_buf(),
        }))
    }

    async fn open_write(&self, path: &Path) -> Result<Box<dyn WriteStream>> {
        debug!("open_write: {:?}", path);
        let file = File::create(path)
            .await
            .map_err(|e| Error::from_io(e, path))?;
        Ok(Box::new(LocalWriteStream {
            file,
            path: path.to_path_buf(),
        }))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        debug!("remove: {:?}", path);
        fs::remove_file(path)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        debug!("remove_tree: {:?}", path);
        let meta = self.stat(path).await?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(path.display().to_string()));
        }
        fs::remove_dir_all(path)
            .await
            .map_err(|e| Error::from_io(e, path))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        debug!("rename: {:?} -> {:?}", from, to);
        // std::fs::rename replaces the destination, so refuse up front
        if fs::try_exists(to)
            .await
            .map_err(|e| Error::from_io(e, to))?
        {
            return Err(Error::AlreadyExists(to.display().to_string()));
        }
        fs::rename(from, to)
            .await
            .map_err(|e| Error::from_io(e, from))
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        debug!("create_dir: {:?}", path);
        fs::create_dir(path)
            .await
            .map_err(|e| Error::from_io(e, path))
    }
}
