use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by backends and by process setup
#[derive(Error, Debug)]
pub enum Error {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Stream is not seekable: {0}")]
    NotSeekable(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Classify an I/O error raised while operating on `path`
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.display().to_string()),
            _ => Error::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type alias for backend and setup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by the request translator.
///
/// Every backend failure is folded into one of these at the call site, so
/// the caller always sees a plain filesystem error.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NotFound(PathBuf),

    #[error("Read-only violation on {path}: {reason}")]
    ReadOnly { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Inappropriate ioctl for device")]
    NotTty,
}

impl FsError {
    pub fn read_only(path: &Path, reason: impl ToString) -> Self {
        FsError::ReadOnly {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: &Path, reason: impl ToString) -> Self {
        FsError::Io {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Convert to the libc errno sent back through FUSE
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::ReadOnly { .. } => libc::EROFS,
            FsError::Io { .. } => libc::EIO,
            FsError::Unsupported(_) => libc::ENOTSUP,
            FsError::NotTty => libc::ENOTTY,
        }
    }
}

/// Result type alias for translator operations
pub type FsResult<T> = std::result::Result<T, FsError>;
