//! fs-mount: expose a path-addressed storage backend as a FUSE filesystem
//!
//! # Architecture
//!
//! - **Backends**: storage systems (local disk, S3, an in-memory tree) that
//!   implement the [`backend::Backend`] trait: stat, list, streamed
//!   read/write, remove, remove-tree, rename and directory creation.
//! - **Translator**: stateless mapping from POSIX requests on virtual paths
//!   to backend calls under a mount root, folding every failure into a
//!   single filesystem error kind.
//! - **FUSE Adapter**: the inode-based `fuser` front end that hands each
//!   kernel request to the translator.
//! - **Mount Manager**: lifecycle of multiple simultaneous mounts.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fs_mount::backend::memory::MemoryBackend;
//! use fs_mount::mount::{MountManager, MountOptions};
//! use fs_mount::translator::Translator;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let translator = Translator::new(Arc::new(MemoryBackend::new()), "/");
//!
//! let manager = MountManager::new();
//! manager.mount("/mnt/scratch".into(), Arc::new(translator), &MountOptions::default())?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod env;
pub mod error;
pub mod fuse;
pub mod mount;
pub mod translator;

pub use error::{Error, FsError, FsResult, Result};
pub use translator::Translator;
