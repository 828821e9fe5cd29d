//! Mount management and lifecycle

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::fuse::FuseAdapter;
use crate::translator::Translator;

/// Per-mount options handed to the kernel and the FUSE adapter
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Name shown as the filesystem source in the mount table
    pub fs_name: String,
    /// Mount read-only at the FUSE level
    pub read_only: bool,
    /// Let users other than the mounting one access the filesystem
    pub allow_other: bool,
    /// How long the kernel may cache attributes and entries
    pub attr_ttl: Duration,
    /// User ID reported for every entry (defaults to process uid)
    pub uid: Option<u32>,
    /// Group ID reported for every entry (defaults to process gid)
    pub gid: Option<u32>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fs_name: "fs-mount".to_string(),
            read_only: false,
            allow_other: false,
            attr_ttl: Duration::from_secs(1),
            uid: None,
            gid: None,
        }
    }
}

impl MountOptions {
    fn fuse_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(self.fs_name.clone()),
            MountOption::Subtype("fs-mount".to_string()),
            MountOption::AutoUnmount,
            MountOption::NoDev,
            MountOption::NoSuid,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.read_only {
            options.push(MountOption::RO);
        } else {
            options.push(MountOption::RW);
        }
        options
    }
}

/// Represents an active mount
pub struct ActiveMount {
    pub path: PathBuf,
    session: Option<fuser::BackgroundSession>,
}

impl ActiveMount {
    /// Unmount this filesystem
    pub fn unmount(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Unmounting {:?}", self.path);
            drop(session);
        }
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Tracks every mount attached by this process
#[derive(Default)]
pub struct MountManager {
    mounts: Mutex<Vec<ActiveMount>>,
}

impl MountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `translator` at `path` in a background session
    pub fn mount(
        &self,
        path: PathBuf,
        translator: Arc<Translator>,
        options: &MountOptions,
    ) -> Result<()> {
        info!(
            "Mounting {} backend root {:?} at {:?}",
            translator.backend_name(),
            translator.root(),
            path
        );

        if !path.exists() {
            return Err(Error::NotFound(format!(
                "Mount point does not exist: {:?}",
                path
            )));
        }

        if !path.is_dir() {
            return Err(Error::NotADirectory(format!(
                "Mount point is not a directory: {:?}",
                path
            )));
        }

        let adapter = FuseAdapter::new(translator, options)?;
        let session = fuser::spawn_mount2(adapter, &path, &options.fuse_options())?;

        self.mounts.lock().push(ActiveMount {
            path: path.clone(),
            session: Some(session),
        });

        info!("Successfully mounted at {:?}", path);
        Ok(())
    }

    /// Unmount a specific path
    pub fn unmount(&self, path: &Path) -> Result<()> {
        let mut mounts = self.mounts.lock();
        let pos = mounts
            .iter()
            .position(|m| m.path == path)
            .ok_or_else(|| Error::NotFound(format!("No mount at {:?}", path)))?;
        mounts.remove(pos).unmount();
        Ok(())
    }

    /// Unmount all filesystems
    pub fn unmount_all(&self) {
        let mut mounts = self.mounts.lock();
        if !mounts.is_empty() {
            info!("Unmounting {} filesystem(s)", mounts.len());
        }
        for mut mount in mounts.drain(..) {
            mount.unmount();
        }
    }

    pub fn list_mounts(&self) -> Vec<PathBuf> {
        self.mounts.lock().iter().map(|m| m.path.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.mounts.lock().len()
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        self.unmount_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[test]
    fn test_fuse_options_follow_settings() {
        let options = MountOptions {
            read_only: true,
            allow_other: true,
            ..MountOptions::default()
        };
        let fuse = options.fuse_options();
        assert!(fuse.contains(&MountOption::RO));
        assert!(fuse.contains(&MountOption::AllowOther));
        assert!(!fuse.contains(&MountOption::RW));

        let fuse = MountOptions::default().fuse_options();
        assert!(fuse.contains(&MountOption::RW));
        assert!(!fuse.contains(&MountOption::AllowOther));
    }

    #[test]
    fn test_mount_rejects_missing_mount_point() {
        let manager = MountManager::new();
        let translator = Arc::new(Translator::new(Arc::new(MemoryBackend::new()), "/"));
        let err = manager
            .mount(
                PathBuf::from("/definitely/not/a/mount/point"),
                translator,
                &MountOptions::default(),
            )
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_unmount_unknown_path() {
        let manager = MountManager::new();
        assert!(manager.unmount(Path::new("/mnt/nothing")).is_err());
        assert!(manager.list_mounts().is_empty());
    }
}
