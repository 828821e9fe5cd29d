pub mod inode;

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, error, trace, warn};

use crate::backend::{FileType, Metadata};
use crate::error::{FsError, Result};
use crate::mount::MountOptions;
use crate::translator::Translator;

use self::inode::{InodeTable, ROOT_INODE};

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// Block size for reporting
const BLOCK_SIZE: u32 = 4096;

/// Default file mode (rw-r--r--)
const FILE_MODE: u16 = 0o644;
/// Default directory mode (rwxr-xr-x)
const DIR_MODE: u16 = 0o755;

fn to_fuse_file_type(ft: FileType) -> FuseFileType {
    match ft {
        FileType::File => FuseFileType::RegularFile,
        FileType::Directory => FuseFileType::Directory,
    }
}

/// Convert Metadata to FileAttr
fn metadata_to_attr(ino: u64, meta: &Metadata, uid: u32, gid: u32) -> FileAttr {
    let (perm, nlink) = if meta.is_dir() {
        (DIR_MODE, 2)
    } else {
        (FILE_MODE, 1)
    };

    FileAttr {
        ino,
        size: meta.size,
        blocks: meta.size.div_ceil(BLOCK_SIZE as u64),
        atime: meta.mtime,
        mtime: meta.mtime,
        ctime: meta.mtime,
        crtime: meta.mtime,
        kind: to_fuse_file_type(meta.file_type),
        perm,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Kernel offsets are signed; the translator only accepts non-negative ones
fn checked_offset(offset: i64) -> std::result::Result<u64, c_int> {
    u64::try_from(offset).map_err(|_| libc::EINVAL)
}

/// Whether an open with these flags must empty the file first.
///
/// With atomic O_TRUNC negotiated the kernel leaves truncation to open.
fn truncates_on_open(flags: i32) -> bool {
    flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY
}

/// Log a translator failure and turn it into an errno
fn errno(op: &str, path: &Path, err: FsError) -> c_int {
    match err {
        FsError::NotFound(_) => trace!("{} {:?}: {}", op, path, err),
        FsError::Unsupported(_) | FsError::NotTty => debug!("{} {:?}: {}", op, path, err),
        _ => error!("{} error for {:?}: {}", op, path, err),
    }
    err.to_errno()
}

/// `fuser` filesystem that hands every request to a [`Translator`]
pub struct FuseAdapter {
    translator: Arc<Translator>,
    inodes: InodeTable,
    /// Dedicated runtime that drives backend futures to completion
    runtime: tokio::runtime::Runtime,
    uid: u32,
    gid: u32,
    attr_ttl: Duration,
}

impl FuseAdapter {
    pub fn new(translator: Arc<Translator>, options: &MountOptions) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fs-mount-io")
            .enable_all()
            .build()?;

        // SAFETY: getuid/getgid cannot fail and touch no memory
        let uid = options.uid.unwrap_or_else(|| unsafe { libc::getuid() });
        let gid = options.gid.unwrap_or_else(|| unsafe { libc::getgid() });

        Ok(Self {
            translator,
            inodes: InodeTable::new(),
            runtime,
            uid,
            gid,
            attr_ttl: options.attr_ttl,
        })
    }

    fn inode_to_path(&self, ino: u64) -> std::result::Result<PathBuf, c_int> {
        self.inodes.get_path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> std::result::Result<PathBuf, c_int> {
        Ok(self.inode_to_path(parent)?.join(name))
    }

    fn attr(&self, ino: u64, meta: &Metadata) -> FileAttr {
        metadata_to_attr(ino, meta, self.uid, self.gid)
    }

    /// Block the calling FUSE thread until the future completes
    fn run_async<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }
}

impl Filesystem for FuseAdapter {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut KernelConfig,
    ) -> std::result::Result<(), c_int> {
        // Let O_TRUNC ride on open instead of a separate truncate, which
        // this filesystem always refuses
        if let Err(unsupported) = config.add_capabilities(fuser::consts::FUSE_ATOMIC_O_TRUNC) {
            warn!("kernel lacks capabilities {:#x}", unsupported);
        }
        debug!(
            "init: {} backend rooted at {:?}",
            self.translator.backend_name(),
            self.translator.root()
        );
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("lookup: {:?}", path);

        let translator = self.translator.clone();
        match self.run_async(async { translator.attributes(&path).await }) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.entry(&self.attr_ttl, &self.attr(ino, &meta), GENERATION);
            }
            Err(e) => reply.error(errno("lookup", &path, e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("getattr: {:?} (ino={})", path, ino);

        let translator = self.translator.clone();
        match self.run_async(async { translator.attributes(&path).await }) {
            Ok(meta) => reply.attr(&self.attr_ttl, &self.attr(ino, &meta)),
            Err(e) => reply.error(errno("getattr", &path, e)),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let result = if let Some(mode) = mode {
            self.translator.chmod(&path, mode)
        } else if uid.is_some() || gid.is_some() {
            self.translator.chown(&path, uid, gid)
        } else if let Some(size) = size {
            self.translator.truncate(&path, size)
        } else {
            self.translator.utimens(&path)
        };

        match result {
            Ok(()) => self.getattr(req, ino, reply),
            Err(e) => reply.error(errno("setattr", &path, e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.translator.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(errno("readlink", &path, e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        reply.error(errno("mknod", &path, self.translator.mknod(&path, mode, rdev)));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        debug!("mkdir: {:?}", path);

        let translator = self.translator.clone();
        match self.run_async(async { translator.mkdir(&path).await }) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.entry(&self.attr_ttl, &self.attr(ino, &meta), GENERATION);
            }
            Err(e) => reply.error(errno("mkdir", &path, e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        debug!("unlink: {:?}", path);

        let translator = self.translator.clone();
        match self.run_async(async { translator.unlink(&path).await }) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &path, e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        debug!("rmdir: {:?}", path);

        let translator = self.translator.clone();
        match self.run_async(async { translator.rmdir(&path).await }) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &path, e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        reply.error(errno("symlink", &path, self.translator.symlink(&path, target)));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_path, new_path) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };

        debug!("rename: {:?} -> {:?}", old_path, new_path);

        let translator = self.translator.clone();
        match self.run_async(async { translator.rename(&old_path, &new_path).await }) {
            Ok(()) => {
                self.inodes.rename_path(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rename", &old_path, e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (target, link) = match (self.inode_to_path(ino), self.child_path(newparent, newname)) {
            (Ok(target), Ok(link)) => (target, link),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };

        reply.error(errno("link", &link, self.translator.link(&target, &link)));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        if truncates_on_open(flags) {
            debug!("open: truncating {:?}", path);
            let translator = self.translator.clone();
            if let Err(e) = self.run_async(async { translator.create(&path).await }) {
                reply.error(errno("open", &path, e));
                return;
            }
        }

        reply.opened(self.translator.open(&path), 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let (path, offset) = match (self.inode_to_path(ino), checked_offset(offset)) {
            (Ok(path), Ok(offset)) => (path, offset),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };

        trace!("read: {:?} offset={} size={}", path, offset, size);

        let translator = self.translator.clone();
        match self.run_async(async { translator.read(&path, size, offset).await }) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &path, e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let (path, offset) = match (self.inode_to_path(ino), checked_offset(offset)) {
            (Ok(path), Ok(offset)) => (path, offset),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };

        trace!("write: {:?} offset={} size={}", path, offset, data.len());

        let translator = self.translator.clone();
        match self.run_async(async { translator.write(&path, data, offset).await }) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &path, e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.flush(&path, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("flush", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.release(&path, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("release", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.fsync(&path, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("fsync", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.inode_to_path(ino) {
            Ok(path) => reply.opened(self.translator.opendir(&path), 0),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("readdir: {:?} offset={}", path, offset);

        let translator = self.translator.clone();
        let entries = match self.run_async(async { translator.list(&path).await }) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno("readdir", &path, e));
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (idx, entry) in entries.iter().enumerate().skip(skip) {
            let entry_ino = match entry.name.to_str() {
                Some(".") => ino,
                Some("..") => {
                    if ino == ROOT_INODE {
                        ROOT_INODE
                    } else {
                        self.inodes.parent_inode(&path)
                    }
                }
                _ => self.inodes.get_or_create_inode(&path.join(&entry.name)),
            };

            // Offset handed back is the index of the next entry
            if reply.add(
                entry_ino,
                (idx + 1) as i64,
                to_fuse_file_type(entry.file_type),
                &entry.name,
            ) {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.releasedir(&path, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("releasedir", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.fsyncdir(&path, fh) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("fsyncdir", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.inodes.get_path(ino).unwrap_or_else(|| PathBuf::from("/"));
        let stats = self.translator.statfs(&path);
        reply.statfs(
            stats.blocks,
            stats.bfree,
            stats.bavail,
            stats.files,
            stats.ffree,
            stats.bsize,
            stats.namelen,
            stats.frsize,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.setxattr(&path, name, value) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("setxattr", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.getxattr(&path, name) {
                Ok(value) if size == 0 => reply.size(value.len() as u32),
                Ok(value) if value.len() <= size as usize => reply.data(&value),
                Ok(_) => reply.error(libc::ERANGE),
                Err(e) => reply.error(errno("getxattr", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, _size: u32, reply: ReplyXattr) {
        match self.inode_to_path(ino) {
            Ok(path) => reply.error(errno("listxattr", &path, self.translator.listxattr(&path))),
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.removexattr(&path, name) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("removexattr", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.access(&path, mask) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("access", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: u32,
        cmd: u32,
        _in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        match self.inode_to_path(ino) {
            Ok(path) => match self.translator.ioctl(&path, cmd) {
                Ok(data) if data.len() <= out_size as usize => reply.ioctl(0, &data),
                Ok(_) => reply.error(libc::EINVAL),
                Err(e) => reply.error(errno("ioctl", &path, e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        debug!("create: {:?}", path);

        let translator = self.translator.clone();
        let result = self.run_async(async {
            translator.create(&path).await?;
            translator.attributes(&path).await
        });

        match result {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(&path);
                let fh = self.translator.open(&path);
                reply.created(&self.attr_ttl, &self.attr(ino, &meta), GENERATION, fh, 0);
            }
            Err(e) => reply.error(errno("create", &path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_to_attr() {
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(42);

        let attr = metadata_to_attr(7, &Metadata::file(5000, mtime), 1000, 100);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FuseFileType::RegularFile);
        assert_eq!(attr.perm, FILE_MODE);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.mtime, mtime);
        assert_eq!((attr.uid, attr.gid), (1000, 100));

        let attr = metadata_to_attr(1, &Metadata::directory(mtime), 0, 0);
        assert_eq!(attr.kind, FuseFileType::Directory);
        assert_eq!(attr.perm, DIR_MODE);
        assert_eq!(attr.nlink, 2);
    }

    #[test]
    fn test_truncating_opens() {
        assert!(truncates_on_open(libc::O_WRONLY | libc::O_TRUNC));
        assert!(truncates_on_open(libc::O_RDWR | libc::O_TRUNC));
        assert!(!truncates_on_open(libc::O_RDONLY | libc::O_TRUNC));
        assert!(!truncates_on_open(libc::O_WRONLY));
        assert!(!truncates_on_open(libc::O_RDWR | libc::O_APPEND));
    }

    #[test]
    fn test_negative_offsets_are_invalid() {
        assert_eq!(checked_offset(0), Ok(0));
        assert_eq!(checked_offset(4096), Ok(4096));
        assert_eq!(checked_offset(-1), Err(libc::EINVAL));
    }
}
