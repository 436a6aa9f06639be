//! POSIX call handlers.
//!
//! Every handler composes a full path through the working directory, brackets
//! any mutation in a log transaction and maps the inode layer's outcome onto
//! the POSIX error contract. Inode handles never outlive the call that took
//! them, except the one a descriptor owns until its last close.

use alloc::{string::String, sync::Arc};
use log::debug;

use crate::{
    config::FsConfig,
    cwd::WorkingDir,
    error::{FsError, FsResult},
    file::{Fd, FileTable, FileType},
    flags::{FcntlCmd, OpenFlags, Whence, F_OK},
    inode::{InodeLayer, InodeType, Stat},
    operation::{LogRecord, DINODE_SIZE},
    transaction::TransactionManager,
};

pub struct PosixFs {
    layer: Arc<dyn InodeLayer>,
    tm: Arc<TransactionManager>,
    files: FileTable,
    cwd: WorkingDir,
    config: FsConfig,
}

impl PosixFs {
    pub fn new(layer: Arc<dyn InodeLayer>, tm: Arc<TransactionManager>) -> Self {
        let config = FsConfig::default();
        Self {
            layer,
            tm,
            files: FileTable::new(config.nr_open_files, config.fd_start),
            cwd: WorkingDir::new(config.max_path),
            config,
        }
    }

    pub fn with_config(
        layer: Arc<dyn InodeLayer>,
        tm: Arc<TransactionManager>,
        config: FsConfig,
    ) -> FsResult<Self> {
        config.validate()?;
        Ok(Self {
            layer,
            tm,
            files: FileTable::new(config.nr_open_files, config.fd_start),
            cwd: WorkingDir::new(config.max_path),
            config,
        })
    }

    pub fn layer(&self) -> &dyn InodeLayer {
        self.layer.as_ref()
    }

    pub fn tm(&self) -> &TransactionManager {
        &self.tm
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Opens `path`. `O_CREAT` together with `O_DIRECTORY` is a caller bug.
    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<Fd> {
        assert!(
            !flags.contains(OpenFlags::O_CREAT | OpenFlags::O_DIRECTORY),
            "open: O_CREAT and O_DIRECTORY together are not supported"
        );
        let path = self.cwd.resolve(path);
        debug!("open {} {:?}", path, flags);

        // claim the slot first so a full table never strands a new inode
        let slot = self.files.allocate().ok_or(FsError::OutOfMemory)?;

        let mut tx = self.tm.begin();
        let ip = if flags.contains(OpenFlags::O_CREAT) {
            let (ip, existed) = match self.layer.object_create(&mut tx, &path, InodeType::File) {
                Ok(created) => created,
                Err(e) => {
                    debug!("open {}: create failed: {}", path, e);
                    tx.abort();
                    return Err(FsError::NoSuchEntry);
                }
            };
            if existed && flags.contains(OpenFlags::O_EXCL) {
                tx.abort();
                return Err(FsError::AlreadyExists);
            }
            ip
        } else {
            match self.layer.namei(&path) {
                Some(ip) => ip,
                None => {
                    tx.abort();
                    return Err(FsError::NoSuchEntry);
                }
            }
        };

        let ftype = if ip.is_dir() {
            if flags.writable() {
                tx.abort();
                return Err(FsError::PermissionDenied);
            }
            FileType::Dir
        } else {
            if flags.contains(OpenFlags::O_DIRECTORY) {
                tx.abort();
                return Err(FsError::NotADirectory);
            }
            FileType::Inode
        };

        if ftype == FileType::Inode && flags.contains(OpenFlags::O_TRUNC) && flags.writable() {
            self.layer.itrunc(&mut tx, &ip, 0)?;
        }

        tx.commit()?;
        let fd = slot.install(ip, ftype, flags);
        debug!("open {}: fd {}", path, self.files.raw(fd));
        Ok(fd)
    }

    pub fn creat(&self, path: &str) -> FsResult<Fd> {
        self.open(path, OpenFlags::O_CREAT | OpenFlags::O_RDWR)
    }

    /// Existence check. Only `F_OK` is supported.
    pub fn access(&self, path: &str, mode: i32) -> FsResult<()> {
        assert_eq!(mode, F_OK, "access: only F_OK is supported");
        let path = self.cwd.resolve(path);
        self.layer
            .namei(&path)
            .map(|_| ())
            .ok_or(FsError::NoSuchEntry)
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let path = self.cwd.resolve(path);
        debug!("mkdir {}", path);
        let mut tx = self.tm.begin();
        let existed = match self.layer.object_create(&mut tx, &path, InodeType::Dir) {
            Ok((_, existed)) => existed,
            Err(e) => {
                debug!("mkdir {}: {}", path, e);
                tx.abort();
                return Err(FsError::NoSuchEntry);
            }
        };
        tx.commit()?;
        if existed {
            return Err(FsError::AlreadyExists);
        }
        Ok(())
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let path = self.cwd.resolve(path);
        let ip = self.layer.namei(&path).ok_or(FsError::NoSuchEntry)?;
        if !ip.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if !self.layer.dir_is_empty(&ip) {
            return Err(FsError::DirectoryNotEmpty);
        }
        drop(ip);
        self.unlink(&path)
    }

    pub fn stat(&self, path: &str) -> FsResult<Stat> {
        let path = self.cwd.resolve(path);
        let ip = self.layer.namei(&path).ok_or(FsError::NoSuchEntry)?;
        Ok(self.layer.stati(&ip))
    }

    /// Removes the entry for `path` and deallocates its inode.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let path = self.cwd.resolve(path);
        debug!("unlink {}", path);
        let (parent, name) = self.layer.nameiparent(&path).ok_or(FsError::NoSuchEntry)?;
        let ip = self
            .layer
            .dir_lookup(&parent, &name)
            .ok_or(FsError::NoSuchEntry)?;

        let mut tx = self.tm.begin();
        if let Err(e) = self.layer.dir_remove_entry(&mut tx, &parent, &name, ip.inum()) {
            tx.abort();
            return Err(e);
        }
        self.layer.dlookup_del(ip.dev(), &path);
        drop(parent);

        let (dev, inum) = (ip.dev(), ip.inum());
        let ret = self.layer.idealloc(&mut tx, ip);
        tx.add_to_loghdr(LogRecord::Unlink {
            dev,
            inum,
            size: DINODE_SIZE,
        });
        tx.commit()?;
        ret
    }

    pub fn truncate(&self, path: &str, length: u64) -> FsResult<()> {
        let path = self.cwd.resolve(path);
        let ip = self.layer.namei(&path).ok_or(FsError::NoSuchEntry)?;
        let mut tx = self.tm.begin();
        if let Err(e) = self.layer.itrunc(&mut tx, &ip, length) {
            tx.abort();
            return Err(e);
        }
        tx.commit()
    }

    /// Renames within one directory; the target name must not exist.
    pub fn rename(&self, oldpath: &str, newpath: &str) -> FsResult<()> {
        let oldpath = self.cwd.resolve(oldpath);
        let newpath = self.cwd.resolve(newpath);
        debug!("rename {} -> {}", oldpath, newpath);
        let (src_dir, old_name) = self
            .layer
            .nameiparent(&oldpath)
            .ok_or(FsError::NoSuchEntry)?;
        let (dst_dir, new_name) = self
            .layer
            .nameiparent(&newpath)
            .ok_or(FsError::NoSuchEntry)?;
        assert!(
            src_dir.same_inode(&dst_dir),
            "rename: {} and {} are in different directories",
            oldpath,
            newpath
        );
        drop(dst_dir);

        let dev = src_dir.dev();
        let mut tx = self.tm.begin();
        self.layer.dlookup_del(dev, &newpath);
        let ret = self
            .layer
            .dir_change_entry(&mut tx, &src_dir, &old_name, &new_name);
        self.layer.dlookup_del(dev, &oldpath);
        drop(src_dir);
        match ret {
            Ok(()) => tx.commit(),
            Err(e) => {
                tx.abort();
                Err(e)
            }
        }
    }

    pub fn chdir(&self, path: Option<&str>) -> FsResult<()> {
        self.cwd.chdir(self.layer.as_ref(), path)
    }

    pub fn getcwd(&self) -> String {
        self.cwd.current()
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> FsResult<usize> {
        self.files.read(self.layer.as_ref(), fd, buf)
    }

    pub fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.files.pread(self.layer.as_ref(), fd, buf, offset)
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> FsResult<usize> {
        self.files.write(self.layer.as_ref(), &self.tm, fd, buf)
    }

    pub fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64) -> FsResult<usize> {
        self.files.pwrite(self.layer.as_ref(), &self.tm, fd, buf, offset)
    }

    pub fn lseek(&self, fd: Fd, offset: i64, whence: Whence) -> FsResult<u64> {
        self.files.lseek(fd, offset, whence)
    }

    pub fn close(&self, fd: Fd) -> FsResult<()> {
        self.files.close(fd)
    }

    pub fn fstat(&self, fd: Fd) -> FsResult<Stat> {
        self.files.fstat(self.layer.as_ref(), fd)
    }

    pub fn fallocate(&self, fd: Fd, offset: u64, len: u64) -> FsResult<()> {
        self.files
            .fallocate(self.layer.as_ref(), &self.tm, fd, offset, len)
    }

    pub fn ftruncate(&self, fd: Fd, length: u64) -> FsResult<()> {
        self.files.ftruncate(self.layer.as_ref(), &self.tm, fd, length)
    }

    pub fn fcntl(&self, fd: Fd, cmd: FcntlCmd, arg: i64) -> FsResult<i32> {
        self.files.fcntl(fd, cmd, arg)
    }

    /// Directory records from the descriptor's own offset; `_offset` is
    /// accepted for call compatibility only.
    pub fn getdents(&self, fd: Fd, buf: &mut [u8], _offset: u64) -> FsResult<usize> {
        self.files.getdents(self.layer.as_ref(), fd, buf)
    }
}
