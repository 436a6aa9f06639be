//! Raw call surface.
//!
//! Descriptors are plain integers offset by the configured base, flags and
//! whence values are the Linux encodings, and every call returns either a
//! non-negative result or a negated errno.

use log::info;
use spin::Once;

use crate::{
    error::{FsError, FsResult},
    flags::{FcntlCmd, OpenFlags, Whence},
    inode::Stat,
    posix::PosixFs,
};

static POSIX: Once<PosixFs> = Once::new();

/// Installs the process-wide instance. Later calls keep the first one.
pub fn init(fs: PosixFs) -> &'static PosixFs {
    POSIX.call_once(|| {
        info!(
            "posix layer ready: {} descriptors from {}",
            fs.config().nr_open_files,
            fs.config().fd_start
        );
        fs
    })
}

pub fn get() -> Option<&'static PosixFs> {
    POSIX.get()
}

fn ret_unit(res: FsResult<()>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(e) => e.neg_errno(),
    }
}

fn ret_size(res: FsResult<usize>) -> isize {
    match res {
        Ok(n) => n as isize,
        Err(e) => e.neg_errno() as isize,
    }
}

fn non_negative(value: i64) -> FsResult<u64> {
    u64::try_from(value).map_err(|_| FsError::InvalidArgument)
}

impl PosixFs {
    pub fn sys_open(&self, path: &str, flags: i32, _mode: u32) -> i32 {
        match self.open(path, OpenFlags::from_bits_truncate(flags)) {
            Ok(fd) => self.files().raw(fd),
            Err(e) => e.neg_errno(),
        }
    }

    pub fn sys_creat(&self, path: &str, _mode: u32) -> i32 {
        match self.creat(path) {
            Ok(fd) => self.files().raw(fd),
            Err(e) => e.neg_errno(),
        }
    }

    pub fn sys_access(&self, path: &str, mode: i32) -> i32 {
        ret_unit(self.access(path, mode))
    }

    pub fn sys_read(&self, fd: i32, buf: &mut [u8]) -> isize {
        ret_size(
            self.files()
                .fd_from_raw(fd)
                .and_then(|fd| self.read(fd, buf)),
        )
    }

    pub fn sys_pread(&self, fd: i32, buf: &mut [u8], offset: i64) -> isize {
        ret_size(
            self.files()
                .fd_from_raw(fd)
                .and_then(|fd| self.pread(fd, buf, non_negative(offset)?)),
        )
    }

    pub fn sys_write(&self, fd: i32, buf: &[u8]) -> isize {
        ret_size(
            self.files()
                .fd_from_raw(fd)
                .and_then(|fd| self.write(fd, buf)),
        )
    }

    pub fn sys_pwrite(&self, fd: i32, buf: &[u8], offset: i64) -> isize {
        ret_size(
            self.files()
                .fd_from_raw(fd)
                .and_then(|fd| self.pwrite(fd, buf, non_negative(offset)?)),
        )
    }

    pub fn sys_lseek(&self, fd: i32, offset: i64, whence: i32) -> i64 {
        let res = self.files().fd_from_raw(fd).and_then(|fd| {
            let whence = Whence::try_from(whence)?;
            self.lseek(fd, offset, whence)
        });
        match res {
            Ok(off) => off as i64,
            Err(e) => e.neg_errno() as i64,
        }
    }

    pub fn sys_close(&self, fd: i32) -> i32 {
        ret_unit(self.files().fd_from_raw(fd).and_then(|fd| self.close(fd)))
    }

    pub fn sys_mkdir(&self, path: &str, _mode: u32) -> i32 {
        ret_unit(self.mkdir(path))
    }

    pub fn sys_rmdir(&self, path: &str) -> i32 {
        ret_unit(self.rmdir(path))
    }

    pub fn sys_stat(&self, path: &str, out: &mut Stat) -> i32 {
        ret_unit(self.stat(path).map(|st| *out = st))
    }

    pub fn sys_fstat(&self, fd: i32, out: &mut Stat) -> i32 {
        ret_unit(
            self.files()
                .fd_from_raw(fd)
                .and_then(|fd| self.fstat(fd))
                .map(|st| *out = st),
        )
    }

    pub fn sys_fallocate(&self, fd: i32, offset: i64, len: i64) -> i32 {
        ret_unit(self.files().fd_from_raw(fd).and_then(|fd| {
            self.fallocate(fd, non_negative(offset)?, non_negative(len)?)
        }))
    }

    pub fn sys_unlink(&self, path: &str) -> i32 {
        ret_unit(self.unlink(path))
    }

    pub fn sys_truncate(&self, path: &str, length: i64) -> i32 {
        ret_unit(non_negative(length).and_then(|len| self.truncate(path, len)))
    }

    pub fn sys_ftruncate(&self, fd: i32, length: i64) -> i32 {
        ret_unit(
            self.files()
                .fd_from_raw(fd)
                .and_then(|fd| self.ftruncate(fd, non_negative(length)?)),
        )
    }

    pub fn sys_rename(&self, oldpath: &str, newpath: &str) -> i32 {
        ret_unit(self.rename(oldpath, newpath))
    }

    pub fn sys_getdents(&self, fd: i32, buf: &mut [u8], offset: i64) -> isize {
        ret_size(
            self.files()
                .fd_from_raw(fd)
                .and_then(|fd| self.getdents(fd, buf, offset as u64)),
        )
    }

    pub fn sys_fcntl(&self, fd: i32, cmd: i32, arg: i64) -> i32 {
        match self
            .files()
            .fd_from_raw(fd)
            .and_then(|fd| self.fcntl(fd, FcntlCmd::from_raw(cmd), arg))
        {
            Ok(v) => v,
            Err(e) => e.neg_errno(),
        }
    }

    pub fn sys_chdir(&self, path: Option<&str>) -> i32 {
        ret_unit(self.chdir(path))
    }
}
