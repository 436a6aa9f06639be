//! Open file objects and the descriptor table that owns them.
//!
//! A [`File`] is one open instance of an inode. Its offset, access mode and
//! inode handle sit behind its own read/write lock; only the slot's reference
//! count lives outside it, so that allocation can claim a free slot without
//! taking the lock. Descriptors handed out by the table are [`Fd`]s carrying
//! the slot generation, so a descriptor kept across close and reuse of its
//! slot is refused instead of reaching the new file.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use log::{debug, warn};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    error::{FsError, FsResult},
    flags::{FcntlCmd, OpenFlags, Whence},
    inode::{InodeLayer, InodeRef, Stat},
    transaction::TransactionManager,
};

/// Descriptor handle: table index plus the generation of the slot it was
/// issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd {
    index: u32,
    generation: u32,
}

impl Fd {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    None,
    Inode,
    Dir,
}

struct FileState {
    generation: u32,
    ftype: FileType,
    flags: OpenFlags,
    readable: bool,
    writable: bool,
    ip: Option<InodeRef>,
}

impl FileState {
    fn inode(&self) -> FsResult<&InodeRef> {
        self.ip.as_ref().ok_or(FsError::BadDescriptor)
    }
}

pub struct File {
    refs: AtomicU32,
    off: AtomicU64,
    state: RwLock<FileState>,
}

impl File {
    fn new() -> Self {
        Self {
            refs: AtomicU32::new(0),
            off: AtomicU64::new(0),
            state: RwLock::new(FileState {
                generation: 0,
                ftype: FileType::None,
                flags: OpenFlags::empty(),
                readable: false,
                writable: false,
                ip: None,
            }),
        }
    }

    fn check(&self, state: &FileState, fd: Fd) -> FsResult<()> {
        if self.refs.load(Ordering::Acquire) == 0
            || state.generation != fd.generation
            || state.ip.is_none()
        {
            return Err(FsError::BadDescriptor);
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        self.off.load(Ordering::Acquire)
    }
}

/// A claimed slot not yet populated. Dropping it returns the slot to the
/// free pool.
pub struct Reservation<'a> {
    table: &'a FileTable,
    index: usize,
}

impl Reservation<'_> {
    /// Populates the slot and turns the reservation into a live descriptor.
    pub fn install(self, ip: InodeRef, ftype: FileType, flags: OpenFlags) -> Fd {
        let file = &self.table.files[self.index];
        let mut state = file.state.write();
        state.generation = state.generation.wrapping_add(1);
        state.ftype = ftype;
        state.flags = flags;
        state.readable = flags.readable();
        state.writable = flags.writable();
        state.ip = Some(ip);
        file.off.store(0, Ordering::Release);
        let fd = Fd {
            index: self.index as u32,
            generation: state.generation,
        };
        drop(state);
        core::mem::forget(self);
        fd
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.table.files[self.index]
            .refs
            .store(0, Ordering::Release);
    }
}

pub struct FileTable {
    files: Box<[File]>,
    fd_start: i32,
}

impl FileTable {
    pub fn new(capacity: usize, fd_start: i32) -> Self {
        Self {
            files: (0..capacity).map(|_| File::new()).collect(),
            fd_start,
        }
    }

    pub fn capacity(&self) -> usize {
        self.files.len()
    }

    /// Number of allocated slots.
    pub fn in_use(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.refs.load(Ordering::Acquire) > 0)
            .count()
    }

    /// Claims a free slot with reference count 1, or `None` when the table
    /// is full.
    pub fn allocate(&self) -> Option<Reservation<'_>> {
        let index = self.files.iter().position(|f| {
            f.refs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })?;
        Some(Reservation { table: self, index })
    }

    /// Descriptor for a caller-visible integer. Raw integers carry no
    /// generation, so the slot's current one is assumed.
    pub fn fd_from_raw(&self, raw: i32) -> FsResult<Fd> {
        let index = raw
            .checked_sub(self.fd_start)
            .and_then(|i| usize::try_from(i).ok())
            .ok_or(FsError::BadDescriptor)?;
        let file = self.files.get(index).ok_or(FsError::BadDescriptor)?;
        let generation = file.state.read().generation;
        Ok(Fd {
            index: index as u32,
            generation,
        })
    }

    pub fn raw(&self, fd: Fd) -> i32 {
        self.fd_start + fd.index as i32
    }

    fn slot(&self, fd: Fd) -> FsResult<&File> {
        self.files.get(fd.index()).ok_or(FsError::BadDescriptor)
    }

    fn shared(&self, fd: Fd) -> FsResult<(&File, RwLockReadGuard<'_, FileState>)> {
        let file = self.slot(fd)?;
        let state = file.state.read();
        file.check(&state, fd)?;
        Ok((file, state))
    }

    fn exclusive(&self, fd: Fd) -> FsResult<(&File, RwLockWriteGuard<'_, FileState>)> {
        let file = self.slot(fd)?;
        let state = file.state.write();
        file.check(&state, fd)?;
        Ok((file, state))
    }

    pub fn file_type(&self, fd: Fd) -> FsResult<FileType> {
        let (_, state) = self.shared(fd)?;
        Ok(state.ftype)
    }

    pub fn offset(&self, fd: Fd) -> FsResult<u64> {
        let (file, _state) = self.shared(fd)?;
        Ok(file.offset())
    }

    pub fn read(&self, layer: &dyn InodeLayer, fd: Fd, buf: &mut [u8]) -> FsResult<usize> {
        let (file, state) = self.shared(fd)?;
        let ip = readable_inode(&state)?;
        let n = layer.readi(ip, buf, file.offset())?;
        if n > 0 {
            file.off.fetch_add(n as u64, Ordering::AcqRel);
        }
        Ok(n)
    }

    pub fn pread(
        &self,
        layer: &dyn InodeLayer,
        fd: Fd,
        buf: &mut [u8],
        offset: u64,
    ) -> FsResult<usize> {
        let (_, state) = self.shared(fd)?;
        let ip = readable_inode(&state)?;
        layer.readi(ip, buf, offset)
    }

    pub fn write(
        &self,
        layer: &dyn InodeLayer,
        tm: &TransactionManager,
        fd: Fd,
        buf: &[u8],
    ) -> FsResult<usize> {
        let (file, state) = self.exclusive(fd)?;
        let ip = writable_inode(&state)?;
        let off = if state.flags.contains(OpenFlags::O_APPEND) {
            ip.size()
        } else {
            file.offset()
        };

        let mut tx = tm.begin();
        let n = layer.writei(&mut tx, ip, buf, off)?;
        tx.commit()?;
        file.off.store(off + n as u64, Ordering::Release);
        Ok(n)
    }

    pub fn pwrite(
        &self,
        layer: &dyn InodeLayer,
        tm: &TransactionManager,
        fd: Fd,
        buf: &[u8],
        offset: u64,
    ) -> FsResult<usize> {
        let (_, state) = self.exclusive(fd)?;
        let ip = writable_inode(&state)?;
        let mut tx = tm.begin();
        let n = layer.writei(&mut tx, ip, buf, offset)?;
        tx.commit()?;
        Ok(n)
    }

    /// Moves the offset. A result below zero is refused and the offset is
    /// left as it was.
    pub fn lseek(&self, fd: Fd, offset: i64, whence: Whence) -> FsResult<u64> {
        let (file, state) = self.exclusive(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.offset() as i64,
            // size() holds the inode read lock only for the load
            Whence::End => state.inode()?.size() as i64,
        };
        let new = base
            .checked_add(offset)
            .filter(|off| *off >= 0)
            .ok_or(FsError::InvalidArgument)? as u64;
        file.off.store(new, Ordering::Release);
        Ok(new)
    }

    pub fn fstat(&self, layer: &dyn InodeLayer, fd: Fd) -> FsResult<Stat> {
        let (_, state) = self.shared(fd)?;
        Ok(layer.stati(state.inode()?))
    }

    pub fn fallocate(
        &self,
        layer: &dyn InodeLayer,
        tm: &TransactionManager,
        fd: Fd,
        offset: u64,
        len: u64,
    ) -> FsResult<()> {
        let (_, state) = self.shared(fd)?;
        let mut tx = tm.begin();
        layer.fallocate(&mut tx, state.inode()?, offset, len)?;
        tx.commit()
    }

    pub fn ftruncate(
        &self,
        layer: &dyn InodeLayer,
        tm: &TransactionManager,
        fd: Fd,
        length: u64,
    ) -> FsResult<()> {
        let (_, state) = self.shared(fd)?;
        let mut tx = tm.begin();
        layer.itrunc(&mut tx, state.inode()?, length)?;
        tx.commit()
    }

    pub fn fcntl(&self, fd: Fd, cmd: FcntlCmd, arg: i64) -> FsResult<i32> {
        let (_, state) = self.shared(fd)?;
        match cmd {
            FcntlCmd::GetFl => Ok(state.flags.bits()),
            cmd if cmd.is_lock() => {
                warn!("fcntl {:?}: record locks are not enforced", cmd);
                Ok(0)
            }
            cmd => {
                debug!("fcntl {:?} arg {}: ignored", cmd, arg);
                Ok(0)
            }
        }
    }

    /// Fills `buf` with directory records starting at the descriptor's
    /// offset and advances it past them.
    pub fn getdents(&self, layer: &dyn InodeLayer, fd: Fd, buf: &mut [u8]) -> FsResult<usize> {
        let (file, state) = self.exclusive(fd)?;
        if state.ftype != FileType::Dir {
            return Err(FsError::BadDescriptor);
        }
        let ip = state.inode()?;
        let mut off = file.offset();
        if off >= ip.size() {
            return Ok(0);
        }
        if !ip.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let n = layer.dir_get_entries(ip, buf, &mut off)?;
        file.off.store(off, Ordering::Release);
        Ok(n)
    }

    /// Drops one reference. The last one releases the inode handle and frees
    /// the slot.
    pub fn close(&self, fd: Fd) -> FsResult<()> {
        let file = self.slot(fd)?;
        let ip = {
            let mut state = file.state.write();
            file.check(&state, fd)?;
            if file.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
                return Ok(());
            }
            state.ftype = FileType::None;
            state.flags = OpenFlags::empty();
            state.readable = false;
            state.writable = false;
            file.off.store(0, Ordering::Release);
            state.ip.take()
        };
        if let Some(ip) = ip {
            debug!("close fd {}, inum {}", self.raw(fd), ip.inum());
        }
        Ok(())
    }
}

fn readable_inode(state: &FileState) -> FsResult<&InodeRef> {
    if !state.readable {
        return Err(FsError::BadDescriptor);
    }
    if state.ftype == FileType::Dir {
        return Err(FsError::IsADirectory);
    }
    state.inode()
}

fn writable_inode(state: &FileState) -> FsResult<&InodeRef> {
    if !state.writable {
        return Err(FsError::BadDescriptor);
    }
    if state.ftype == FileType::Dir {
        return Err(FsError::IsADirectory);
    }
    state.inode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{Inode, InodeMeta, InodeType};
    use alloc::sync::Arc;

    fn inode(itype: InodeType) -> Arc<Inode> {
        Arc::new(Inode::new(1, 42, itype, InodeMeta::default()))
    }

    #[test]
    fn capacity_bounds_allocation() {
        let table = FileTable::new(2, 100);
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        assert!(table.allocate().is_none());
        assert_eq!(table.in_use(), 2);
        drop(a);
        assert_eq!(table.in_use(), 1);
        assert!(table.allocate().is_some());
        drop(b);
    }

    #[test]
    fn close_releases_inode_and_slot() {
        let table = FileTable::new(4, 100);
        let ino = inode(InodeType::File);
        let fd = table
            .allocate()
            .unwrap()
            .install(InodeRef::get(&ino), FileType::Inode, OpenFlags::O_RDWR);
        assert_eq!(ino.refcount(), 1);
        assert_eq!(table.raw(fd), 100 + fd.index() as i32);

        table.close(fd).unwrap();
        assert_eq!(ino.refcount(), 0);
        assert_eq!(table.in_use(), 0);
        assert_eq!(table.close(fd), Err(FsError::BadDescriptor));
    }

    #[test]
    fn stale_descriptor_is_refused_after_reuse() {
        let table = FileTable::new(1, 0);
        let ino = inode(InodeType::File);
        let old = table
            .allocate()
            .unwrap()
            .install(InodeRef::get(&ino), FileType::Inode, OpenFlags::O_RDONLY);
        table.close(old).unwrap();
        let new = table
            .allocate()
            .unwrap()
            .install(InodeRef::get(&ino), FileType::Inode, OpenFlags::O_RDONLY);
        assert_eq!(old.index(), new.index());
        assert_eq!(table.file_type(old), Err(FsError::BadDescriptor));
        assert_eq!(table.file_type(new), Ok(FileType::Inode));
        assert_eq!(table.fd_from_raw(0), Ok(new));
    }

    #[test]
    fn raw_descriptors_outside_the_table() {
        let table = FileTable::new(4, 1000);
        assert_eq!(table.fd_from_raw(3), Err(FsError::BadDescriptor));
        assert_eq!(table.fd_from_raw(1004), Err(FsError::BadDescriptor));
        // in range but never opened
        let fd = table.fd_from_raw(1001).unwrap();
        assert_eq!(table.offset(fd), Err(FsError::BadDescriptor));
    }

    #[test]
    fn seek_rules() {
        let table = FileTable::new(1, 0);
        let ino = Arc::new(Inode::new(
            1,
            7,
            InodeType::File,
            InodeMeta {
                size: 100,
                nlink: 1,
                freed: false,
            },
        ));
        let fd = table
            .allocate()
            .unwrap()
            .install(InodeRef::get(&ino), FileType::Inode, OpenFlags::O_RDONLY);
        assert_eq!(table.lseek(fd, 10, Whence::Set), Ok(10));
        assert_eq!(table.lseek(fd, 5, Whence::Cur), Ok(15));
        assert_eq!(table.lseek(fd, -20, Whence::End), Ok(80));
        assert_eq!(table.lseek(fd, -81, Whence::Cur), Err(FsError::InvalidArgument));
        assert_eq!(table.offset(fd), Ok(80));
    }

    #[test]
    fn fcntl_reports_flags() {
        let table = FileTable::new(1, 0);
        let ino = inode(InodeType::File);
        let flags = OpenFlags::O_WRONLY | OpenFlags::O_APPEND;
        let fd = table
            .allocate()
            .unwrap()
            .install(InodeRef::get(&ino), FileType::Inode, flags);
        assert_eq!(table.fcntl(fd, FcntlCmd::GetFl, 0), Ok(flags.bits()));
        assert_eq!(table.fcntl(fd, FcntlCmd::SetLk, 0), Ok(0));
        assert_eq!(table.fcntl(fd, FcntlCmd::Other(1030), 0), Ok(0));
    }
}
