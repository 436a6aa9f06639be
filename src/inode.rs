//! Inode handles and the interface of the inode layer.
//!
//! The layer below the POSIX shim owns inode storage, directory blocks and
//! allocation. This module fixes what the shim needs from it: reference
//! counted handles ([`InodeRef`]) with their own read/write lock, and the
//! primitives listed on [`InodeLayer`].

use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};
use serde::{Deserialize, Serialize};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::FsResult;
use crate::transaction::Transaction;

pub const ROOT_INUM: u32 = 1;
pub const BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeType {
    File,
    Dir,
}

bitflags! {
    pub struct StatMode: u32 {
        const S_IFDIR = 0o040000;
        const S_IFREG = 0o100000;
        const S_IRWXU = 0o700;
        const S_IRGRP = 0o040;
        const S_IXGRP = 0o010;
        const S_IROTH = 0o004;
        const S_IXOTH = 0o001;
    }
}

/// `struct stat` subset filled from inode metadata.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_size: u64,
    pub st_blksize: u32,
    pub st_blocks: u64,
}

/// Mutable metadata, guarded by the inode lock.
#[derive(Debug, Clone, Default)]
pub struct InodeMeta {
    pub size: u64,
    pub nlink: u32,
    /// Set once the inode has been deallocated.
    pub freed: bool,
}

pub struct Inode {
    inum: u32,
    dev: u8,
    itype: InodeType,
    refs: AtomicU32,
    meta: RwLock<InodeMeta>,
}

impl Inode {
    pub fn new(dev: u8, inum: u32, itype: InodeType, meta: InodeMeta) -> Self {
        Self {
            inum,
            dev,
            itype,
            refs: AtomicU32::new(0),
            meta: RwLock::new(meta),
        }
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    pub fn dev(&self) -> u8 {
        self.dev
    }

    pub fn itype(&self) -> InodeType {
        self.itype
    }

    pub fn is_dir(&self) -> bool {
        self.itype == InodeType::Dir
    }

    /// Number of live handles.
    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn rdlock(&self) -> RwLockReadGuard<'_, InodeMeta> {
        self.meta.read()
    }

    pub fn wrlock(&self) -> RwLockWriteGuard<'_, InodeMeta> {
        self.meta.write()
    }

    /// Current size, read under the inode read lock.
    pub fn size(&self) -> u64 {
        self.rdlock().size
    }

    pub fn stat(&self) -> Stat {
        let meta = self.rdlock();
        let mode = match self.itype {
            InodeType::Dir => {
                StatMode::S_IFDIR
                    | StatMode::S_IRWXU
                    | StatMode::S_IRGRP
                    | StatMode::S_IXGRP
                    | StatMode::S_IROTH
                    | StatMode::S_IXOTH
            }
            InodeType::File => StatMode::S_IFREG | StatMode::S_IRWXU | StatMode::S_IRGRP,
        };
        Stat {
            st_dev: self.dev as u64,
            st_ino: self.inum as u64,
            st_mode: mode.bits(),
            st_nlink: meta.nlink,
            st_size: meta.size,
            st_blksize: BLOCK_SIZE,
            st_blocks: (meta.size + 511) / 512,
        }
    }
}

/// Counted reference to an inode. Taking one increments the inode's
/// reference count; dropping it releases that reference, on every path.
pub struct InodeRef(Arc<Inode>);

impl InodeRef {
    pub fn get(inode: &Arc<Inode>) -> Self {
        inode.refs.fetch_add(1, Ordering::AcqRel);
        Self(inode.clone())
    }

    pub fn same_inode(&self, other: &InodeRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        Self::get(&self.0)
    }
}

impl Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.0
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        let prev = self.0.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "inode {} released too often", self.0.inum);
    }
}

impl core::fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InodeRef")
            .field("dev", &self.0.dev)
            .field("inum", &self.0.inum)
            .field("itype", &self.0.itype)
            .finish()
    }
}

/// Primitives the POSIX layer consumes from the inode layer.
///
/// Paths handed to these methods are absolute. Every primitive that mutates
/// metadata takes the caller's open [`Transaction`] and logs into it; on error
/// it must leave no partial mutation behind. Each applied mutation registers
/// its inverse with [`Transaction::on_abort`], so a transaction that aborts or
/// fails to commit leaves the tree as it found it.
pub trait InodeLayer: Send + Sync {
    /// Device this layer serves.
    fn dev(&self) -> u8;

    fn namei(&self, path: &str) -> Option<InodeRef>;

    /// Resolves the parent directory of `path` and returns it with the leaf name.
    fn nameiparent(&self, path: &str) -> Option<(InodeRef, String)>;

    /// Creates `path` as `itype`, or returns the existing entry. The flag is
    /// true when the entry already existed.
    fn object_create(
        &self,
        tx: &mut Transaction<'_>,
        path: &str,
        itype: InodeType,
    ) -> FsResult<(InodeRef, bool)>;

    fn dir_lookup(&self, dir: &InodeRef, name: &str) -> Option<InodeRef>;

    fn dir_add_entry(
        &self,
        tx: &mut Transaction<'_>,
        dir: &InodeRef,
        name: &str,
        inode: &InodeRef,
    ) -> FsResult<()>;

    fn dir_remove_entry(
        &self,
        tx: &mut Transaction<'_>,
        dir: &InodeRef,
        name: &str,
        inum: u32,
    ) -> FsResult<()>;

    fn dir_change_entry(
        &self,
        tx: &mut Transaction<'_>,
        dir: &InodeRef,
        old_name: &str,
        new_name: &str,
    ) -> FsResult<()>;

    /// True when the directory holds nothing but "." and "..".
    fn dir_is_empty(&self, dir: &InodeRef) -> bool;

    /// Encodes `linux_dirent64` records into `buf` starting at byte offset
    /// `off` of the directory, advancing `off` past the consumed entries.
    /// Returns the number of bytes produced.
    fn dir_get_entries(&self, dir: &InodeRef, buf: &mut [u8], off: &mut u64) -> FsResult<usize>;

    /// Deallocates the inode, consuming the caller's last handle.
    fn idealloc(&self, tx: &mut Transaction<'_>, inode: InodeRef) -> FsResult<()>;

    fn itrunc(&self, tx: &mut Transaction<'_>, inode: &InodeRef, length: u64) -> FsResult<()>;

    fn fallocate(
        &self,
        tx: &mut Transaction<'_>,
        inode: &InodeRef,
        offset: u64,
        length: u64,
    ) -> FsResult<()>;

    fn readi(&self, inode: &InodeRef, buf: &mut [u8], offset: u64) -> FsResult<usize>;

    fn writei(
        &self,
        tx: &mut Transaction<'_>,
        inode: &InodeRef,
        buf: &[u8],
        offset: u64,
    ) -> FsResult<usize>;

    fn stati(&self, inode: &InodeRef) -> Stat {
        inode.stat()
    }

    /// Drops the cached name resolution of `path` on `dev`.
    fn dlookup_del(&self, dev: u8, path: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_count_references() {
        let inode = Arc::new(Inode::new(1, 5, InodeType::File, InodeMeta::default()));
        assert_eq!(inode.refcount(), 0);
        let a = InodeRef::get(&inode);
        let b = a.clone();
        assert_eq!(inode.refcount(), 2);
        assert!(a.same_inode(&b));
        drop(a);
        drop(b);
        assert_eq!(inode.refcount(), 0);
    }

    #[test]
    fn stat_reports_type_and_size() {
        let meta = InodeMeta {
            size: 1000,
            nlink: 1,
            freed: false,
        };
        let inode = Arc::new(Inode::new(1, 9, InodeType::File, meta));
        let st = inode.stat();
        assert_eq!(st.st_ino, 9);
        assert_eq!(st.st_size, 1000);
        assert_eq!(st.st_blocks, 2);
        assert!(StatMode::from_bits_truncate(st.st_mode).contains(StatMode::S_IFREG));
    }
}
