//! In-memory inode layer.
//!
//! Keeps inodes, file contents and directory slots in memory behind the
//! [`InodeLayer`] interface. Directories use fixed-size slots of
//! [`DIRENT_SIZE`] bytes, so a directory's size and the `getdents` offset are
//! both slot-granular; removed entries leave a hole that the next insert reuses.
//!
//! Mutations are applied in place. Each one registers its inverse on the
//! caller's [`Transaction`], which replays them if the transaction does not
//! reach the log.
//!
//! Lock order: inode lock (parent before child), then the data, cache and
//! name-cache mutexes. Mutexes are never held while taking an inode lock.

use alloc::{collections::BTreeMap, string::String, string::ToString, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use log::debug;
use spin::Mutex;

use crate::{
    dirent,
    error::{FsError, FsResult},
    inode::{Inode, InodeLayer, InodeMeta, InodeRef, InodeType, ROOT_INUM},
    operation::LogRecord,
    path,
    transaction::Transaction,
    DIRSIZ,
};

/// On-media size of one directory slot: inode number plus name.
pub const DIRENT_SIZE: u64 = 4 + DIRSIZ as u64;
/// Largest file this layer will grow to. File bytes are held contiguously.
pub const MAX_FILE_SIZE: u64 = 64 << 20;

#[derive(Debug, Clone)]
struct DirSlot {
    name: String,
    inum: u32,
    itype: InodeType,
}

#[derive(Debug)]
enum InodeData {
    File { data: Vec<u8> },
    Directory { slots: Vec<Option<DirSlot>> },
}

/// Tables shared with the undo steps of open transactions.
struct MemState {
    icache: Mutex<BTreeMap<u32, Arc<Inode>>>,
    data: Mutex<BTreeMap<u32, InodeData>>,
    /// canonical path -> inum
    dlookup: Mutex<BTreeMap<String, u32>>,
    /// Bumped on every invalidation; a walk that raced with one is not cached.
    dlookup_gen: AtomicU64,
}

impl MemState {
    fn forget_names(&self) {
        let mut dlookup = self.dlookup.lock();
        self.dlookup_gen.fetch_add(1, Ordering::AcqRel);
        dlookup.clear();
    }

    /// Runs `f` on the slots of directory `dir` and resizes it to match.
    fn with_slots(&self, dir: &Inode, f: impl FnOnce(&mut Vec<Option<DirSlot>>)) {
        let mut meta = dir.wrlock();
        if meta.freed {
            return;
        }
        if let Some(InodeData::Directory { slots }) = self.data.lock().get_mut(&dir.inum()) {
            f(slots);
            meta.size = slots.len() as u64 * DIRENT_SIZE;
        }
    }
}

pub struct MemLayer {
    dev: u8,
    next_inum: AtomicU32,
    state: Arc<MemState>,
}

impl MemLayer {
    pub fn new(dev: u8) -> Self {
        let state = MemState {
            icache: Mutex::new(BTreeMap::new()),
            data: Mutex::new(BTreeMap::new()),
            dlookup: Mutex::new(BTreeMap::new()),
            dlookup_gen: AtomicU64::new(0),
        };
        let meta = InodeMeta {
            size: 2 * DIRENT_SIZE,
            nlink: 2,
            freed: false,
        };
        let root = Arc::new(Inode::new(dev, ROOT_INUM, InodeType::Dir, meta));
        state.icache.lock().insert(ROOT_INUM, root);
        state
            .data
            .lock()
            .insert(ROOT_INUM, Self::empty_dir(ROOT_INUM, ROOT_INUM));
        Self {
            dev,
            next_inum: AtomicU32::new(ROOT_INUM + 1),
            state: Arc::new(state),
        }
    }

    /// Number of allocated inodes, root included.
    pub fn live_inodes(&self) -> usize {
        self.state.icache.lock().len()
    }

    pub fn is_cached(&self, path: &str) -> bool {
        match path::canonical(path) {
            Some(key) => self.state.dlookup.lock().contains_key(&key),
            None => false,
        }
    }

    fn empty_dir(inum: u32, parent: u32) -> InodeData {
        InodeData::Directory {
            slots: alloc::vec![
                Some(DirSlot {
                    name: ".".to_string(),
                    inum,
                    itype: InodeType::Dir,
                }),
                Some(DirSlot {
                    name: "..".to_string(),
                    inum: parent,
                    itype: InodeType::Dir,
                }),
            ],
        }
    }

    fn iget(&self, inum: u32) -> Option<InodeRef> {
        self.state.icache.lock().get(&inum).map(InodeRef::get)
    }

    fn walk(&self, comps: &[&str]) -> Option<InodeRef> {
        let mut cur = self.iget(ROOT_INUM)?;
        for name in comps {
            cur = self.dir_lookup(&cur, name)?;
        }
        Some(cur)
    }

    /// Inode number bound to `name` in directory `dir`.
    fn lookup_slot(&self, dir: u32, name: &str) -> FsResult<Option<u32>> {
        let data = self.state.data.lock();
        match data.get(&dir) {
            Some(InodeData::Directory { slots }) => Ok(slots
                .iter()
                .flatten()
                .find(|slot| slot.name == name)
                .map(|slot| slot.inum)),
            Some(InodeData::File { .. }) => Err(FsError::NotADirectory),
            None => Err(FsError::NoSuchEntry),
        }
    }

    fn ialloc(&self, tx: &mut Transaction<'_>, parent: u32, itype: InodeType) -> InodeRef {
        let inum = self.next_inum.fetch_add(1, Ordering::SeqCst);
        let (meta, contents) = match itype {
            InodeType::File => (
                InodeMeta {
                    size: 0,
                    nlink: 1,
                    freed: false,
                },
                InodeData::File { data: Vec::new() },
            ),
            InodeType::Dir => (
                InodeMeta {
                    size: 2 * DIRENT_SIZE,
                    nlink: 2,
                    freed: false,
                },
                Self::empty_dir(inum, parent),
            ),
        };
        let inode = Arc::new(Inode::new(self.dev, inum, itype, meta));
        self.state.data.lock().insert(inum, contents);
        let handle = InodeRef::get(&inode);
        self.state.icache.lock().insert(inum, inode);
        tx.add_to_loghdr(LogRecord::InodeAlloc { inum, itype });

        let state = self.state.clone();
        tx.on_abort(move || {
            let inode = state.icache.lock().remove(&inum);
            state.data.lock().remove(&inum);
            if let Some(inode) = inode {
                let mut meta = inode.wrlock();
                meta.freed = true;
                meta.nlink = 0;
                meta.size = 0;
            }
        });
        handle
    }

    /// Binds `name` in a directory whose write lock the caller holds as `meta`.
    fn insert_entry(
        &self,
        tx: &mut Transaction<'_>,
        dir: &InodeRef,
        meta: &mut InodeMeta,
        name: &str,
        inode: &Inode,
    ) -> FsResult<()> {
        let mut data = self.state.data.lock();
        let slots = match data.get_mut(&dir.inum()) {
            Some(InodeData::Directory { slots }) => slots,
            _ => return Err(FsError::NotADirectory),
        };
        let slot = DirSlot {
            name: name.to_string(),
            inum: inode.inum(),
            itype: inode.itype(),
        };
        match slots.iter().position(Option::is_none) {
            Some(hole) => slots[hole] = Some(slot),
            None => slots.push(Some(slot)),
        }
        meta.size = slots.len() as u64 * DIRENT_SIZE;
        tx.add_to_loghdr(LogRecord::DirAdd {
            dir: dir.inum(),
            name: name.to_string(),
            inum: inode.inum(),
        });

        let (state, dir) = (self.state.clone(), dir.clone());
        let (name, inum) = (name.to_string(), inode.inum());
        tx.on_abort(move || {
            state.with_slots(&dir, |slots| {
                let idx = slots
                    .iter()
                    .position(|s| matches!(s, Some(s) if s.name == name && s.inum == inum));
                if let Some(idx) = idx {
                    slots[idx] = None;
                }
                while matches!(slots.last(), Some(None)) {
                    slots.pop();
                }
            });
            state.forget_names();
        });
        Ok(())
    }

    fn with_file<R>(&self, inum: u32, f: impl FnOnce(&mut Vec<u8>) -> R) -> FsResult<R> {
        match self.state.data.lock().get_mut(&inum) {
            Some(InodeData::File { data }) => Ok(f(data)),
            Some(InodeData::Directory { .. }) => Err(FsError::IsADirectory),
            None => Err(FsError::NoSuchEntry),
        }
    }

    /// Registers the restore of a file to `old_size` bytes, with `saved`
    /// written back at `from`.
    fn undo_file(
        &self,
        tx: &mut Transaction<'_>,
        inode: &InodeRef,
        old_size: u64,
        from: usize,
        saved: Vec<u8>,
    ) {
        let (state, inode) = (self.state.clone(), inode.clone());
        tx.on_abort(move || {
            let mut meta = inode.wrlock();
            if meta.freed {
                return;
            }
            if let Some(InodeData::File { data }) = state.data.lock().get_mut(&inode.inum()) {
                data.resize(old_size as usize, 0);
                data[from..from + saved.len()].copy_from_slice(&saved);
            }
            meta.size = old_size;
        });
    }

    /// Adds a link to `inode`, whose write lock the caller holds as `meta`.
    fn link(&self, tx: &mut Transaction<'_>, inode: &InodeRef, meta: &mut InodeMeta) {
        meta.nlink += 1;
        let inode = inode.clone();
        tx.on_abort(move || {
            let mut meta = inode.wrlock();
            meta.nlink = meta.nlink.saturating_sub(1);
        });
    }
}

impl InodeLayer for MemLayer {
    fn dev(&self) -> u8 {
        self.dev
    }

    fn namei(&self, path: &str) -> Option<InodeRef> {
        let comps = path::components(path)?;
        let key = path::join(&comps);
        let cached = self.state.dlookup.lock().get(&key).copied();
        if let Some(inum) = cached {
            if let Some(inode) = self.iget(inum) {
                return Some(inode);
            }
        }

        let gen = self.state.dlookup_gen.load(Ordering::Acquire);
        let inode = self.walk(&comps)?;
        let mut dlookup = self.state.dlookup.lock();
        if self.state.dlookup_gen.load(Ordering::Acquire) == gen {
            dlookup.insert(key, inode.inum());
        }
        Some(inode)
    }

    fn nameiparent(&self, path: &str) -> Option<(InodeRef, String)> {
        let mut comps = path::components(path)?;
        let leaf = comps.pop()?.to_string();
        let parent = self.namei(&path::join(&comps))?;
        if !parent.is_dir() {
            return None;
        }
        Some((parent, leaf))
    }

    fn object_create(
        &self,
        tx: &mut Transaction<'_>,
        path: &str,
        itype: InodeType,
    ) -> FsResult<(InodeRef, bool)> {
        let (parent, name) = self.nameiparent(path).ok_or(FsError::NoSuchEntry)?;
        check_name(&name)?;

        let mut pmeta = parent.wrlock();
        if pmeta.freed {
            return Err(FsError::NoSuchEntry);
        }
        if let Some(inum) = self.lookup_slot(parent.inum(), &name)? {
            drop(pmeta);
            let existing = self.iget(inum).ok_or(FsError::NoSuchEntry)?;
            return Ok((existing, true));
        }

        let inode = self.ialloc(tx, parent.inum(), itype);
        self.insert_entry(tx, &parent, &mut pmeta, &name, &inode)?;
        if itype == InodeType::Dir {
            self.link(tx, &parent, &mut pmeta);
        }
        debug!("create {} as {:?}, inum {}", path, itype, inode.inum());
        Ok((inode, false))
    }

    fn dir_lookup(&self, dir: &InodeRef, name: &str) -> Option<InodeRef> {
        if !dir.is_dir() {
            return None;
        }
        let meta = dir.rdlock();
        if meta.freed {
            return None;
        }
        let inum = self.lookup_slot(dir.inum(), name).ok().flatten()?;
        drop(meta);
        self.iget(inum)
    }

    fn dir_add_entry(
        &self,
        tx: &mut Transaction<'_>,
        dir: &InodeRef,
        name: &str,
        inode: &InodeRef,
    ) -> FsResult<()> {
        check_name(name)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if dir.same_inode(inode) {
            return Err(FsError::InvalidArgument);
        }
        let mut meta = dir.wrlock();
        if meta.freed {
            return Err(FsError::NoSuchEntry);
        }
        if self.lookup_slot(dir.inum(), name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let mut child = inode.wrlock();
        if child.freed {
            return Err(FsError::NoSuchEntry);
        }
        self.insert_entry(tx, dir, &mut meta, name, inode)?;
        self.link(tx, inode, &mut child);
        Ok(())
    }

    fn dir_remove_entry(
        &self,
        tx: &mut Transaction<'_>,
        dir: &InodeRef,
        name: &str,
        inum: u32,
    ) -> FsResult<()> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }
        let meta = dir.wrlock();
        if meta.freed {
            return Err(FsError::NoSuchEntry);
        }
        let mut data = self.state.data.lock();
        let slots = match data.get_mut(&dir.inum()) {
            Some(InodeData::Directory { slots }) => slots,
            _ => return Err(FsError::NotADirectory),
        };
        let idx = slots
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.name == name && s.inum == inum))
            .ok_or(FsError::NoSuchEntry)?;
        let removed = slots[idx].take();
        tx.add_to_loghdr(LogRecord::DirRemove {
            dir: dir.inum(),
            name: name.to_string(),
            inum,
        });

        let (state, dir) = (self.state.clone(), dir.clone());
        tx.on_abort(move || {
            let slot = match removed {
                Some(slot) => slot,
                None => return,
            };
            state.with_slots(&dir, |slots| {
                if slots.iter().flatten().any(|s| s.name == slot.name) {
                    // the name was taken again meanwhile
                    return;
                }
                match slots.get_mut(idx) {
                    Some(hole @ None) => *hole = Some(slot),
                    _ => match slots.iter().position(Option::is_none) {
                        Some(hole) => slots[hole] = Some(slot),
                        None => slots.push(Some(slot)),
                    },
                }
            });
            state.forget_names();
        });
        Ok(())
    }

    fn dir_change_entry(
        &self,
        tx: &mut Transaction<'_>,
        dir: &InodeRef,
        old_name: &str,
        new_name: &str,
    ) -> FsResult<()> {
        check_name(new_name)?;
        if old_name == "." || old_name == ".." {
            return Err(FsError::InvalidArgument);
        }
        let meta = dir.wrlock();
        if meta.freed {
            return Err(FsError::NoSuchEntry);
        }
        let mut data = self.state.data.lock();
        let slots = match data.get_mut(&dir.inum()) {
            Some(InodeData::Directory { slots }) => slots,
            _ => return Err(FsError::NotADirectory),
        };
        if old_name == new_name {
            // renaming an entry onto itself changes nothing
            if slots.iter().flatten().any(|s| s.name == old_name) {
                return Ok(());
            }
            return Err(FsError::NoSuchEntry);
        }
        if slots.iter().flatten().any(|s| s.name == new_name) {
            return Err(FsError::AlreadyExists);
        }
        let slot = slots
            .iter_mut()
            .flatten()
            .find(|s| s.name == old_name)
            .ok_or(FsError::NoSuchEntry)?;
        slot.name = new_name.to_string();
        let inum = slot.inum;
        tx.add_to_loghdr(LogRecord::DirRename {
            dir: dir.inum(),
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        });

        let (state, dir) = (self.state.clone(), dir.clone());
        let (old_name, new_name) = (old_name.to_string(), new_name.to_string());
        tx.on_abort(move || {
            state.with_slots(&dir, |slots| {
                if slots.iter().flatten().any(|s| s.name == old_name) {
                    return;
                }
                if let Some(slot) = slots
                    .iter_mut()
                    .flatten()
                    .find(|s| s.name == new_name && s.inum == inum)
                {
                    slot.name = old_name;
                }
            });
            state.forget_names();
        });
        Ok(())
    }

    fn dir_is_empty(&self, dir: &InodeRef) -> bool {
        let _meta = dir.rdlock();
        match self.state.data.lock().get(&dir.inum()) {
            Some(InodeData::Directory { slots }) => slots
                .iter()
                .flatten()
                .all(|s| s.name == "." || s.name == ".."),
            _ => false,
        }
    }

    fn dir_get_entries(&self, dir: &InodeRef, buf: &mut [u8], off: &mut u64) -> FsResult<usize> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let meta = dir.rdlock();
        if meta.freed {
            return Err(FsError::NoSuchEntry);
        }
        let data = self.state.data.lock();
        let slots = match data.get(&dir.inum()) {
            Some(InodeData::Directory { slots }) => slots,
            _ => return Err(FsError::NotADirectory),
        };

        let mut idx = (*off / DIRENT_SIZE) as usize;
        let mut written = 0;
        while idx < slots.len() {
            if let Some(slot) = &slots[idx] {
                let next = (idx as u64 + 1) * DIRENT_SIZE;
                let dtype = dirent::d_type(slot.itype);
                match dirent::encode(&mut buf[written..], slot.inum as u64, next, dtype, &slot.name) {
                    Some(len) => written += len,
                    None => break,
                }
            }
            idx += 1;
        }
        if written == 0 && idx < slots.len() {
            // not even one record fits
            return Err(FsError::InvalidArgument);
        }
        *off = idx as u64 * DIRENT_SIZE;
        Ok(written)
    }

    fn idealloc(&self, tx: &mut Transaction<'_>, inode: InodeRef) -> FsResult<()> {
        let inum = inode.inum();
        let prev = {
            let mut meta = inode.wrlock();
            if meta.freed {
                return Err(FsError::NoSuchEntry);
            }
            let prev = meta.clone();
            meta.freed = true;
            meta.nlink = 0;
            meta.size = 0;
            prev
        };
        let contents = self.state.data.lock().remove(&inum);
        let cached = self.state.icache.lock().remove(&inum);
        debug!("dealloc inum {}", inum);

        let state = self.state.clone();
        tx.on_abort(move || {
            *inode.wrlock() = prev;
            if let Some(contents) = contents {
                state.data.lock().insert(inum, contents);
            }
            if let Some(cached) = cached {
                state.icache.lock().insert(inum, cached);
            }
        });
        Ok(())
    }

    fn itrunc(&self, tx: &mut Transaction<'_>, inode: &InodeRef, length: u64) -> FsResult<()> {
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if length > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge);
        }
        let mut meta = inode.wrlock();
        if meta.freed {
            return Err(FsError::NoSuchEntry);
        }
        let old_size = meta.size;
        let from = core::cmp::min(length, old_size) as usize;
        let saved = self.with_file(inode.inum(), |data| {
            let saved = data[from..].to_vec();
            data.resize(length as usize, 0);
            saved
        })?;
        meta.size = length;
        drop(meta);
        self.undo_file(tx, inode, old_size, from, saved);
        tx.add_to_loghdr(LogRecord::Truncate {
            inum: inode.inum(),
            length,
        });
        Ok(())
    }

    fn fallocate(
        &self,
        tx: &mut Transaction<'_>,
        inode: &InodeRef,
        offset: u64,
        length: u64,
    ) -> FsResult<()> {
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if length == 0 {
            return Err(FsError::InvalidArgument);
        }
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(FsError::FileTooLarge)?;
        let mut meta = inode.wrlock();
        if meta.freed {
            return Err(FsError::NoSuchEntry);
        }
        let old_size = meta.size;
        if end > old_size {
            self.with_file(inode.inum(), |data| data.resize(end as usize, 0))?;
            meta.size = end;
            drop(meta);
            self.undo_file(tx, inode, old_size, old_size as usize, Vec::new());
        }
        tx.add_to_loghdr(LogRecord::Fallocate {
            inum: inode.inum(),
            offset,
            length,
        });
        Ok(())
    }

    fn readi(&self, inode: &InodeRef, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        let meta = inode.rdlock();
        if meta.freed || offset >= meta.size {
            return Ok(0);
        }
        let n = core::cmp::min(buf.len() as u64, meta.size - offset) as usize;
        let start = offset as usize;
        self.with_file(inode.inum(), |data| {
            buf[..n].copy_from_slice(&data[start..start + n]);
            n
        })
    }

    fn writei(
        &self,
        tx: &mut Transaction<'_>,
        inode: &InodeRef,
        buf: &[u8],
        offset: u64,
    ) -> FsResult<usize> {
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(FsError::FileTooLarge)?;
        let mut meta = inode.wrlock();
        if meta.freed {
            return Err(FsError::NoSuchEntry);
        }
        let old_size = meta.size;
        let from = core::cmp::min(offset, old_size) as usize;
        let saved = self.with_file(inode.inum(), |data| {
            let saved = data[from..core::cmp::min(end, old_size) as usize].to_vec();
            if data.len() < end as usize {
                data.resize(end as usize, 0);
            }
            data[offset as usize..end as usize].copy_from_slice(buf);
            saved
        })?;
        meta.size = core::cmp::max(old_size, end);
        drop(meta);
        self.undo_file(tx, inode, old_size, from, saved);
        tx.add_to_loghdr(LogRecord::Write {
            inum: inode.inum(),
            offset,
            data: buf.to_vec(),
        });
        Ok(buf.len())
    }

    fn dlookup_del(&self, dev: u8, path: &str) {
        if dev != self.dev {
            return;
        }
        let key = match path::canonical(path) {
            Some(key) => key,
            None => return,
        };
        let prefix = if key == "/" {
            key.clone()
        } else {
            alloc::format!("{}/", key)
        };
        let mut dlookup = self.state.dlookup.lock();
        self.state.dlookup_gen.fetch_add(1, Ordering::AcqRel);
        dlookup.retain(|cached, _| *cached != key && !cached.starts_with(&prefix));
    }
}

fn check_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > DIRSIZ || name == "." || name == ".." {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}
