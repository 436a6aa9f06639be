use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::inode::InodeType;

/// Size of the on-log inode image carried by an unlink record.
pub const DINODE_SIZE: u32 = 128;

/// One logged metadata or data mutation, replayed by the digest side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    InodeAlloc {
        inum: u32,
        itype: InodeType,
    },
    DirAdd {
        dir: u32,
        name: String,
        inum: u32,
    },
    DirRemove {
        dir: u32,
        name: String,
        inum: u32,
    },
    DirRename {
        dir: u32,
        old_name: String,
        new_name: String,
    },
    Write {
        inum: u32,
        offset: u64,
        data: Vec<u8>,
    },
    Truncate {
        inum: u32,
        length: u64,
    },
    Fallocate {
        inum: u32,
        offset: u64,
        length: u64,
    },
    /// The inode was deallocated; `size` is the length of the inode image
    /// the digest side has to clear.
    Unlink {
        dev: u8,
        inum: u32,
        size: u32,
    },
}

impl LogRecord {
    /// Inode this record is about.
    pub fn inum(&self) -> u32 {
        match self {
            LogRecord::InodeAlloc { inum, .. }
            | LogRecord::Write { inum, .. }
            | LogRecord::Truncate { inum, .. }
            | LogRecord::Fallocate { inum, .. }
            | LogRecord::Unlink { inum, .. } => *inum,
            LogRecord::DirAdd { dir, .. }
            | LogRecord::DirRemove { dir, .. }
            | LogRecord::DirRename { dir, .. } => *dir,
        }
    }
}
