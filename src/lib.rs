#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod config;
pub mod cwd;
pub mod dirent;
pub mod error;
pub mod file;
pub mod flags;
pub mod inode;
pub mod memfs;
pub mod operation;
pub mod path;
pub mod posix;
pub mod syscall;
pub mod transaction;
pub mod wal;


pub use config::FsConfig;
pub use error::{FsError, FsResult};
pub use file::Fd;
pub use flags::{FcntlCmd, OpenFlags, Whence};
pub use inode::{InodeLayer, InodeRef, InodeType, Stat};
pub use memfs::{MemLayer, DIRENT_SIZE};
pub use posix::PosixFs;
pub use transaction::{Transaction, TransactionManager};

/// Capacity of the file descriptor table.
pub const NR_OPEN_FILES: usize = 1024;
/// Added to table indices so descriptors never collide with the host kernel's.
pub const FD_START: i32 = 1_000_000;
pub const MAX_PATH: usize = 4096;
/// Longest directory entry name.
pub const DIRSIZ: usize = 28;
