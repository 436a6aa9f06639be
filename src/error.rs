//! Error kinds returned by the POSIX layer and their errno mapping.

use onlyerror::Error;

pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const ENOMEM: i32 = 12;
pub const EACCES: i32 = 13;
pub const EEXIST: i32 = 17;
pub const ENOTDIR: i32 = 20;
pub const EISDIR: i32 = 21;
pub const EINVAL: i32 = 22;
pub const EFBIG: i32 = 27;
pub const ENOTEMPTY: i32 = 39;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NoSuchEntry,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("permission denied")]
    PermissionDenied,
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file too large")]
    FileTooLarge,
    #[error("log i/o error")]
    Io,
}

impl FsError {
    /// Positive errno value for this error.
    pub const fn errno(self) -> i32 {
        match self {
            FsError::NoSuchEntry => ENOENT,
            FsError::AlreadyExists => EEXIST,
            FsError::NotADirectory => ENOTDIR,
            FsError::IsADirectory => EISDIR,
            FsError::DirectoryNotEmpty => ENOTEMPTY,
            FsError::BadDescriptor => EBADF,
            FsError::PermissionDenied => EACCES,
            FsError::OutOfMemory => ENOMEM,
            FsError::InvalidArgument => EINVAL,
            FsError::FileTooLarge => EFBIG,
            FsError::Io => EIO,
        }
    }

    /// Syscall return convention: the negated errno.
    pub const fn neg_errno(self) -> i32 {
        -self.errno()
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negated_for_syscalls() {
        assert_eq!(FsError::NoSuchEntry.neg_errno(), -2);
        assert_eq!(FsError::AlreadyExists.neg_errno(), -17);
        assert_eq!(FsError::NotADirectory.neg_errno(), -20);
        assert_eq!(FsError::BadDescriptor.neg_errno(), -9);
        assert_eq!(FsError::PermissionDenied.neg_errno(), -13);
        assert_eq!(FsError::OutOfMemory.neg_errno(), -12);
        assert_eq!(FsError::InvalidArgument.neg_errno(), -22);
        assert_eq!(FsError::FileTooLarge.neg_errno(), -27);
    }

    #[test]
    fn display_messages() {
        assert_eq!(alloc::format!("{}", FsError::NoSuchEntry), "no such file or directory");
        assert_eq!(alloc::format!("{}", FsError::Io), "log i/o error");
    }
}
