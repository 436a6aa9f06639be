use bitflags::bitflags;

use crate::error::FsError;

bitflags! {
    /// `open(2)` flags, Linux values. Bits this layer does not understand are
    /// dropped by `from_bits_truncate`.
    #[derive(Default)]
    pub struct OpenFlags: i32 {
        const O_RDONLY = 0o0;
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_CREAT = 0o100;
        const O_EXCL = 0o200;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_DIRECTORY = 0o200000;
    }
}

impl OpenFlags {
    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::O_WRONLY)
    }

    pub fn writable(&self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

/// `access(2)` existence check, the only mode supported.
pub const F_OK: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl TryFrom<i32> for Whence {
    type Error = FsError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(FsError::InvalidArgument),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcntlCmd {
    GetFd,
    SetFd,
    GetFl,
    SetFl,
    GetLk,
    SetLk,
    SetLkw,
    Other(i32),
}

impl FcntlCmd {
    pub fn from_raw(cmd: i32) -> Self {
        match cmd {
            1 => FcntlCmd::GetFd,
            2 => FcntlCmd::SetFd,
            3 => FcntlCmd::GetFl,
            4 => FcntlCmd::SetFl,
            5 => FcntlCmd::GetLk,
            6 => FcntlCmd::SetLk,
            7 => FcntlCmd::SetLkw,
            other => FcntlCmd::Other(other),
        }
    }

    pub fn is_lock(&self) -> bool {
        matches!(self, FcntlCmd::GetLk | FcntlCmd::SetLk | FcntlCmd::SetLkw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_bits() {
        let ro = OpenFlags::from_bits_truncate(0);
        assert!(ro.readable() && !ro.writable());

        let wo = OpenFlags::from_bits_truncate(0o1);
        assert!(!wo.readable() && wo.writable());

        let rw = OpenFlags::from_bits_truncate(0o2 | 0o100);
        assert!(rw.readable() && rw.writable());
        assert!(rw.contains(OpenFlags::O_CREAT));
    }

    #[test]
    fn unknown_bits_are_dropped() {
        // O_CLOEXEC and O_NONBLOCK
        let flags = OpenFlags::from_bits_truncate(0o2000000 | 0o4000 | 0o2);
        assert_eq!(flags, OpenFlags::O_RDWR);
    }

    #[test]
    fn whence_decoding() {
        assert_eq!(Whence::try_from(2), Ok(Whence::End));
        assert_eq!(Whence::try_from(3), Err(FsError::InvalidArgument));
        assert_eq!(Whence::try_from(-1), Err(FsError::InvalidArgument));
    }
}
