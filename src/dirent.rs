//! `linux_dirent64` records as produced by `getdents`.

use alloc::string::String;

use crate::inode::InodeType;

pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;

/// d_ino + d_off + d_reclen + d_type
const HEADER: usize = 8 + 8 + 2 + 1;

pub fn d_type(itype: InodeType) -> u8 {
    match itype {
        InodeType::Dir => DT_DIR,
        InodeType::File => DT_REG,
    }
}

/// Record length for `name`, NUL included, padded to 8 bytes.
pub fn reclen(name: &str) -> usize {
    (HEADER + name.len() + 1 + 7) & !7
}

/// Writes one record at the start of `buf`. Returns the bytes used, or
/// `None` when the record does not fit.
pub fn encode(buf: &mut [u8], ino: u64, next_off: u64, dtype: u8, name: &str) -> Option<usize> {
    let len = reclen(name);
    if buf.len() < len {
        return None;
    }
    let rec = &mut buf[..len];
    rec.fill(0);
    rec[0..8].copy_from_slice(&ino.to_ne_bytes());
    rec[8..16].copy_from_slice(&(next_off as i64).to_ne_bytes());
    rec[16..18].copy_from_slice(&(len as u16).to_ne_bytes());
    rec[18] = dtype;
    rec[HEADER..HEADER + name.len()].copy_from_slice(name.as_bytes());
    Some(len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirentView {
    pub ino: u64,
    pub next_off: u64,
    pub dtype: u8,
    pub name: String,
}

/// Walks the records of a filled `getdents` buffer.
pub struct DirentIter<'a> {
    buf: &'a [u8],
}

impl<'a> DirentIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl Iterator for DirentIter<'_> {
    type Item = DirentView;

    fn next(&mut self) -> Option<DirentView> {
        if self.buf.len() < HEADER {
            return None;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.buf[0..8]);
        let ino = u64::from_ne_bytes(word);
        word.copy_from_slice(&self.buf[8..16]);
        let next_off = i64::from_ne_bytes(word) as u64;
        let len = u16::from_ne_bytes([self.buf[16], self.buf[17]]) as usize;
        if len < HEADER || len > self.buf.len() {
            return None;
        }
        let raw = &self.buf[HEADER..len];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let name = String::from_utf8_lossy(&raw[..end]).into_owned();
        let view = DirentView {
            ino,
            next_off,
            dtype: self.buf[18],
            name,
        };
        self.buf = &self.buf[len..];
        Some(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn records_are_aligned() {
        assert_eq!(reclen("a"), 24);
        assert_eq!(reclen("abcd"), 24);
        assert_eq!(reclen("abcde"), 32);
    }

    #[test]
    fn too_small_buffer_is_refused() {
        let mut buf = [0u8; 16];
        assert_eq!(encode(&mut buf, 1, 32, DT_REG, "x"), None);
    }

    #[test]
    fn iterates_encoded_records() {
        let mut buf = [0u8; 128];
        let a = encode(&mut buf, 1, 32, DT_DIR, ".").unwrap();
        let b = encode(&mut buf[a..], 7, 64, DT_REG, "notes.txt").unwrap();
        let views: Vec<_> = DirentIter::new(&buf[..a + b]).collect();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].name, ".");
        assert_eq!(views[1].ino, 7);
        assert_eq!(views[1].dtype, DT_REG);
        assert_eq!(views[1].next_off, 64);
    }
}
