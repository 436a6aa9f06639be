use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::operation::LogRecord;

/// Frames larger than this are treated as garbage during recovery.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
const FRAME_HEADER: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    Record { txn_id: u64, record: LogRecord },
    Commit { txn_id: u64 },
}

/// A transaction whose commit marker reached the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTxn {
    pub txn_id: u64,
    pub records: Vec<LogRecord>,
}

pub trait WalStorage: Send + Sync {
    fn write(&self, offset: u64, data: &[u8]) -> FsResult<()>;
    fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<()>;
    fn truncate(&self, length: u64) -> FsResult<()>;
    fn flush(&self) -> FsResult<()>;
}

pub struct WriteAheadLog {
    entries: Vec<WalEntry>,
    storage: Option<Arc<dyn WalStorage>>,
    next_offset: u64,
}

impl WriteAheadLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            storage: None,
            next_offset: 0,
        }
    }

    pub fn set_storage(&mut self, storage: Arc<dyn WalStorage>) {
        self.storage = Some(storage);
    }

    /// Appends every record of a transaction, flushes, then appends the
    /// commit marker and flushes again. A transaction is durable once the
    /// marker is on storage; on any failure the tail is cut back to where the
    /// transaction started.
    pub fn append_txn(&mut self, txn_id: u64, records: Vec<LogRecord>) -> FsResult<()> {
        let start = self.next_offset;
        let mut staged = Vec::with_capacity(records.len() + 1);
        for record in records {
            staged.push(WalEntry::Record { txn_id, record });
        }
        staged.push(WalEntry::Commit { txn_id });

        if let Err(e) = self.write_staged(&staged) {
            self.rewind(start);
            return Err(e);
        }
        self.entries.extend(staged);
        Ok(())
    }

    fn write_staged(&mut self, staged: &[WalEntry]) -> FsResult<()> {
        let (marker, records) = match staged.split_last() {
            Some(split) => split,
            None => return Ok(()),
        };
        for entry in records {
            self.write_frame(entry)?;
        }
        self.flush()?;
        self.write_frame(marker)?;
        self.flush()
    }

    fn flush(&self) -> FsResult<()> {
        match self.storage {
            Some(ref storage) => storage.flush(),
            None => Ok(()),
        }
    }

    fn rewind(&mut self, start: u64) {
        self.next_offset = start;
        if let Some(ref storage) = self.storage {
            if let Err(e) = storage.truncate(start) {
                log::error!("wal: cannot cut failed tail at {}: {}", start, e);
            }
        }
    }

    // Format: [size: u32] [crc32: u32] [data]
    fn write_frame(&mut self, entry: &WalEntry) -> FsResult<()> {
        let storage = match self.storage {
            Some(ref storage) => storage,
            None => return Ok(()),
        };
        let data = serde_json::to_vec(entry).map_err(|e| {
            log::error!("wal: cannot encode entry: {}", e);
            FsError::Io
        })?;
        let size = u32::try_from(data.len()).map_err(|_| FsError::Io)?;

        let mut header = [0u8; FRAME_HEADER as usize];
        header[..4].copy_from_slice(&size.to_le_bytes());
        header[4..].copy_from_slice(&crc32(&data).to_le_bytes());
        storage.write(self.next_offset, &header)?;
        storage.write(self.next_offset + FRAME_HEADER, &data)?;
        self.next_offset += FRAME_HEADER + data.len() as u64;
        Ok(())
    }

    /// Reads the log back and returns the committed transactions in commit
    /// order. Scanning stops at the first torn or corrupt frame; records of
    /// transactions without a commit marker are discarded.
    pub fn recover(&mut self) -> FsResult<Vec<CommittedTxn>> {
        let entries = match self.storage {
            Some(ref storage) => {
                let (entries, end) = scan(storage.as_ref());
                self.next_offset = end;
                entries
            }
            None => self.entries.clone(),
        };
        self.entries = entries;

        let mut open: BTreeMap<u64, Vec<LogRecord>> = BTreeMap::new();
        let mut committed = Vec::new();
        for entry in &self.entries {
            match entry {
                WalEntry::Record { txn_id, record } => {
                    open.entry(*txn_id).or_default().push(record.clone());
                }
                WalEntry::Commit { txn_id } => committed.push(CommittedTxn {
                    txn_id: *txn_id,
                    records: open.remove(txn_id).unwrap_or_default(),
                }),
            }
        }
        if !open.is_empty() {
            log::warn!("wal: discarding {} uncommitted transactions", open.len());
        }
        Ok(committed)
    }

    pub fn entries(&self) -> &[WalEntry] {
        &self.entries
    }

    pub fn checkpoint(&mut self) -> FsResult<()> {
        if let Some(ref storage) = self.storage {
            storage.truncate(0)?;
        }
        self.next_offset = 0;
        self.entries.clear();
        Ok(())
    }
}

impl Default for WriteAheadLog {
    fn default() -> Self {
        Self::new()
    }
}

fn scan(storage: &dyn WalStorage) -> (Vec<WalEntry>, u64) {
    let mut entries = Vec::new();
    let mut offset = 0;
    loop {
        let mut header = [0u8; FRAME_HEADER as usize];
        if storage.read(offset, &mut header).is_err() {
            break;
        }
        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if size == 0 || size > MAX_FRAME_SIZE {
            break;
        }
        let mut data = alloc::vec![0u8; size as usize];
        if storage.read(offset + FRAME_HEADER, &mut data).is_err() || crc32(&data) != crc {
            log::warn!("wal: torn frame at offset {}", offset);
            break;
        }
        match serde_json::from_slice::<WalEntry>(&data) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        offset += FRAME_HEADER + size as u64;
    }
    (entries, offset)
}

/// CRC-32 (IEEE) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFFFFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::string::ToString;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Mutex;

    pub(crate) struct MockStorage {
        pub(crate) data: Mutex<Vec<u8>>,
        fail_writes: AtomicBool,
        fail_flush: AtomicBool,
    }

    impl MockStorage {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
                fail_flush: AtomicBool::new(false),
            })
        }

        pub(crate) fn fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn fail_flush(&self, fail: bool) {
            self.fail_flush.store(fail, Ordering::SeqCst);
        }
    }

    impl WalStorage for MockStorage {
        fn write(&self, offset: u64, data: &[u8]) -> FsResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(FsError::Io);
            }
            let mut storage = self.data.lock();
            let end = offset as usize + data.len();
            if end > storage.len() {
                storage.resize(end, 0);
            }
            storage[offset as usize..end].copy_from_slice(data);
            Ok(())
        }
        fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
            let storage = self.data.lock();
            if offset as usize + buf.len() > storage.len() {
                return Err(FsError::Io);
            }
            buf.copy_from_slice(&storage[offset as usize..offset as usize + buf.len()]);
            Ok(())
        }
        fn truncate(&self, length: u64) -> FsResult<()> {
            self.data.lock().truncate(length as usize);
            Ok(())
        }
        fn flush(&self) -> FsResult<()> {
            if self.fail_flush.load(Ordering::SeqCst) {
                return Err(FsError::Io);
            }
            Ok(())
        }
    }

    fn rename_record() -> LogRecord {
        LogRecord::DirRename {
            dir: 1,
            old_name: "a".to_string(),
            new_name: "b".to_string(),
        }
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn committed_transactions_survive_reopen() {
        let storage = MockStorage::new();
        let mut wal = WriteAheadLog::new();
        wal.set_storage(storage.clone());
        wal.append_txn(1, alloc::vec![rename_record()]).unwrap();
        wal.append_txn(2, alloc::vec![LogRecord::Truncate { inum: 3, length: 0 }])
            .unwrap();

        let mut reopened = WriteAheadLog::new();
        reopened.set_storage(storage);
        let txns = reopened.recover().unwrap();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].txn_id, 1);
        assert_eq!(txns[0].records, alloc::vec![rename_record()]);
        assert_eq!(txns[1].records[0].inum(), 3);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let storage = MockStorage::new();
        let mut wal = WriteAheadLog::new();
        wal.set_storage(storage.clone());
        wal.append_txn(1, alloc::vec![rename_record()]).unwrap();
        let intact = storage.data.lock().len();
        wal.append_txn(2, alloc::vec![rename_record()]).unwrap();

        // lose the tail of the second transaction's commit frame
        let full = storage.data.lock().len();
        storage.data.lock().truncate(full - 3);

        let mut reopened = WriteAheadLog::new();
        reopened.set_storage(storage.clone());
        let txns = reopened.recover().unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].txn_id, 1);
        assert!(intact < full);
    }

    #[test]
    fn corrupt_frame_stops_the_scan() {
        let storage = MockStorage::new();
        let mut wal = WriteAheadLog::new();
        wal.set_storage(storage.clone());
        wal.append_txn(1, alloc::vec![rename_record()]).unwrap();
        // flip a payload byte of the first frame
        storage.data.lock()[10] ^= 0xff;

        let mut reopened = WriteAheadLog::new();
        reopened.set_storage(storage);
        assert!(reopened.recover().unwrap().is_empty());
    }

    #[test]
    fn failed_flush_leaves_no_commit_marker() {
        let storage = MockStorage::new();
        let mut wal = WriteAheadLog::new();
        wal.set_storage(storage.clone());
        wal.append_txn(1, alloc::vec![rename_record()]).unwrap();
        let intact = storage.data.lock().len();

        storage.fail_flush(true);
        assert_eq!(
            wal.append_txn(2, alloc::vec![LogRecord::Truncate { inum: 3, length: 0 }]),
            Err(FsError::Io)
        );
        assert_eq!(storage.data.lock().len(), intact);
        assert_eq!(wal.entries().len(), 2);

        storage.fail_flush(false);
        let mut reopened = WriteAheadLog::new();
        reopened.set_storage(storage.clone());
        let txns = reopened.recover().unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].txn_id, 1);

        // the next append lands where the failed one started
        wal.append_txn(3, alloc::vec![rename_record()]).unwrap();
        let mut again = WriteAheadLog::new();
        again.set_storage(storage);
        let ids: Vec<_> = again.recover().unwrap().iter().map(|t| t.txn_id).collect();
        assert_eq!(ids, alloc::vec![1, 3]);
    }

    #[test]
    fn failed_write_rewinds_the_tail() {
        let storage = MockStorage::new();
        let mut wal = WriteAheadLog::new();
        wal.set_storage(storage.clone());
        storage.fail_writes(true);
        assert_eq!(wal.append_txn(1, alloc::vec![rename_record()]), Err(FsError::Io));
        assert!(wal.entries().is_empty());
        storage.fail_writes(false);
        assert!(storage.data.lock().is_empty());
    }

    #[test]
    fn checkpoint_truncates() {
        let storage = MockStorage::new();
        let mut wal = WriteAheadLog::new();
        wal.set_storage(storage.clone());
        wal.append_txn(1, alloc::vec![rename_record()]).unwrap();
        wal.checkpoint().unwrap();
        assert!(storage.data.lock().is_empty());
        assert!(wal.entries().is_empty());
        assert!(wal.recover().unwrap().is_empty());
    }
}
