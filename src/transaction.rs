//! Log transactions.
//!
//! A [`Transaction`] collects the log records produced by the inode layer
//! while a call is in flight. Nothing reaches the write-ahead log until
//! [`Transaction::commit`]; aborting, or dropping the transaction on an early
//! return, discards the records.
//!
//! The inode layer applies its mutations in place and registers an undo step
//! for each one. A transaction that aborts, is dropped unfinished, or fails
//! to reach the log replays those steps newest first, so none of its effects
//! stay visible.

use crate::error::FsResult;
use crate::operation::LogRecord;
use crate::wal::{CommittedTxn, WalEntry, WalStorage, WriteAheadLog};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

type Undo = Box<dyn FnOnce() + Send>;

pub struct Transaction<'a> {
    tm: &'a TransactionManager,
    id: u64,
    records: Vec<LogRecord>,
    undo: Vec<Undo>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Appends a record to the transaction's log header.
    pub fn add_to_loghdr(&mut self, record: LogRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Registers the step that reverts a mutation already applied.
    pub fn on_abort(&mut self, undo: impl FnOnce() + Send + 'static) {
        self.undo.push(Box::new(undo));
    }

    pub fn commit(mut self) -> FsResult<()> {
        self.finished = true;
        let records = core::mem::take(&mut self.records);
        let ret = self.tm.commit(self.id, records);
        if ret.is_err() {
            self.rollback();
        } else {
            self.undo.clear();
        }
        ret
    }

    pub fn abort(mut self) {
        self.finished = true;
        self.tm.abort(self.id, self.records.len());
        self.rollback();
    }

    fn rollback(&mut self) {
        while let Some(undo) = self.undo.pop() {
            undo();
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tm.abort(self.id, self.records.len());
            self.rollback();
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxStats {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
}

pub struct TransactionManager {
    wal: Mutex<WriteAheadLog>,
    next_txn_id: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            wal: Mutex::new(WriteAheadLog::new()),
            next_txn_id: AtomicU64::new(1),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    pub fn set_wal_storage(&self, storage: Arc<dyn WalStorage>) {
        self.wal.lock().set_storage(storage);
    }

    pub fn begin(&self) -> Transaction<'_> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        Transaction {
            tm: self,
            id,
            records: Vec::new(),
            undo: Vec::new(),
            finished: false,
        }
    }

    fn commit(&self, id: u64, records: Vec<LogRecord>) -> FsResult<()> {
        if !records.is_empty() {
            // the WAL lock serializes appends to the log tail
            let mut wal = self.wal.lock();
            if let Err(e) = wal.append_txn(id, records) {
                log::error!("tx {}: log append failed: {}", id, e);
                self.aborted.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn abort(&self, id: u64, dropped: usize) {
        log::debug!("tx {}: abort, {} records dropped", id, dropped);
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TxStats {
        TxStats {
            started: self.next_txn_id.load(Ordering::SeqCst) - 1,
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }

    /// Committed entries not yet checkpointed, oldest first.
    pub fn log_entries(&self) -> Vec<WalEntry> {
        self.wal.lock().entries().to_vec()
    }

    /// Rebuilds the committed transaction list from the log for digestion.
    pub fn recover(&self) -> FsResult<Vec<CommittedTxn>> {
        let txns = self.wal.lock().recover()?;
        log::info!("recovered {} committed transactions from the log", txns.len());
        Ok(txns)
    }

    pub fn checkpoint(&self) -> FsResult<()> {
        self.wal.lock().checkpoint()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::tests::MockStorage;

    fn truncate(inum: u32) -> LogRecord {
        LogRecord::Truncate { inum, length: 0 }
    }

    #[test]
    fn commit_reaches_the_log() {
        let tm = TransactionManager::new();
        let storage = MockStorage::new();
        tm.set_wal_storage(storage.clone());

        let mut tx = tm.begin();
        tx.add_to_loghdr(truncate(7));
        tx.commit().unwrap();

        assert!(!storage.data.lock().is_empty());
        let txns = tm.recover().unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].records, alloc::vec![truncate(7)]);
        assert_eq!(tm.stats().committed, 1);
    }

    #[test]
    fn abort_leaves_the_log_untouched() {
        let tm = TransactionManager::new();
        let storage = MockStorage::new();
        tm.set_wal_storage(storage.clone());

        let mut tx = tm.begin();
        tx.add_to_loghdr(truncate(7));
        tx.abort();

        assert!(storage.data.lock().is_empty());
        assert!(tm.log_entries().is_empty());
        assert_eq!(tm.stats(), TxStats { started: 1, committed: 0, aborted: 1 });
    }

    #[test]
    fn dropped_transaction_aborts() {
        let tm = TransactionManager::new();
        {
            let mut tx = tm.begin();
            tx.add_to_loghdr(truncate(1));
        }
        assert!(tm.log_entries().is_empty());
        assert_eq!(tm.stats().aborted, 1);
    }

    #[test]
    fn undo_runs_newest_first_on_abort() {
        let tm = TransactionManager::new();
        let trail = Arc::new(Mutex::new(Vec::new()));
        let mut tx = tm.begin();
        for step in 0..3 {
            let trail = trail.clone();
            tx.on_abort(move || trail.lock().push(step));
        }
        tx.abort();
        assert_eq!(*trail.lock(), alloc::vec![2, 1, 0]);
    }

    #[test]
    fn failed_commit_rolls_back() {
        let tm = TransactionManager::new();
        let storage = MockStorage::new();
        storage.fail_writes(true);
        tm.set_wal_storage(storage.clone());

        let reverted = Arc::new(Mutex::new(false));
        let mut tx = tm.begin();
        tx.add_to_loghdr(truncate(3));
        let flag = reverted.clone();
        tx.on_abort(move || *flag.lock() = true);
        assert_eq!(tx.commit(), Err(crate::error::FsError::Io));
        assert!(*reverted.lock());
        assert_eq!(tm.stats().committed, 0);
    }

    #[test]
    fn committed_undo_is_discarded() {
        let tm = TransactionManager::new();
        let reverted = Arc::new(Mutex::new(false));
        let mut tx = tm.begin();
        let flag = reverted.clone();
        tx.on_abort(move || *flag.lock() = true);
        tx.commit().unwrap();
        assert!(!*reverted.lock());
    }

    #[test]
    fn ids_are_unique() {
        let tm = TransactionManager::new();
        let a = tm.begin();
        let b = tm.begin();
        assert_ne!(a.id(), b.id());
        a.abort();
        b.commit().unwrap();
    }
}
