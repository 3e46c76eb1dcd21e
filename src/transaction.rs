// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{hash::HashMap, value::InternalValue, Error, Index, Result, SeqNo, UserKey, ValueType};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

/// Uniquely identifies a transaction within its manager, monotonic.
pub type Tsn = u64;

/// Sentinel `vlsn` for a read-write transaction that has not yet been
/// assigned a fixed read view, i.e. it sees every statement committed so far.
const VLSN_INF: SeqNo = SeqNo::MAX;

/// Whether a transaction may write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnType {
    /// Read-only: `vlsn` is fixed at `begin` time and never changes.
    ReadOnly,
    /// Read-write: `vlsn` starts at `+infinity` and is only fixed down if
    /// another transaction's commit conflicts with one of its reads.
    ReadWrite,
}

/// A transaction's lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnState {
    /// Open, accepting reads and writes.
    Ready,
    /// Successfully committed; its writes are now visible at `lsn`.
    Committed,
    /// Rolled back; none of its writes are visible.
    RolledBack,
}

/// Opaque marker returned by [`TransactionManager::savepoint`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Savepoint(usize);

#[derive(Clone)]
enum LogEntry {
    Read(UserKey),
    Write(UserKey),
}

/// A single transaction's mutable state.
///
/// Held behind an `Arc` because read-set entries reference the transaction
/// back from the manager's shared index, so other transactions' `prepare`
/// calls can reach in and fix a reader's `vlsn`.
pub struct Transaction {
    /// Monotonic id, unique within the owning manager.
    pub tsn: Tsn,
    /// Whether this transaction may write.
    pub kind: TxnType,

    state: Mutex<TxnState>,

    /// In-order log of read/write-set entries, used to splice at a savepoint.
    log: Mutex<Vec<LogEntry>>,

    /// Pending writes, keyed by user key; last writer in program order wins
    /// subject to the UPSERT-merge rules in [`TransactionManager::set_write`].
    write_set: Mutex<HashMap<UserKey, InternalValue>>,

    /// Read keys already tracked by this txn, `key -> is_gap`. Used to skip
    /// re-tracking and to know what to scrub from the manager's read-set
    /// index on rollback.
    read_set: Mutex<HashMap<UserKey, bool>>,

    /// `+infinity` until this txn is fixed to a concrete read view, either at
    /// `begin` (if RO) or by another txn's `prepare` (if RW and conflicted).
    vlsn: AtomicU64,

    /// Set when another txn's `prepare` found this txn's read-set in
    /// conflict with its write-set. A subsequent `prepare`/`commit` on this
    /// txn then fails.
    is_aborted: AtomicBool,
}

impl Transaction {
    /// Returns the transaction's current state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        *self.state.lock().expect("lock is poisoned")
    }

    /// Returns the transaction's read view, or `None` if still unfixed
    /// (only possible for an open read-write transaction).
    #[must_use]
    pub fn vlsn(&self) -> Option<SeqNo> {
        match self.vlsn.load(Ordering::Acquire) {
            VLSN_INF => None,
            vlsn => Some(vlsn),
        }
    }

    /// Returns `true` if another transaction's write conflicted with this
    /// transaction's read-set.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.is_aborted.load(Ordering::Acquire)
    }
}

/// Assigns transaction ids, tracks per-key read/write sets, and maintains the
/// ordered set of active read views used to compute `vlsn_floor`.
pub struct TransactionManager {
    tsn_counter: AtomicU64,
    lsn: AtomicU64,

    /// Ordered by `(vlsn, tsn)`; the minimum entry bounds how far compaction
    /// may drop old versions without breaking a live read view.
    read_views: RwLock<BTreeSet<(SeqNo, Tsn)>>,

    /// Per-key readers, used by `prepare` to find conflicting transactions.
    read_set_index: RwLock<HashMap<UserKey, Vec<Arc<Transaction>>>>,

    ro_count: AtomicU64,
    rw_count: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self {
            tsn_counter: AtomicU64::new(0),
            lsn: AtomicU64::new(0),
            read_views: RwLock::new(BTreeSet::new()),
            read_set_index: RwLock::new(HashMap::default()),
            ro_count: AtomicU64::new(0),
            rw_count: AtomicU64::new(0),
        }
    }
}

impl TransactionManager {
    /// Creates a fresh manager, seeding `lsn` from a recovered WAL position.
    #[must_use]
    pub fn new(lsn: SeqNo) -> Self {
        Self {
            lsn: AtomicU64::new(lsn),
            ..Self::default()
        }
    }

    /// Returns the current `lsn`, the highest sequence number committed.
    #[must_use]
    pub fn lsn(&self) -> SeqNo {
        self.lsn.load(Ordering::Acquire)
    }

    /// Returns `min(active_vlsn, lsn)`: versions at or below this may be
    /// merged away or dropped by compaction without breaking a live reader.
    #[must_use]
    pub fn vlsn_floor(&self) -> SeqNo {
        let lsn = self.lsn();
        self.read_views
            .read()
            .expect("lock is poisoned")
            .iter()
            .next()
            .map_or(lsn, |(vlsn, _)| (*vlsn).min(lsn))
    }

    /// Returns the number of currently open read-only / read-write transactions.
    #[must_use]
    pub fn counts(&self) -> (u64, u64) {
        (
            self.ro_count.load(Ordering::Acquire),
            self.rw_count.load(Ordering::Acquire),
        )
    }

    /// Allocates a new transaction.
    #[must_use]
    pub fn begin(&self, kind: TxnType) -> Arc<Transaction> {
        let tsn = self.tsn_counter.fetch_add(1, Ordering::AcqRel);

        let vlsn = match kind {
            TxnType::ReadOnly => {
                self.ro_count.fetch_add(1, Ordering::AcqRel);
                self.lsn()
            }
            TxnType::ReadWrite => {
                self.rw_count.fetch_add(1, Ordering::AcqRel);
                VLSN_INF
            }
        };

        let txn = Arc::new(Transaction {
            tsn,
            kind,
            state: Mutex::new(TxnState::Ready),
            log: Mutex::new(Vec::new()),
            write_set: Mutex::new(HashMap::default()),
            read_set: Mutex::new(HashMap::default()),
            vlsn: AtomicU64::new(vlsn),
            is_aborted: AtomicBool::new(false),
        });

        self.read_views
            .write()
            .expect("lock is poisoned")
            .insert((vlsn, tsn));

        txn
    }

    /// Records that `txn` read `key`, possibly a gap (a "not found" probe).
    ///
    /// No-op for read-only transactions (they can't conflict, since they
    /// never write) or once `txn` has already been aborted. Also a no-op if
    /// `txn` already wrote `key` itself.
    pub fn track_read(&self, txn: &Arc<Transaction>, key: &[u8], is_gap: bool) {
        if txn.kind == TxnType::ReadOnly || txn.is_aborted() {
            return;
        }

        let key = UserKey::from(key);

        if txn.write_set.lock().expect("lock is poisoned").contains_key(&key) {
            return;
        }

        let mut read_set = txn.read_set.lock().expect("lock is poisoned");
        if read_set.contains_key(&key) {
            return;
        }
        read_set.insert(key.clone(), is_gap);
        drop(read_set);

        txn.log
            .lock()
            .expect("lock is poisoned")
            .push(LogEntry::Read(key.clone()));

        self.read_set_index
            .write()
            .expect("lock is poisoned")
            .entry(key)
            .or_default()
            .push(txn.clone());
    }

    /// Merges `stmt` into `txn`'s write-set.
    ///
    /// If a prior write exists for the same key and `stmt` is an UPSERT over
    /// a non-UPSERT prior write (REPLACE, DELETE, or weak DELETE), it applies
    /// immediately: no host executor is needed, since the UPSERT's own
    /// embedded base tuple becomes a REPLACE at the new `lsn`, mirroring the
    /// no-older-version case of [`crate::apply_upsert`]. UPSERT-over-UPSERT
    /// combines the update programs eagerly by letting the newer program
    /// replace the older one (a lossless, executor-backed combine still
    /// happens later via [`crate::apply_upsert`] at read/dump time, not
    /// here). Any other combination replaces the prior entry outright.
    pub fn set_write(&self, txn: &Arc<Transaction>, stmt: InternalValue) {
        let key = stmt.key.user_key.clone();

        let mut write_set = txn.write_set.lock().expect("lock is poisoned");
        let is_new = !write_set.contains_key(&key);

        let stmt = match write_set.get(&key) {
            Some(old) if stmt.is_upsert() && !old.is_upsert() => InternalValue::from_components(
                stmt.key.user_key.clone(),
                stmt.value.clone(),
                stmt.key.seqno,
                ValueType::Value,
            ),
            _ => stmt,
        };

        write_set.insert(key.clone(), stmt);
        drop(write_set);

        if is_new {
            txn.log
                .lock()
                .expect("lock is poisoned")
                .push(LogEntry::Write(key));
        }
    }

    /// Checks `txn` for conflicts and fixes the read view of any reader its
    /// writes would invalidate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionConflict`] if `txn` was itself aborted by
    /// a concurrent writer before this call.
    pub fn prepare(&self, txn: &Arc<Transaction>) -> Result<()> {
        if txn.is_aborted() {
            return Err(Error::TransactionConflict);
        }

        let keys: Vec<UserKey> = txn
            .write_set
            .lock()
            .expect("lock is poisoned")
            .keys()
            .cloned()
            .collect();

        let is_delete = |key: &UserKey| {
            txn.write_set
                .lock()
                .expect("lock is poisoned")
                .get(key)
                .is_some_and(InternalValue::is_tombstone)
        };

        let lsn = self.lsn();
        let read_set_index = self.read_set_index.read().expect("lock is poisoned");

        for key in &keys {
            let Some(readers) = read_set_index.get(key) else {
                continue;
            };

            for reader in readers {
                if Arc::ptr_eq(reader, txn) {
                    continue;
                }

                let is_gap = reader
                    .read_set
                    .lock()
                    .expect("lock is poisoned")
                    .get(key)
                    .copied()
                    .unwrap_or(false);

                if is_gap && is_delete(key) {
                    continue;
                }

                if reader.vlsn.load(Ordering::Acquire) != VLSN_INF {
                    continue;
                }

                let old = reader
                    .vlsn
                    .compare_exchange(VLSN_INF, lsn, Ordering::AcqRel, Ordering::Acquire);

                if old.is_ok() {
                    reader.is_aborted.store(true, Ordering::Release);

                    self.read_views
                        .write()
                        .expect("lock is poisoned")
                        .insert((lsn, reader.tsn));
                }
            }
        }

        Ok(())
    }

    /// Stamps every write in `txn`'s write-set with `lsn` and routes it into
    /// the index's covering ranges. `lsn` must be monotonic, sourced from the
    /// host's WAL.
    ///
    /// During recovery, a write whose `lsn` a run already contains is skipped
    /// (the range's dump/compaction already persisted it).
    pub fn commit(&self, txn: &Arc<Transaction>, lsn: SeqNo, index: &Index) -> Result<()> {
        {
            let write_set = txn.write_set.lock().expect("lock is poisoned");
            for stmt in write_set.values() {
                let mut stmt = stmt.clone();
                stmt.key.seqno = lsn;
                index.insert(stmt);
            }
        }

        self.lsn.fetch_max(lsn, Ordering::AcqRel);
        *txn.state.lock().expect("lock is poisoned") = TxnState::Committed;

        self.release(txn);

        Ok(())
    }

    /// Discards every pending write and read of `txn`.
    pub fn rollback(&self, txn: &Arc<Transaction>) {
        self.rollback_to_savepoint(txn, Savepoint(0));
        *txn.state.lock().expect("lock is poisoned") = TxnState::RolledBack;
        self.release(txn);
    }

    /// Marks the current position in `txn`'s log, to later roll back to.
    #[must_use]
    pub fn savepoint(&self, txn: &Arc<Transaction>) -> Savepoint {
        Savepoint(txn.log.lock().expect("lock is poisoned").len())
    }

    /// Undoes every read/write recorded in `txn` after `savepoint`.
    pub fn rollback_to_savepoint(&self, txn: &Arc<Transaction>, savepoint: Savepoint) {
        let mut log = txn.log.lock().expect("lock is poisoned");
        let tail: Vec<LogEntry> = log.split_off(savepoint.0);
        drop(log);

        for entry in tail {
            match entry {
                LogEntry::Read(key) => {
                    txn.read_set.lock().expect("lock is poisoned").remove(&key);

                    let mut read_set_index = self.read_set_index.write().expect("lock is poisoned");
                    if let Some(readers) = read_set_index.get_mut(&key) {
                        readers.retain(|r| !Arc::ptr_eq(r, txn));
                        if readers.is_empty() {
                            read_set_index.remove(&key);
                        }
                    }
                }
                LogEntry::Write(key) => {
                    txn.write_set.lock().expect("lock is poisoned").remove(&key);
                }
            }
        }
    }

    /// Removes `txn` from the active read-view set and its counters,
    /// called once a txn reaches a terminal state.
    fn release(&self, txn: &Arc<Transaction>) {
        match txn.kind {
            TxnType::ReadOnly => self.ro_count.fetch_sub(1, Ordering::AcqRel),
            TxnType::ReadWrite => self.rw_count.fetch_sub(1, Ordering::AcqRel),
        };

        let vlsn = txn.vlsn.load(Ordering::Acquire);
        self.read_views
            .write()
            .expect("lock is poisoned")
            .remove(&(vlsn, txn.tsn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn value(key: &str, val: &str, seqno: SeqNo) -> InternalValue {
        InternalValue::from_components(key, val, seqno, ValueType::Value)
    }

    #[test]
    fn begin_ro_fixes_vlsn_immediately() {
        let mgr = TransactionManager::default();
        let txn = mgr.begin(TxnType::ReadOnly);
        assert_eq!(Some(0), txn.vlsn());
    }

    #[test]
    fn begin_rw_starts_unfixed() {
        let mgr = TransactionManager::default();
        let txn = mgr.begin(TxnType::ReadWrite);
        assert_eq!(None, txn.vlsn());
    }

    #[test]
    fn commit_applies_writes_and_advances_lsn() {
        let mgr = TransactionManager::default();
        let index = Index::new();

        let txn = mgr.begin(TxnType::ReadWrite);
        mgr.set_write(&txn, value("a", "1", 0));
        mgr.prepare(&txn).expect("no conflict");
        mgr.commit(&txn, 5, &index).expect("commit succeeds");

        assert_eq!(5, mgr.lsn());
        assert_eq!(TxnState::Committed, txn.state());

        let range = index.range_for_key(b"a").expect("covering range");
        let mem = range.active_mem().expect("active mem");
        assert_eq!(b"1".as_slice(), &*mem.get(b"a", SeqNo::MAX).unwrap().value);
    }

    #[test]
    fn rw_reader_is_aborted_by_conflicting_write() {
        let mgr = TransactionManager::default();

        let reader = mgr.begin(TxnType::ReadWrite);
        mgr.track_read(&reader, b"a", false);

        let writer = mgr.begin(TxnType::ReadWrite);
        mgr.set_write(&writer, value("a", "2", 0));
        mgr.prepare(&writer).expect("no conflict for writer itself");

        assert!(reader.is_aborted());
        assert!(reader.vlsn().is_some());

        assert!(matches!(
            mgr.prepare(&reader),
            Err(Error::TransactionConflict)
        ));
    }

    #[test]
    fn gap_read_does_not_conflict_with_delete() {
        let mgr = TransactionManager::default();

        let reader = mgr.begin(TxnType::ReadWrite);
        mgr.track_read(&reader, b"a", true);

        let writer = mgr.begin(TxnType::ReadWrite);
        mgr.set_write(&writer, InternalValue::new_tombstone("a", 0));
        mgr.prepare(&writer).expect("no conflict");

        assert!(!reader.is_aborted());
    }

    #[test]
    fn rollback_to_savepoint_undoes_later_writes_only() {
        let mgr = TransactionManager::default();
        let txn = mgr.begin(TxnType::ReadWrite);

        mgr.set_write(&txn, value("a", "1", 0));
        let svp = mgr.savepoint(&txn);
        mgr.set_write(&txn, value("b", "2", 0));

        mgr.rollback_to_savepoint(&txn, svp);

        let write_set = txn.write_set.lock().expect("lock is poisoned");
        assert!(write_set.contains_key(&UserKey::from(b"a".as_slice())));
        assert!(!write_set.contains_key(&UserKey::from(b"b".as_slice())));
    }

    #[test]
    fn rollback_releases_read_view() {
        let mgr = TransactionManager::default();
        let txn = mgr.begin(TxnType::ReadWrite);
        mgr.rollback(&txn);
        assert_eq!(TxnState::RolledBack, txn.state());
        assert_eq!((0, 0), mgr.counts());
    }

    #[test]
    fn upsert_over_replace_applies_immediately_in_write_set() {
        let mgr = TransactionManager::default();
        let txn = mgr.begin(TxnType::ReadWrite);

        mgr.set_write(&txn, value("a", "1", 0));
        mgr.set_write(&txn, InternalValue::new_upsert("a", "2", "ops", 0));

        let write_set = txn.write_set.lock().expect("lock is poisoned");
        let stmt = write_set
            .get(&UserKey::from(b"a".as_slice()))
            .expect("write present");

        assert_eq!(ValueType::Value, stmt.key.value_type);
        assert_eq!(b"2".as_slice(), &*stmt.value);
        assert!(stmt.ops.is_none());
    }

    #[test]
    fn upsert_over_upsert_replaces_program() {
        let mgr = TransactionManager::default();
        let txn = mgr.begin(TxnType::ReadWrite);

        mgr.set_write(&txn, InternalValue::new_upsert("a", "1", "older", 0));
        mgr.set_write(&txn, InternalValue::new_upsert("a", "2", "newer", 0));

        let write_set = txn.write_set.lock().expect("lock is poisoned");
        let stmt = write_set
            .get(&UserKey::from(b"a".as_slice()))
            .expect("write present");

        assert_eq!(ValueType::Upsert, stmt.key.value_type);
        assert_eq!(b"2".as_slice(), &*stmt.value);
        assert_eq!(Some(b"newer".as_slice()), stmt.ops.as_deref());
    }

    #[test]
    fn vlsn_floor_tracks_oldest_open_read_view() {
        let mgr = TransactionManager::default();
        let _old = mgr.begin(TxnType::ReadOnly);

        let txn = mgr.begin(TxnType::ReadWrite);
        mgr.set_write(&txn, value("a", "1", 0));
        mgr.prepare(&txn).expect("no conflict");
        mgr.commit(&txn, 10, &Index::new()).expect("commit succeeds");

        assert_eq!(0, mgr.vlsn_floor());
    }
}
