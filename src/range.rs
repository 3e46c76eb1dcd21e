// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    mem::{Mem, MemId},
    run::{id::RangeId, Run},
    value::{InternalValue, SeqNo},
    UserKey, ValueType,
};
use std::{
    ops::Bound,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

/// Contiguous partition of the key space, owning one active mem, a list of
/// frozen mems, and a list of on-disk runs.
///
/// A range is the unit of dump and compaction. `begin`/`end` tile the key
/// space without overlap or gaps alongside sibling ranges in the same
/// [`crate::index::Index`], except transiently while a compaction is
/// splitting this range into successors (see `shadow`).
pub struct Range {
    /// Monotonic ID, unique within the owning index.
    pub id: RangeId,

    /// Inclusive lower bound; `Unbounded` means `-infinity`.
    pub begin: Bound<UserKey>,

    /// Exclusive upper bound; `Unbounded` means `+infinity`.
    pub end: Bound<UserKey>,

    /// The range's mutable write buffer. `None` while a dump/compaction task
    /// owns the range exclusively (between freeze and task completion).
    active_mem: RwLock<Option<Arc<Mem>>>,

    /// Mems handed to a dump task, oldest first. Kept until the dump
    /// producing their replacement run succeeds.
    frozen_mems: RwLock<Vec<Arc<Mem>>>,

    /// On-disk runs, newest first: `run[0].max_lsn >= run[1].max_lsn >= ...`.
    runs: RwLock<Vec<Arc<Run>>>,

    /// Sum of `mem.size()` across active + frozen mems.
    used_bytes: AtomicU64,

    /// Lowest lsn across all of the range's mems; `None` if the range is empty.
    min_lsn: AtomicU64,

    /// Number of compactions this range (or a predecessor it replaced) has
    /// undergone; used by the split-condition check.
    n_compactions: AtomicUsize,

    /// Bumped on every structural change (freeze, dump completion, compaction).
    /// Iterators snapshot this to detect whether they must re-seek.
    version: AtomicU64,

    /// Set on a compaction child to the predecessor range it split from.
    /// Readers skip children whose predecessor is still the authoritative
    /// source (see the range iterator's shadow-skip rule); writers always
    /// target the children directly.
    pub shadow: RwLock<Option<RangeId>>,

    next_mem_id: AtomicU64,
    next_run_id: AtomicU64,
}

/// Sentinel `min_lsn` meaning "range has no statements yet".
const NO_LSN: u64 = u64::MAX;

impl Range {
    /// Creates a new, empty range covering `[begin, end)`.
    #[must_use]
    pub fn new(id: RangeId, begin: Bound<UserKey>, end: Bound<UserKey>) -> Self {
        Self {
            id,
            begin,
            end,
            active_mem: RwLock::new(Some(Arc::new(Mem::new(0)))),
            frozen_mems: RwLock::new(Vec::new()),
            runs: RwLock::new(Vec::new()),
            used_bytes: AtomicU64::new(0),
            min_lsn: AtomicU64::new(NO_LSN),
            n_compactions: AtomicUsize::new(0),
            version: AtomicU64::new(0),
            shadow: RwLock::new(None),
            next_mem_id: AtomicU64::new(1),
            next_run_id: AtomicU64::new(0),
        }
    }

    /// Returns the next free run ID for this range's on-disk run file names.
    pub(crate) fn next_run_id(&self) -> crate::run::id::RunId {
        self.next_run_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Installs a set of recovered runs (newest first) and an empty active
    /// mem, called once per range while rebuilding the index from disk.
    pub(crate) fn recover_runs(&self, runs: Vec<Arc<Run>>, next_run_id: crate::run::id::RunId) {
        let min_lsn = runs.iter().map(|r| r.min_lsn()).min();

        *self.runs.write().expect("lock is poisoned") = runs;
        self.next_run_id.store(next_run_id, Ordering::Release);
        self.min_lsn
            .store(min_lsn.unwrap_or(NO_LSN), Ordering::Release);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` if `key` falls within `[begin, end)`.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let after_begin = match &self.begin {
            Bound::Unbounded => true,
            Bound::Included(b) => &**b <= key,
            Bound::Excluded(b) => &**b < key,
        };
        let before_end = match &self.end {
            Bound::Unbounded => true,
            Bound::Included(e) => key <= &**e,
            Bound::Excluded(e) => key < &**e,
        };
        after_begin && before_end
    }

    /// Returns the range's structural version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Returns the lowest lsn among all of the range's mems, if non-empty.
    #[must_use]
    pub fn min_lsn(&self) -> Option<SeqNo> {
        match self.min_lsn.load(Ordering::Acquire) {
            NO_LSN => None,
            lsn => Some(lsn),
        }
    }

    /// Returns the sum of the size of all of the range's mems.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Returns the number of compactions this range has undergone.
    #[must_use]
    pub fn n_compactions(&self) -> usize {
        self.n_compactions.load(Ordering::Acquire)
    }

    /// Returns a clone of the active mem, if the range isn't currently frozen
    /// for a background task.
    #[must_use]
    pub fn active_mem(&self) -> Option<Arc<Mem>> {
        self.active_mem.read().expect("lock is poisoned").clone()
    }

    /// Returns a snapshot of the frozen mem list, oldest first.
    #[must_use]
    pub fn frozen_mems(&self) -> Vec<Arc<Mem>> {
        self.frozen_mems.read().expect("lock is poisoned").clone()
    }

    /// Returns a snapshot of the run list, newest first.
    #[must_use]
    pub fn runs(&self) -> Vec<Arc<Run>> {
        self.runs.read().expect("lock is poisoned").clone()
    }

    /// Inserts a statement into the active mem.
    ///
    /// Two write-time optimizations run first:
    /// - DELETE: if this range has no frozen mems, no runs, and no older
    ///   version of the key in its active mem, the delete cannot shadow
    ///   anything and is discarded outright.
    /// - UPSERT: if an older non-UPSERT version of the key is already in the
    ///   active mem, or the range is otherwise completely empty, the UPSERT
    ///   applies immediately - its own embedded base tuple becomes a REPLACE
    ///   at the same lsn, with no executor needed (mirrors the no-older-
    ///   version case of [`crate::apply_upsert`]). Otherwise the raw UPSERT
    ///   is stored; it is squashed lazily at read/dump time.
    ///
    /// # Panics
    ///
    /// Panics if called while the range has no active mem (i.e. it is
    /// currently frozen for a dump/compaction task).
    pub fn insert(&self, item: InternalValue) {
        let lock = self.active_mem.read().expect("lock is poisoned");
        let mem = lock.as_ref().expect("range has no active mem");

        let is_otherwise_empty = self.frozen_mems.read().expect("lock is poisoned").is_empty()
            && self.runs.read().expect("lock is poisoned").is_empty();

        let older = mem.get(&item.key.user_key, item.key.seqno);

        if item.is_tombstone() && older.is_none() && is_otherwise_empty {
            self.version.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let applies_immediately = item.is_upsert()
            && (older.as_ref().is_some_and(|old| !old.is_upsert())
                || (older.is_none() && is_otherwise_empty));

        let item = if applies_immediately {
            InternalValue::from_components(
                item.key.user_key.clone(),
                item.value.clone(),
                item.key.seqno,
                ValueType::Value,
            )
        } else {
            item
        };

        let lsn = item.key.seqno;
        let (item_size, _) = mem.insert(item);

        self.min_lsn.fetch_min(lsn, Ordering::AcqRel);
        self.used_bytes.fetch_add(item_size, Ordering::AcqRel);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Moves the active mem to the frozen list and installs a fresh, empty
    /// active mem. No-op if the active mem is already empty.
    ///
    /// Returns the frozen mem, if any.
    pub fn freeze_active(&self) -> Option<Arc<Mem>> {
        let mut active = self.active_mem.write().expect("lock is poisoned");
        let Some(mem) = active.as_ref() else {
            return None;
        };

        if mem.is_empty() {
            return None;
        }

        let frozen = mem.clone();
        let new_id: MemId = self.next_mem_id.fetch_add(1, Ordering::AcqRel);
        *active = Some(Arc::new(Mem::new(new_id)));

        self.frozen_mems
            .write()
            .expect("lock is poisoned")
            .push(frozen.clone());

        self.version.fetch_add(1, Ordering::AcqRel);

        Some(frozen)
    }

    /// Replaces a completed set of frozen mems with a newly-dumped run,
    /// called by the scheduler on successful dump completion.
    pub fn complete_dump(&self, dumped: &[Arc<Mem>], run: Arc<Run>) {
        {
            let mut frozen = self.frozen_mems.write().expect("lock is poisoned");
            frozen.retain(|mem| !dumped.iter().any(|d| Arc::ptr_eq(d, mem)));
        }

        self.runs.write().expect("lock is poisoned").insert(0, run);

        self.recompute_min_lsn();
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Replaces the range's entire mem/run content with a single compacted
    /// run, called by the scheduler on successful non-splitting compaction.
    pub fn complete_compaction(&self, run: Arc<Run>) {
        self.frozen_mems.write().expect("lock is poisoned").clear();
        *self.runs.write().expect("lock is poisoned") = vec![run];
        self.n_compactions.fetch_add(1, Ordering::AcqRel);
        self.recompute_min_lsn();
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Builds a child range produced by splitting `predecessor` during a
    /// compaction. `run` becomes the child's sole run; `carried_over` is the
    /// slice of `predecessor`'s active mem falling in `[begin, end)`,
    /// replayed verbatim into a fresh active mem in ascending-seqno order (it
    /// was already resolved against the predecessor's prior state, so the
    /// write-time fast path in [`Range::insert`] does not need to run again).
    ///
    /// `shadow` is set to `predecessor`, so readers keep routing to
    /// `predecessor` until the index drops it (see the range iterator's
    /// shadow-skip rule in `iters.rs`).
    pub(crate) fn from_split(
        id: RangeId,
        begin: Bound<UserKey>,
        end: Bound<UserKey>,
        run: Arc<Run>,
        carried_over: Vec<InternalValue>,
        predecessor: RangeId,
        n_compactions: usize,
    ) -> Arc<Self> {
        let range = Arc::new(Self {
            id,
            begin,
            end,
            active_mem: RwLock::new(Some(Arc::new(Mem::new(0)))),
            frozen_mems: RwLock::new(Vec::new()),
            runs: RwLock::new(vec![run]),
            used_bytes: AtomicU64::new(0),
            min_lsn: AtomicU64::new(NO_LSN),
            n_compactions: AtomicUsize::new(n_compactions),
            version: AtomicU64::new(0),
            shadow: RwLock::new(Some(predecessor)),
            next_mem_id: AtomicU64::new(1),
            next_run_id: AtomicU64::new(1),
        });

        {
            let lock = range.active_mem.read().expect("lock is poisoned");
            let mem = lock.as_ref().expect("fresh range has an active mem");

            for item in carried_over {
                let (item_size, _) = mem.insert(item);
                range.used_bytes.fetch_add(item_size, Ordering::AcqRel);
            }
        }

        range.recompute_min_lsn();
        range
    }

    fn recompute_min_lsn(&self) {
        let frozen = self.frozen_mems.read().expect("lock is poisoned");
        let runs = self.runs.read().expect("lock is poisoned");
        let active = self.active_mem();

        let candidate = active
            .iter()
            .chain(frozen.iter())
            .filter_map(|m| m.get_lowest_seqno())
            .chain(
                runs.iter()
                    .filter(|r| r.metadata().item_count > 0)
                    .map(|r| r.min_lsn()),
            )
            .min();

        self.min_lsn.store(candidate.unwrap_or(NO_LSN), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value::InternalValue, ValueType};
    use test_log::test;

    #[test]
    fn range_contains_bounds() {
        let range = Range::new(
            0,
            Bound::Included(UserKey::from(b"b".as_slice())),
            Bound::Excluded(UserKey::from(b"d".as_slice())),
        );

        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));
    }

    #[test]
    fn range_insert_bumps_version_and_min_lsn() {
        let range = Range::new(0, Bound::Unbounded, Bound::Unbounded);
        assert_eq!(None, range.min_lsn());

        range.insert(InternalValue::from_components(
            "a",
            "1",
            5,
            ValueType::Value,
        ));

        assert_eq!(Some(5), range.min_lsn());
        assert_eq!(1, range.version());
    }

    #[test]
    fn range_insert_discards_delete_on_empty_range() {
        let range = Range::new(0, Bound::Unbounded, Bound::Unbounded);
        range.insert(InternalValue::new_tombstone("a", 0));

        assert_eq!(None, range.min_lsn());
        assert!(range.active_mem().expect("active mem").is_empty());
    }

    #[test]
    fn range_insert_keeps_delete_over_older_version() {
        let range = Range::new(0, Bound::Unbounded, Bound::Unbounded);
        range.insert(InternalValue::from_components("a", "1", 0, ValueType::Value));
        range.insert(InternalValue::new_tombstone("a", 1));

        let mem = range.active_mem().expect("active mem");
        assert_eq!(2, mem.len());
    }

    #[test]
    fn range_insert_applies_upsert_immediately_on_empty_range() {
        let range = Range::new(0, Bound::Unbounded, Bound::Unbounded);
        range.insert(InternalValue::new_upsert("a", "base", "ops", 0));

        let mem = range.active_mem().expect("active mem");
        let stored = mem.get(b"a", SeqNo::MAX).expect("stored");
        assert_eq!(ValueType::Value, stored.key.value_type);
        assert_eq!(b"base".as_slice(), &*stored.value);
        assert!(stored.ops.is_none());
    }

    #[test]
    fn range_insert_applies_upsert_immediately_over_older_replace() {
        let range = Range::new(0, Bound::Unbounded, Bound::Unbounded);
        range.insert(InternalValue::from_components("a", "1", 0, ValueType::Value));
        range.insert(InternalValue::new_upsert("a", "2", "ops", 1));

        let mem = range.active_mem().expect("active mem");
        let stored = mem.get(b"a", SeqNo::MAX).expect("stored");
        assert_eq!(ValueType::Value, stored.key.value_type);
        assert_eq!(b"2".as_slice(), &*stored.value);
    }

    #[test]
    fn range_insert_stores_raw_upsert_over_older_upsert() {
        let range = Range::new(0, Bound::Unbounded, Bound::Unbounded);
        range.insert(InternalValue::new_upsert("a", "1", "older", 0));
        range.insert(InternalValue::new_upsert("a", "2", "newer", 1));

        let mem = range.active_mem().expect("active mem");
        let stored = mem.get(b"a", SeqNo::MAX).expect("stored");
        assert_eq!(ValueType::Upsert, stored.key.value_type);
        assert_eq!(Some(b"newer".as_slice()), stored.ops.as_deref());
    }

    #[test]
    fn range_freeze_active_moves_mem() {
        let range = Range::new(0, Bound::Unbounded, Bound::Unbounded);
        range.insert(InternalValue::from_components(
            "a",
            "1",
            0,
            ValueType::Value,
        ));

        let frozen = range.freeze_active().expect("mem was non-empty");
        assert_eq!(1, frozen.len());
        assert_eq!(1, range.frozen_mems().len());
        assert!(range.active_mem().expect("fresh active mem").is_empty());
    }
}
