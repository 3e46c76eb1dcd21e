// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    range::Range,
    run::{id::RangeId, Run},
    value::InternalValue,
    UserKey,
};
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

/// A range's exclusive upper bound, used as the `BTreeMap` key so ranges sort
/// by key order. `Infinity` (the rightmost range's `end = +infinity`) must
/// sort *after* every finite key, unlike `Option`'s default `None < Some(_)`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd)]
enum EndKey {
    Finite(UserKey),
    Infinity,
}

impl From<&Bound<UserKey>> for EndKey {
    fn from(end: &Bound<UserKey>) -> Self {
        match end {
            Bound::Unbounded => Self::Infinity,
            Bound::Included(k) | Bound::Excluded(k) => Self::Finite(k.clone()),
        }
    }
}

/// An ordered set of [`Range`]s tiling the entire key space, one per
/// logical index (e.g. a primary or secondary key) of the host.
///
/// Ranges are kept in a `BTreeMap` keyed by their exclusive upper bound, so
/// both point lookups and range scans resolve in `O(log ranges)`.
pub struct Index {
    ranges: RwLock<BTreeMap<EndKey, Arc<Range>>>,

    /// Shared with the scheduler (see [`Index::range_id_allocator`]) so a
    /// worker thread executing a compaction split can mint the child ranges'
    /// ids itself, before writing their run files - whose names embed the
    /// final range id - rather than only at completion time on the host
    /// thread.
    range_id_max: Arc<AtomicU64>,

    /// Bumped on every structural change to the range tree (split, merge,
    /// range insertion/removal). Range iterators snapshot this to detect
    /// whether they must re-seek.
    version: AtomicU64,

    stmt_count: AtomicU64,
    size_bytes: AtomicU64,
}

impl Default for Index {
    /// Creates a fresh index with a single range covering the whole key space.
    fn default() -> Self {
        let initial = Arc::new(Range::new(0, Bound::Unbounded, Bound::Unbounded));

        let mut ranges = BTreeMap::new();
        ranges.insert(EndKey::Infinity, initial);

        Self {
            ranges: RwLock::new(ranges),
            range_id_max: Arc::new(AtomicU64::new(1)),
            version: AtomicU64::new(0),
            stmt_count: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
        }
    }
}

impl Index {
    /// Creates a fresh index with a single range covering the whole key space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an index directly from a set of already-constructed ranges,
    /// used by recovery. `ranges` must already tile the whole key space with
    /// no gaps or overlaps.
    #[must_use]
    pub(crate) fn from_ranges(ranges: Vec<Arc<Range>>) -> Self {
        let range_id_max = ranges.iter().map(|r| r.id).max().map_or(0, |id| id + 1);

        let mut tree = BTreeMap::new();
        for range in ranges {
            tree.insert(EndKey::from(&range.end), range);
        }

        Self {
            ranges: RwLock::new(tree),
            range_id_max: Arc::new(AtomicU64::new(range_id_max)),
            version: AtomicU64::new(0),
            stmt_count: AtomicU64::new(0),
            size_bytes: AtomicU64::new(0),
        }
    }

    /// Returns the index's structural version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Returns the number of ranges currently in the tree.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.ranges.read().expect("lock is poisoned").len()
    }

    /// Returns the total number of statements recorded via [`Index::insert`].
    #[must_use]
    pub fn stmt_count(&self) -> u64 {
        self.stmt_count.load(Ordering::Acquire)
    }

    /// Returns the total number of bytes recorded via [`Index::insert`].
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Acquire)
    }

    /// Returns the next free range ID.
    pub(crate) fn next_range_id(&self) -> RangeId {
        self.range_id_max.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the range-id counter backing [`Index::next_range_id`], shared
    /// with a [`crate::scheduler::Scheduler`] so a worker can mint a
    /// compaction split's child range ids itself (its run files' names embed
    /// them) without holding a reference to the index.
    #[must_use]
    pub fn range_id_allocator(&self) -> Arc<AtomicU64> {
        self.range_id_max.clone()
    }

    /// Returns the range covering `key`.
    #[must_use]
    pub fn range_for_key(&self, key: &[u8]) -> Option<Arc<Range>> {
        let ranges = self.ranges.read().expect("lock is poisoned");

        let probe = EndKey::Finite(UserKey::from(key));

        ranges
            .range((Bound::Excluded(probe), Bound::Unbounded))
            .next()
            .map(|(_, range)| range.clone())
    }

    /// Returns all ranges, in key order, `begin` ascending.
    #[must_use]
    pub fn ranges(&self) -> Vec<Arc<Range>> {
        self.ranges
            .read()
            .expect("lock is poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Inserts a statement into the range covering its key.
    ///
    /// # Panics
    ///
    /// Panics if no range covers `item`'s key, which cannot happen for a
    /// correctly-maintained index (ranges always tile the whole key space).
    pub fn insert(&self, item: InternalValue) {
        let item_size = u64::try_from(crate::ItemSize::size(&item)).unwrap_or(u64::MAX);

        let range = self
            .range_for_key(&item.key.user_key)
            .expect("ranges must tile the whole key space");

        range.insert(item);

        self.stmt_count.fetch_add(1, Ordering::AcqRel);
        self.size_bytes.fetch_add(item_size, Ordering::AcqRel);
    }

    /// Replaces a single range with one or two successor ranges produced by a
    /// compaction split.
    ///
    /// `children` must cover exactly the same key span as the replaced range,
    /// in ascending order.
    pub fn replace_range(&self, old_id: RangeId, children: Vec<Arc<Range>>) {
        let mut ranges = self.ranges.write().expect("lock is poisoned");

        let old_key = ranges
            .iter()
            .find(|(_, r)| r.id == old_id)
            .map(|(k, _)| k.clone());

        if let Some(old_key) = old_key {
            ranges.remove(&old_key);
        }

        for child in children {
            ranges.insert(EndKey::from(&child.end), child);
        }

        drop(ranges);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Finishes a compaction split: builds the two child ranges around
    /// `left_run`/`right_run`, carries over any statements written to
    /// `old`'s active mem since the split task started reading it, and
    /// installs the children in place of `old`.
    ///
    /// `left_id`/`right_id` must already have been minted from this index's
    /// own range-id counter (see [`Index::range_id_allocator`]), since the
    /// scheduler writes the runs' files under those ids before this is
    /// called.
    pub fn complete_split(
        &self,
        old: &Arc<Range>,
        split_key: &UserKey,
        left_id: RangeId,
        right_id: RangeId,
        left_run: Arc<Run>,
        right_run: Arc<Run>,
    ) -> (Arc<Range>, Arc<Range>) {
        let mut carried_over: Vec<InternalValue> = old
            .active_mem()
            .map(|mem| mem.iter().collect())
            .unwrap_or_default();
        carried_over.sort_by_key(|item| item.key.seqno);

        let (left_items, right_items): (Vec<_>, Vec<_>) = carried_over
            .into_iter()
            .partition(|item| item.key.user_key < *split_key);

        let n_compactions = old.n_compactions() + 1;

        let left = Range::from_split(
            left_id,
            old.begin.clone(),
            Bound::Excluded(split_key.clone()),
            left_run,
            left_items,
            old.id,
            n_compactions,
        );
        let right = Range::from_split(
            right_id,
            Bound::Included(split_key.clone()),
            old.end.clone(),
            right_run,
            right_items,
            old.id,
            n_compactions,
        );

        self.replace_range(old.id, vec![left.clone(), right.clone()]);

        (left, right)
    }
}
