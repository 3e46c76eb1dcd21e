// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Statement iterators, composed bottom-up: a mem/run surfaces its own
//! MVCC-filtered statements, [`merge_iter`] fans N of those into one stream
//! per range in key order, [`range_iter`] walks an index's ranges, and
//! [`ReadIter`] is the outward-facing API combining all of the above with
//! UPSERT squashing and tombstone filtering.

use crate::{
    double_ended_peekable::{DoubleEndedPeekable, DoubleEndedPeekableExt},
    index::Index,
    mem::Mem,
    merge::{BoxedIterator, Merger},
    range::Range,
    run::{iter::RunIter, Run},
    upsert::{apply_upsert, UpsertMerge},
    value::{InternalValue, SeqNo},
    Result,
};
use std::{collections::VecDeque, sync::Arc};

/// Adapts a forward-only [`Iterator`] into a [`DoubleEndedIterator`] by
/// buffering the remainder on the first reverse pull.
///
/// [`RunIter`] only exposes a forward cursor (backed by a page cache that
/// assumes ascending access), so this is the seam where it's made to satisfy
/// [`Merger`]'s double-ended bound. Forward-only consumers pay nothing;
/// reversing pays one full drain of whatever is left.
pub struct DoubleEndedAdapter<I: Iterator> {
    inner: I,
    tail: Option<VecDeque<I::Item>>,
}

impl<I: Iterator> DoubleEndedAdapter<I> {
    /// Wraps a forward iterator.
    pub fn new(inner: I) -> Self {
        Self { inner, tail: None }
    }

    fn buffer(&mut self) -> &mut VecDeque<I::Item> {
        self.tail
            .get_or_insert_with(|| self.inner.by_ref().collect())
    }
}

impl<I: Iterator> Iterator for DoubleEndedAdapter<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.tail {
            Some(buf) => buf.pop_front(),
            None => self.inner.next(),
        }
    }
}

impl<I: Iterator> DoubleEndedIterator for DoubleEndedAdapter<I> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.buffer().pop_back()
    }
}

/// Wraps [`RunIter`]'s `next() -> Result<Option<_>>` cursor as a plain
/// `Iterator<Item = Result<InternalValue>>`, stopping at the first error.
struct RunIterFused {
    inner: RunIter,
    done: bool,
}

impl Iterator for RunIterFused {
    type Item = Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.inner.next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Streams one run's statements visible at `vlsn`, in key order.
#[must_use]
pub fn run_iter(run: Arc<Run>, vlsn: SeqNo) -> BoxedIterator<'static> {
    let fused = RunIterFused {
        inner: RunIter::new(run, vlsn),
        done: false,
    };
    Box::new(DoubleEndedAdapter::new(fused))
}

/// Streams a mem's statements visible at `vlsn`, in key order.
///
/// A mem carries every version of every key it has ever seen; filtering out
/// statements not yet visible at `vlsn` leaves exactly the newest
/// visible version of each key first, same as [`run_iter`].
#[must_use]
pub fn mem_iter(mem: &Arc<Mem>, vlsn: SeqNo) -> BoxedIterator<'static> {
    // Materialized eagerly: `SkipMap::iter` borrows the mem, and a source
    // handed to `Merger` must outlive the borrow that produced it.
    let items: Vec<InternalValue> = mem.iter().filter(|item| item.key.seqno <= vlsn).collect();
    Box::new(items.into_iter().map(Ok))
}

/// Streams a transaction's own pending writes, in key order.
///
/// A transaction always sees its own uncommitted writes regardless of
/// `vlsn` - this source is meant to be merged ahead of every other one.
#[must_use]
pub fn txw_iter(writes: &[InternalValue]) -> BoxedIterator<'static> {
    let mut writes = writes.to_vec();
    writes.sort_by(|a, b| a.key.cmp(&b.key));
    Box::new(writes.into_iter().map(Ok))
}

/// Merges N per-source statement streams (youngest source first) into one
/// key-ordered stream, deduplicating to the newest visible version per key.
#[must_use]
pub fn merge_iter(sources: Vec<BoxedIterator<'static>>) -> BoxedIterator<'static> {
    Box::new(Merger::new(sources))
}

/// Builds the merge iterator for a single range at `vlsn`: transaction
/// write-set first (if any), then the active mem, then frozen mems
/// newest-first, then on-disk runs (already newest-first).
#[must_use]
pub fn range_merge_iter(
    range: &Range,
    vlsn: SeqNo,
    txw: Option<&[InternalValue]>,
) -> BoxedIterator<'static> {
    let mut sources = Vec::new();

    if let Some(txw) = txw {
        if !txw.is_empty() {
            sources.push(txw_iter(txw));
        }
    }

    if let Some(active) = range.active_mem() {
        sources.push(mem_iter(&active, vlsn));
    }

    for frozen in range.frozen_mems().into_iter().rev() {
        sources.push(mem_iter(&frozen, vlsn));
    }

    for run in range.runs() {
        sources.push(run_iter(run, vlsn));
    }

    merge_iter(sources)
}

/// Walks an index's ranges in key order, skipping compaction children whose
/// `shadow` predecessor is still present in the tree.
///
/// While a compaction is splitting a range, its children are linked into the
/// tree pointing `shadow` at the range they're splitting from; the old range
/// stays authoritative for reads until the split completes and removes it.
#[must_use]
pub fn range_iter(index: &Index) -> Vec<Arc<Range>> {
    filter_shadows(index.ranges())
}

fn filter_shadows(ranges: Vec<Arc<Range>>) -> Vec<Arc<Range>> {
    let live_ids: std::collections::HashSet<_> = ranges.iter().map(|r| r.id).collect();

    ranges
        .into_iter()
        .filter(|range| {
            let shadow = *range.shadow.read().expect("lock is poisoned");
            !shadow.is_some_and(|old_id| live_ids.contains(&old_id))
        })
        .collect()
}

/// Outward-facing read iterator: walks every range in key order, merging
/// each range's sources, squashing UPSERT chains through `executor`, and
/// skipping tombstones so only live REPLACE statements are surfaced.
pub struct ReadIter<'a> {
    ranges: std::vec::IntoIter<Arc<Range>>,
    current: Option<DoubleEndedPeekable<Result<InternalValue>, BoxedIterator<'static>>>,
    vlsn: SeqNo,
    executor: &'a dyn UpsertMerge,
}

impl<'a> ReadIter<'a> {
    /// Creates a read iterator over `index`, visible at `vlsn`.
    #[must_use]
    pub fn new(index: &Index, vlsn: SeqNo, executor: &'a dyn UpsertMerge) -> Self {
        Self {
            ranges: range_iter(index).into_iter(),
            current: None,
            vlsn,
            executor,
        }
    }

    fn advance_range(&mut self) -> bool {
        let Some(range) = self.ranges.next() else {
            return false;
        };

        let merged = range_merge_iter(&range, self.vlsn, None);
        self.current = Some(merged.double_ended_peekable());
        true
    }

    fn next_raw(&mut self) -> Option<Result<InternalValue>> {
        loop {
            if self.current.is_none() && !self.advance_range() {
                return None;
            }

            #[allow(clippy::unwrap_used, reason = "just ensured Some above")]
            let iter = self.current.as_mut().unwrap();

            match iter.next() {
                Some(item) => return Some(item),
                None => self.current = None,
            }
        }
    }
}

impl Iterator for ReadIter<'_> {
    type Item = Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let head = match self.next_raw()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            let mut current = head;

            while current.is_upsert() {
                let Some(iter) = self.current.as_mut() else {
                    break;
                };

                let key = current.key.user_key.clone();
                let older = iter.next_if(|kv| matches!(kv, Ok(v) if v.key.user_key == key));

                let older = match older {
                    Some(Ok(v)) => Some(v),
                    Some(Err(e)) => return Some(Err(e)),
                    None => None,
                };

                match apply_upsert(self.executor, &current, older.as_ref()) {
                    Ok(resolved) => current = resolved,
                    Err(e) => return Some(Err(e)),
                }

                if older.is_none() {
                    break;
                }
            }

            if let Some(iter) = self.current.as_mut() {
                let key = current.key.user_key.clone();
                while iter
                    .next_if(|kv| matches!(kv, Ok(v) if v.key.user_key == key))
                    .is_some()
                {}
            }

            if current.is_tombstone() {
                continue;
            }

            return Some(Ok(current));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value::InternalValue, UserValue, ValueType};
    use test_log::test;

    struct NoopMerge;

    impl UpsertMerge for NoopMerge {
        fn merge(&self, old: Option<&[u8]>, base: &[u8], ops: &[u8]) -> Result<UserValue> {
            let mut out = old.unwrap_or(base).to_vec();
            out.extend_from_slice(ops);
            Ok(UserValue::from(out.as_slice()))
        }

        fn combine(&self, _older_ops: &[u8], _newer_ops: &[u8]) -> Option<UserValue> {
            None
        }
    }

    #[test]
    fn mem_iter_filters_by_vlsn_and_dedups() {
        let mem = Arc::new(Mem::new(0));
        mem.insert(InternalValue::from_components("a", "old", 0, ValueType::Value));
        mem.insert(InternalValue::from_components("a", "new", 5, ValueType::Value));

        let items: Vec<_> = mem_iter(&mem, 2).map(Result::unwrap).collect();
        assert_eq!(1, items.len());
        assert_eq!(b"old".as_slice(), &*items[0].value);
    }

    #[test]
    fn filter_shadows_hides_child_while_parent_is_live() {
        use std::ops::Bound;

        let parent = Arc::new(Range::new(0, Bound::Unbounded, Bound::Unbounded));
        let child = Arc::new(Range::new(1, Bound::Unbounded, Bound::Unbounded));
        *child.shadow.write().expect("lock is poisoned") = Some(parent.id);

        let visible = filter_shadows(vec![parent.clone(), child]);
        assert_eq!(1, visible.len());
        assert_eq!(parent.id, visible[0].id);
    }

    #[test]
    fn filter_shadows_keeps_child_once_parent_is_gone() {
        use std::ops::Bound;

        let child = Arc::new(Range::new(1, Bound::Unbounded, Bound::Unbounded));
        *child.shadow.write().expect("lock is poisoned") = Some(0);

        let visible = filter_shadows(vec![child.clone()]);
        assert_eq!(1, visible.len());
        assert_eq!(child.id, visible[0].id);
    }

    #[test]
    fn read_iter_squashes_upsert_over_replace() {
        let index = Index::new();
        let range = index.range_for_key(b"a").expect("default range");

        range.insert(InternalValue::from_components("a", "base", 0, ValueType::Value));
        range.insert(InternalValue::new_upsert("a", "unused-base", "-suffix", 1));

        let executor = NoopMerge;
        let results: Vec<_> = ReadIter::new(&index, SeqNo::MAX, &executor)
            .map(Result::unwrap)
            .collect();

        assert_eq!(1, results.len());
        assert_eq!(b"base-suffix".as_slice(), &*results[0].value);
    }

    #[test]
    fn read_iter_skips_tombstones() {
        let index = Index::new();
        let range = index.range_for_key(b"a").expect("default range");

        range.insert(InternalValue::from_components("a", "v", 0, ValueType::Value));
        range.insert(InternalValue::new_tombstone("a", 1));

        let executor = NoopMerge;
        let results: Vec<_> = ReadIter::new(&index, SeqNo::MAX, &executor)
            .map(Result::unwrap)
            .collect();

        assert!(results.is_empty());
    }
}
