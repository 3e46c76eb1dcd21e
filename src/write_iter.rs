// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The iterator that drives dump and compaction tasks: it reads the merged
//! statement stream for a set of mems/runs and decides, per key, which
//! statements survive into the new run.

use crate::{
    merge::{BoxedIterator, Merger},
    upsert::{apply_upsert, UpsertMerge},
    value::{InternalValue, SeqNo},
    Result,
};
use std::collections::VecDeque;

/// Builds the write iterator over `sources` (mems first, runs next, as
/// `Merger` already expects), squashing each key's pre-`oldest_vlsn` history
/// down to a single representative statement.
#[must_use]
pub fn write_iter<'a>(
    sources: Vec<BoxedIterator<'a>>,
    oldest_vlsn: SeqNo,
    is_last_level: bool,
    executor: &'a dyn UpsertMerge,
) -> WriteIter<'a> {
    WriteIter {
        inner: Merger::new(sources),
        buffered: VecDeque::new(),
        pending: None,
        oldest_vlsn,
        is_last_level,
        executor,
    }
}

/// Squashes a key's statements below `oldest_vlsn` into one representative,
/// per the numbered rules in the write iterator's module documentation.
pub struct WriteIter<'a> {
    inner: Merger<'a>,
    buffered: VecDeque<InternalValue>,
    /// One-item lookahead: `Merger` has no `peek`, so the item that revealed
    /// the start of the next key's group is stashed here until it's pulled.
    pending: Option<InternalValue>,
    oldest_vlsn: SeqNo,
    is_last_level: bool,
    executor: &'a dyn UpsertMerge,
}

impl WriteIter<'_> {
    fn next_raw(&mut self) -> Option<Result<InternalValue>> {
        self.pending.take().map(Ok).or_else(|| self.inner.next())
    }

    /// Pulls the next key's full, same-key run out of the merged stream.
    fn next_group(&mut self) -> Option<Result<Vec<InternalValue>>> {
        let first = match self.next_raw()? {
            Ok(item) => item,
            Err(e) => return Some(Err(e)),
        };

        let key = first.key.user_key.clone();
        let mut group = vec![first];

        loop {
            match self.next_raw() {
                Some(Ok(item)) if item.key.user_key == key => group.push(item),
                Some(Ok(item)) => {
                    self.pending = Some(item);
                    break;
                }
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }

        Some(Ok(group))
    }

    /// Splits a same-key group (newest-first) into untouched statements and
    /// the squashed representative.
    fn resolve_group(&self, group: Vec<InternalValue>) -> Result<Vec<InternalValue>> {
        let mut emitted = Vec::new();
        let mut below = VecDeque::new();

        for item in group {
            if item.key.seqno > self.oldest_vlsn {
                emitted.push(item);
            } else {
                below.push(item);
            }
        }

        let Some(representative) = self.squash_below(below)? else {
            return Ok(emitted);
        };

        if self.is_last_level && representative.is_tombstone() {
            return Ok(emitted);
        }

        emitted.push(representative);
        Ok(emitted)
    }

    /// Squashes the pre-`oldest_vlsn` slice of one key's history (already
    /// newest-first) into a single statement.
    fn squash_below(&self, mut below: VecDeque<InternalValue>) -> Result<Option<InternalValue>> {
        let Some(mut current) = below.pop_front() else {
            return Ok(None);
        };

        let mut found_boundary = false;

        while current.is_upsert() {
            let Some(older) = below.pop_front() else {
                break;
            };

            found_boundary = !older.is_upsert();

            current = apply_upsert(self.executor, &current, Some(&older))?;
        }

        if self.is_last_level && current.is_upsert() && !found_boundary {
            current = apply_upsert(self.executor, &current, None)?;
        }

        Ok(Some(current))
    }
}

impl Iterator for WriteIter<'_> {
    type Item = Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(Ok(item));
            }

            let group = match self.next_group()? {
                Ok(group) => group,
                Err(e) => return Some(Err(e)),
            };

            match self.resolve_group(group) {
                Ok(items) => self.buffered = items.into(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{UserValue, ValueType};
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

    /// Unlike `NoopMerge`, actually combines adjacent UPSERT ops by
    /// concatenation, so chains can squash all the way to their boundary.
    struct CombiningMerge;

    impl UpsertMerge for CombiningMerge {
        fn merge(&self, old: Option<&[u8]>, base: &[u8], ops: &[u8]) -> Result<UserValue> {
            let mut out = old.unwrap_or(base).to_vec();
            out.extend_from_slice(ops);
            Ok(UserValue::from(out.as_slice()))
        }

        fn combine(&self, older_ops: &[u8], newer_ops: &[u8]) -> Option<UserValue> {
            let mut out = older_ops.to_vec();
            out.extend_from_slice(newer_ops);
            Some(UserValue::from(out.as_slice()))
        }
    }

    fn source(items: Vec<InternalValue>) -> BoxedIterator<'static> {
        Box::new(items.into_iter().map(Ok))
    }

    #[test]
    fn emits_statements_above_oldest_vlsn_unchanged() {
        let items = vec![
            InternalValue::from_components("a", "new", 10, ValueType::Value),
            InternalValue::from_components("a", "old", 1, ValueType::Value),
        ];

        let executor = NoopMerge;
        let out: Vec<_> = write_iter(vec![source(items)], 5, false, &executor)
            .map(Result::unwrap)
            .collect();

        assert_eq!(2, out.len());
        assert_eq!(10, out[0].key.seqno);
        assert_eq!(1, out[1].key.seqno);
    }

    #[test]
    fn squashes_upsert_chain_down_to_replace_boundary() {
        let items = vec![
            InternalValue::new_upsert("a", "unused", "-b", 3),
            InternalValue::new_upsert("a", "unused", "-a", 2),
            InternalValue::from_components("a", "base", 1, ValueType::Value),
        ];

        let executor = CombiningMerge;
        let out: Vec<_> = write_iter(vec![source(items)], 100, false, &executor)
            .map(Result::unwrap)
            .collect();

        assert_eq!(1, out.len());
        assert_eq!(ValueType::Value, out[0].key.value_type);
        assert_eq!(b"base-a-b".as_slice(), &*out[0].value);
    }

    #[test]
    fn last_level_drops_representative_delete() {
        let items = vec![InternalValue::new_tombstone("a", 1)];

        let executor = NoopMerge;
        let out: Vec<_> = write_iter(vec![source(items)], 100, true, &executor)
            .map(Result::unwrap)
            .collect();

        assert!(out.is_empty());
    }

    #[test]
    fn last_level_converts_baseless_upsert_to_replace() {
        let items = vec![InternalValue::new_upsert("a", "base", "-suffix", 1)];

        let executor = NoopMerge;
        let out: Vec<_> = write_iter(vec![source(items)], 100, true, &executor)
            .map(Result::unwrap)
            .collect();

        assert_eq!(1, out.len());
        assert_eq!(ValueType::Value, out[0].key.value_type);
        assert_eq!(b"base-suffix".as_slice(), &*out[0].value);
    }

    #[test]
    fn non_last_level_keeps_baseless_upsert_as_upsert() {
        let items = vec![InternalValue::new_upsert("a", "base", "-suffix", 1)];

        let executor = NoopMerge;
        let out: Vec<_> = write_iter(vec![source(items)], 100, false, &executor)
            .map(Result::unwrap)
            .collect();

        assert_eq!(1, out.len());
        assert_eq!(ValueType::Upsert, out[0].key.value_type);
    }

    #[test]
    fn multiple_keys_are_each_resolved_independently() {
        let items = vec![
            InternalValue::from_components("a", "1", 1, ValueType::Value),
            InternalValue::from_components("b", "2", 2, ValueType::Value),
        ];

        let executor = NoopMerge;
        let out: Vec<_> = write_iter(vec![source(items)], 100, false, &executor)
            .map(Result::unwrap)
            .collect();

        assert_eq!(2, out.len());
        assert_eq!(b"1".as_slice(), &*out[0].value);
        assert_eq!(b"2".as_slice(), &*out[1].value);
    }
}
