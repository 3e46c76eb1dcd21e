// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    key::InternalKey,
    value::{InternalValue, SeqNo, UserValue},
    ItemSize, UserKey, ValueType,
};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicBool, AtomicU64};

/// Identifies a single in-memory write buffer within a range
pub type MemId = u64;

/// An in-memory, sorted write buffer for a single range
///
/// New statements (REPLACE/DELETE/UPSERT) are appended here first. Once a mem
/// grows past the configured threshold it is frozen, handed to the dump
/// scheduler, and replaced by a fresh active mem.
pub struct Mem {
    /// Identifies this mem within its range, used to order frozen mems
    /// oldest-first when building the read iterator stack.
    pub id: MemId,

    /// The actual content, stored in a lock-free skiplist.
    ///
    /// Keys are ordered `(user_key asc, seqno desc)`, which lets point reads
    /// find the newest visible version with a single forward range-scan.
    ///
    /// The mapped value carries the statement's value plus, for UPSERT
    /// statements, the update program (see [`InternalValue::ops`]).
    #[doc(hidden)]
    pub items: SkipMap<InternalKey, (UserValue, Option<UserValue>)>,

    /// Approximate size of the mem in bytes.
    ///
    /// If this grows too large, a dump is triggered.
    pub(crate) approximate_size: AtomicU64,

    /// Highest encountered sequence number.
    ///
    /// This is used so that `get_highest_seqno` has O(1) complexity.
    pub(crate) highest_seqno: AtomicU64,

    /// Lowest encountered sequence number, `u64::MAX` while empty.
    pub(crate) lowest_seqno: AtomicU64,

    /// Set once the mem has been queued for a dump, so it is only queued once.
    pub(crate) requested_dump: AtomicBool,
}

impl Mem {
    /// Creates a new, empty mem.
    #[must_use]
    pub fn new(id: MemId) -> Self {
        Self {
            id,
            items: SkipMap::default(),
            approximate_size: AtomicU64::default(),
            highest_seqno: AtomicU64::default(),
            lowest_seqno: AtomicU64::new(SeqNo::MAX),
            requested_dump: AtomicBool::default(),
        }
    }

    /// Returns the mem's ID.
    pub fn id(&self) -> MemId {
        self.id
    }

    /// Returns `true` if the mem was already flagged for a dump.
    pub fn is_flagged_for_dump(&self) -> bool {
        self.requested_dump.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Flags the mem as queued for a dump.
    pub fn flag_for_dump(&self) {
        self.requested_dump
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Creates an iterator over all items, in `(key asc, seqno desc)` order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = InternalValue> + '_ {
        self.items.iter().map(|entry| {
            let (value, ops) = entry.value().clone();
            InternalValue {
                key: entry.key().clone(),
                value,
                ops,
            }
        })
    }

    /// Returns the newest version of `key` visible at `seqno`, if any.
    #[doc(hidden)]
    pub fn get(&self, key: &[u8], seqno: SeqNo) -> Option<InternalValue> {
        if seqno == 0 {
            return None;
        }

        // InternalKeys are sorted by (user_key asc, seqno desc).
        // We search for the lowest entry whose key is >= our key and whose
        // seqno is <= seqno - 1, i.e. the newest version visible at `seqno`.
        let lower_bound = InternalKey::new(key, seqno - 1, ValueType::Value);

        let mut iter = self
            .items
            .range(lower_bound..)
            .take_while(|entry| &*entry.key().user_key == key);

        iter.next().map(|entry| {
            let (value, ops) = entry.value().clone();
            InternalValue {
                key: entry.key().clone(),
                value,
                ops,
            }
        })
    }

    /// Gets approximate size of the mem in bytes.
    pub fn size(&self) -> u64 {
        self.approximate_size.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Counts the number of statements in the mem.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the mem is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the highest sequence number in the mem, if non-empty.
    pub fn get_highest_seqno(&self) -> Option<SeqNo> {
        if self.is_empty() {
            None
        } else {
            Some(self.highest_seqno.load(std::sync::atomic::Ordering::Acquire))
        }
    }

    /// Returns the lowest sequence number in the mem, if non-empty.
    pub fn get_lowest_seqno(&self) -> Option<SeqNo> {
        if self.is_empty() {
            None
        } else {
            Some(self.lowest_seqno.load(std::sync::atomic::Ordering::Acquire))
        }
    }

    /// Inserts a statement into the mem, returning `(item_size, new_total_size)`.
    #[doc(hidden)]
    pub fn insert(&self, item: InternalValue) -> (u64, u64) {
        #[expect(
            clippy::expect_used,
            reason = "keys are limited to 16-bit length + values are limited to 32-bit length"
        )]
        let item_size: u64 = item.size().try_into().expect("should fit into u64");

        let size_before = self
            .approximate_size
            .fetch_add(item_size, std::sync::atomic::Ordering::AcqRel);

        let key = InternalKey::new(item.key.user_key, item.key.seqno, item.key.value_type);
        self.items.insert(key, (item.value, item.ops));

        self.highest_seqno
            .fetch_max(item.key.seqno, std::sync::atomic::Ordering::AcqRel);
        self.lowest_seqno
            .fetch_min(item.key.seqno, std::sync::atomic::Ordering::AcqRel);

        (item_size, size_before + item_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType;
    use test_log::test;

    #[test]
    #[expect(clippy::unwrap_used)]
    fn mem_mvcc_point_read() {
        let mem = Mem::new(0);

        mem.insert(InternalValue::from_components(
            *b"hello-key-999991",
            *b"hello-value-999991",
            0,
            ValueType::Value,
        ));

        let item = mem.get(b"hello-key-99999", SeqNo::MAX);
        assert_eq!(None, item);

        let item = mem.get(b"hello-key-999991", SeqNo::MAX);
        assert_eq!(*b"hello-value-999991", &*item.unwrap().value);

        mem.insert(InternalValue::from_components(
            *b"hello-key-999991",
            *b"hello-value-999991-2",
            1,
            ValueType::Value,
        ));

        let item = mem.get(b"hello-key-999991", 1);
        assert_eq!((*b"hello-value-999991"), &*item.unwrap().value);

        let item = mem.get(b"hello-key-999991", 2);
        assert_eq!((*b"hello-value-999991-2"), &*item.unwrap().value);
    }

    #[test]
    fn mem_get_highest_seqno() {
        let mem = Mem::new(0);

        for seqno in 0..5 {
            mem.insert(InternalValue::from_components(
                b"abc".to_vec(),
                b"abc".to_vec(),
                seqno,
                ValueType::Value,
            ));
        }

        assert_eq!(Some(4), mem.get_highest_seqno());
    }

    #[test]
    fn mem_get_old_version() {
        let mem = Mem::new(0);

        for seqno in [0, 99, 255] {
            mem.insert(InternalValue::from_components(
                b"abc".to_vec(),
                format!("v{seqno}").into_bytes(),
                seqno,
                ValueType::Value,
            ));
        }

        assert_eq!(
            b"v255".to_vec(),
            &*mem.get(b"abc", SeqNo::MAX).unwrap().value
        );
        assert_eq!(b"v99".to_vec(), &*mem.get(b"abc", 100).unwrap().value);
        assert_eq!(b"v0".to_vec(), &*mem.get(b"abc", 50).unwrap().value);
    }

    #[test]
    fn mem_tombstone_roundtrip() {
        let mem = Mem::new(0);

        mem.insert(InternalValue::new_tombstone(b"abc".to_vec(), 0));

        let item = mem.get(b"abc", SeqNo::MAX).unwrap();
        assert!(item.is_tombstone());
    }
}
