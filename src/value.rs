// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    key::InternalKey,
    Slice,
};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Trait for types that can report their approximate in-memory footprint
///
/// Used by [`crate::mem::Mem`] to track its approximate size for flush scheduling.
pub trait ItemSize {
    /// Returns the approximate size of the item in bytes
    fn size(&self) -> usize;
}

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
#[allow(clippy::module_name_repetitions)]
pub type UserValue = Slice;

/// Sequence number - a monotonically increasing counter
///
/// Values with the same seqno are part of the same batch.
///
/// A value with a higher sequence number shadows an item with the
/// same key and lower sequence number. This enables MVCC.
///
/// Stale items are lazily garbage-collected during compaction.
pub type SeqNo = u64;

/// Statement type, as stored in a mem or a run
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum ValueType {
    /// REPLACE: a full value for the key
    Value,

    /// DELETE: the key is removed
    Tombstone,

    /// "Weak" deletion (a.k.a. `SingleDelete` in `RocksDB`)
    WeakTombstone,

    /// UPSERT: a conditional update-or-insert, carrying a base tuple
    /// ([`InternalValue::value`]) and an opaque update program
    /// ([`InternalValue::ops`]), applied lazily by [`crate::upsert::apply_upsert`].
    Upsert,
}

impl TryFrom<u8> for ValueType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Value),
            1 => Ok(Self::Tombstone),
            2 => Ok(Self::WeakTombstone),
            3 => Ok(Self::Upsert),
            _ => Err(()),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Value => 0,
            ValueType::Tombstone => 1,
            ValueType::WeakTombstone => 2,
            ValueType::Upsert => 3,
        }
    }
}

/// Internal representation of KV pairs
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Eq)]
pub struct InternalValue {
    /// Internal key
    pub key: InternalKey,

    /// User-defined value - an arbitrary byte array
    ///
    /// Supports up to 2^32 bytes.
    ///
    /// For an UPSERT statement, this is the base tuple used when no older
    /// version exists to apply the update program onto.
    pub value: UserValue,

    /// UPSERT update program, present only when `key.value_type == ValueType::Upsert`.
    pub ops: Option<UserValue>,
}

impl InternalValue {
    /// Creates a new [`Value`].
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16, or the value length is greater than 2^32.
    pub fn new<V: Into<UserValue>>(key: InternalKey, value: V) -> Self {
        let value = value.into();

        assert!(!key.user_key.is_empty(), "key may not be empty");
        assert!(
            u32::try_from(value.len()).is_ok(),
            "values can be 2^32 bytes in length"
        );

        Self {
            key,
            value,
            ops: None,
        }
    }

    /// Creates a new [`Value`].
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16, or the value length is greater than 2^32.
    pub fn from_components<K: Into<UserKey>, V: Into<UserValue>>(
        user_key: K,
        value: V,
        seqno: SeqNo,
        value_type: ValueType,
    ) -> Self {
        let key = InternalKey::new(user_key, seqno, value_type);
        Self::new(key, value)
    }

    /// Creates a new tombstone.
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16.
    pub fn new_tombstone<K: Into<UserKey>>(key: K, seqno: u64) -> Self {
        let key = InternalKey::new(key, seqno, ValueType::Tombstone);
        Self::new(key, vec![])
    }

    /// Creates a new weak tombstone.
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16.
    pub fn new_weak_tombstone<K: Into<UserKey>>(key: K, seqno: u64) -> Self {
        let key = InternalKey::new(key, seqno, ValueType::WeakTombstone);
        Self::new(key, vec![])
    }

    /// Creates a new UPSERT statement with base tuple `value` and update program `ops`.
    ///
    /// # Panics
    ///
    /// Panics if the key length is empty or greater than 2^16, or the value length is greater than 2^32.
    pub fn new_upsert<K: Into<UserKey>, V: Into<UserValue>, O: Into<UserValue>>(
        key: K,
        value: V,
        ops: O,
        seqno: u64,
    ) -> Self {
        let key = InternalKey::new(key, seqno, ValueType::Upsert);
        let mut item = Self::new(key, value);
        item.ops = Some(ops.into());
        item
    }

    #[doc(hidden)]
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.key.is_tombstone()
    }

    /// Returns `true` if this is an UPSERT statement.
    #[must_use]
    pub fn is_upsert(&self) -> bool {
        self.key.value_type == ValueType::Upsert
    }
}

impl PartialEq for InternalValue {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl PartialOrd for InternalValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.key.cmp(&other.key))
    }
}

// Order by user key, THEN by sequence number
// This is one of the most important functions
// Otherwise queries will not match expected behaviour
impl Ord for InternalValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl ItemSize for InternalValue {
    fn size(&self) -> usize {
        std::mem::size_of::<SeqNo>()
            + std::mem::size_of::<ValueType>()
            + self.key.user_key.len()
            + self.value.len()
            + self.ops.as_ref().map_or(0, |ops| ops.len())
    }
}

impl std::fmt::Debug for InternalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} => {:?}",
            self.key,
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )?;

        if let Some(ops) = &self.ops {
            write!(
                f,
                " (ops: {})",
                if ops.len() >= 64 {
                    format!("[ ... {} bytes ]", ops.len())
                } else {
                    format!("{ops:?}")
                }
            )?;
        }

        Ok(())
    }
}

// TODO: 3.0.0 remove
impl Encode for InternalValue {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.key.encode_into(writer)?;

        // NOTE: Only write value len + value if we are actually a value
        if !self.is_tombstone() {
            // NOTE: We know values are limited to 32-bit length
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32_varint(self.value.len() as u32)?;
            writer.write_all(&self.value)?;
        }

        // NOTE: UPSERT statements additionally carry an update program
        if self.key.value_type == ValueType::Upsert {
            let ops = self.ops.as_deref().unwrap_or(&[]);

            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32_varint(ops.len() as u32)?;
            writer.write_all(ops)?;
        }

        Ok(())
    }
}

// TODO: 3.0.0 remove
impl Decode for InternalValue {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key = InternalKey::decode_from(reader)?;

        let value = if key.is_tombstone() {
            UserValue::empty()
        } else {
            // NOTE: Only read value if we are actually a value
            let value_len = reader.read_u32_varint()?;
            UserValue::from_reader(reader, value_len as usize)?
        };

        let ops = if key.value_type == ValueType::Upsert {
            let ops_len = reader.read_u32_varint()?;
            Some(UserValue::from_reader(reader, ops_len as usize)?)
        } else {
            None
        };

        Ok(Self { key, value, ops })
    }
}
