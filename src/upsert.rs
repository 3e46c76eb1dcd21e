// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{value::InternalValue, Result, UserValue, ValueType};

/// Host-supplied logic for applying and squashing UPSERT update programs.
///
/// The engine core treats an UPSERT's base tuple and update program as opaque
/// byte strings - it does not know how tuples are encoded. A host embeds the
/// engine by implementing this trait with its own tuple format.
pub trait UpsertMerge: Send + Sync {
    /// Applies `ops` onto `old`, falling back to `base` if `old` is `None`.
    ///
    /// `old` is the existing tuple's full value, if one exists.
    /// `base` is the UPSERT's carried base tuple, used when no prior tuple exists.
    fn merge(&self, old: Option<&[u8]>, base: &[u8], ops: &[u8]) -> Result<UserValue>;

    /// Attempts to combine two adjacent, not-yet-applied UPSERT update programs
    /// into a single one, without materializing a tuple.
    ///
    /// Returns `None` if the two programs cannot be squashed (e.g. because they
    /// touch overlapping fields in a way the host can't losslessly collapse),
    /// in which case the caller should apply `older_ops` eagerly instead.
    fn combine(&self, older_ops: &[u8], newer_ops: &[u8]) -> Option<UserValue>;
}

/// Resolves a newer UPSERT statement against the next older statement for the
/// same key, per the storage engine's read-time UPSERT squashing rules.
///
/// - If `old` is `None` or a tombstone, the update program is applied onto the
///   UPSERT's own base tuple.
/// - If `old` is a REPLACE, the update program is applied onto `old`'s value.
/// - If `old` is itself an UPSERT, an attempt is made to combine the two update
///   programs into one outstanding UPSERT without materializing a tuple; if the
///   host can't combine them, the newer UPSERT is resolved eagerly against its
///   own base tuple and `old` is left untouched for a later pass.
pub fn apply_upsert(
    executor: &dyn UpsertMerge,
    new_upsert: &InternalValue,
    old: Option<&InternalValue>,
) -> Result<InternalValue> {
    debug_assert_eq!(new_upsert.key.value_type, ValueType::Upsert);

    let ops = new_upsert.ops.as_deref().unwrap_or(&[]);

    match old {
        None => {
            let value = executor.merge(None, &new_upsert.value, ops)?;
            Ok(InternalValue::from_components(
                new_upsert.key.user_key.clone(),
                value,
                new_upsert.key.seqno,
                ValueType::Value,
            ))
        }
        Some(old) if old.is_tombstone() => {
            let value = executor.merge(None, &new_upsert.value, ops)?;
            Ok(InternalValue::from_components(
                new_upsert.key.user_key.clone(),
                value,
                new_upsert.key.seqno,
                ValueType::Value,
            ))
        }
        Some(old) if old.key.value_type == ValueType::Upsert => {
            let older_ops = old.ops.as_deref().unwrap_or(&[]);

            if let Some(combined) = executor.combine(older_ops, ops) {
                Ok(InternalValue::new_upsert(
                    new_upsert.key.user_key.clone(),
                    old.value.clone(),
                    combined,
                    new_upsert.key.seqno,
                ))
            } else {
                // Can't losslessly squash - resolve the newer UPSERT eagerly
                // against its own base tuple, leaving `old` for a later pass.
                let value = executor.merge(None, &new_upsert.value, ops)?;
                Ok(InternalValue::from_components(
                    new_upsert.key.user_key.clone(),
                    value,
                    new_upsert.key.seqno,
                    ValueType::Value,
                ))
            }
        }
        Some(old) => {
            let value = executor.merge(Some(&old.value), &new_upsert.value, ops)?;
            Ok(InternalValue::from_components(
                new_upsert.key.user_key.clone(),
                value,
                new_upsert.key.seqno,
                ValueType::Value,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    /// Toy executor: tuples are little-endian i64 counters, `ops` is a
    /// single little-endian i64 delta to add.
    struct SumMerge;

    fn decode(bytes: &[u8]) -> i64 {
        let mut buf = [0; 8];
        buf.copy_from_slice(bytes);
        i64::from_le_bytes(buf)
    }

    impl UpsertMerge for SumMerge {
        fn merge(&self, old: Option<&[u8]>, base: &[u8], ops: &[u8]) -> Result<UserValue> {
            let start = old.map_or_else(|| decode(base), decode);
            let delta = decode(ops);
            Ok(UserValue::from((start + delta).to_le_bytes().as_slice()))
        }

        fn combine(&self, older_ops: &[u8], newer_ops: &[u8]) -> Option<UserValue> {
            let sum = decode(older_ops) + decode(newer_ops);
            Some(UserValue::from(sum.to_le_bytes().as_slice()))
        }
    }

    fn upsert(key: &str, base: i64, ops: i64, seqno: u64) -> InternalValue {
        InternalValue::new_upsert(
            key,
            base.to_le_bytes().as_slice(),
            ops.to_le_bytes().as_slice(),
            seqno,
        )
    }

    #[test]
    fn upsert_no_old_value() -> crate::Result<()> {
        let new = upsert("a", 10, 5, 1);
        let result = apply_upsert(&SumMerge, &new, None)?;
        assert_eq!(ValueType::Value, result.key.value_type);
        assert_eq!(15, decode(&result.value));
        Ok(())
    }

    #[test]
    fn upsert_over_tombstone() -> crate::Result<()> {
        let old = InternalValue::new_tombstone("a", 0);
        let new = upsert("a", 10, 5, 1);
        let result = apply_upsert(&SumMerge, &new, Some(&old))?;
        assert_eq!(15, decode(&result.value));
        Ok(())
    }

    #[test]
    fn upsert_over_value() -> crate::Result<()> {
        let old =
            InternalValue::from_components("a", 100i64.to_le_bytes().as_slice(), 0, ValueType::Value);
        let new = upsert("a", 10, 5, 1);
        let result = apply_upsert(&SumMerge, &new, Some(&old))?;
        assert_eq!(105, decode(&result.value));
        Ok(())
    }

    #[test]
    fn upsert_combines_with_older_upsert() -> crate::Result<()> {
        let old = upsert("a", 10, 3, 0);
        let new = upsert("a", 10, 5, 1);
        let result = apply_upsert(&SumMerge, &new, Some(&old))?;
        assert_eq!(ValueType::Upsert, result.key.value_type);
        assert_eq!(8, decode(result.ops.as_deref().expect("has ops")));
        Ok(())
    }
}
