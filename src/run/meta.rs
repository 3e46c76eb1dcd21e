// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    value::SeqNo,
    CompressionType, UserKey,
};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Metadata describing a run, stored in its trailer.
///
/// A run is an immutable, sorted sequence of pages produced by either a
/// dump (mem -> run) or a compaction (runs -> run).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunMeta {
    /// Lowest sequence number contained in the run.
    pub min_lsn: SeqNo,

    /// Highest sequence number contained in the run.
    pub max_lsn: SeqNo,

    /// Number of statements contained in the run.
    pub item_count: u64,

    /// Number of pages in the run.
    pub page_count: u32,

    /// Uncompressed size of all statements, in bytes.
    pub total_bytes: u64,

    /// Compression used for this run's pages.
    pub compression: CompressionType,

    /// Smallest user key contained in the run.
    pub min_key: UserKey,

    /// Largest user key contained in the run.
    pub max_key: UserKey,
}

impl Encode for RunMeta {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.min_lsn)?;
        writer.write_u64_varint(self.max_lsn)?;
        writer.write_u64_varint(self.item_count)?;
        writer.write_u32_varint(self.page_count)?;
        writer.write_u64_varint(self.total_bytes)?;
        self.compression.encode_into(writer)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16_varint(self.min_key.len() as u16)?;
        writer.write_all(&self.min_key)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16_varint(self.max_key.len() as u16)?;
        writer.write_all(&self.max_key)?;

        Ok(())
    }
}

impl Decode for RunMeta {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let min_lsn = reader.read_u64_varint()?;
        let max_lsn = reader.read_u64_varint()?;
        let item_count = reader.read_u64_varint()?;
        let page_count = reader.read_u32_varint()?;
        let total_bytes = reader.read_u64_varint()?;
        let compression = CompressionType::decode_from(reader)?;

        let min_key_len = reader.read_u16_varint()?;
        let mut min_key = vec![0; min_key_len.into()];
        reader.read_exact(&mut min_key)?;

        let max_key_len = reader.read_u16_varint()?;
        let mut max_key = vec![0; max_key_len.into()];
        reader.read_exact(&mut max_key)?;

        Ok(Self {
            min_lsn,
            max_lsn,
            item_count,
            page_count,
            total_bytes,
            compression,
            min_key: min_key.into(),
            max_key: max_key.into(),
        })
    }
}
