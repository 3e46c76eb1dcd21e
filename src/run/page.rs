// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    checksum::{Checksum, ChecksummedWriter},
    coding::{Decode, Encode},
    value::InternalValue,
    CompressionType,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// A sorted run of statements small enough to be read and decoded in one shot.
///
/// Pages are the unit of I/O and caching for a run: a point read loads at
/// most one page, a range scan streams consecutive pages.
#[derive(Clone, Debug, Default)]
pub struct Page {
    /// Statements contained in the page, sorted `(user_key asc, seqno desc)`.
    pub items: Vec<InternalValue>,
}

impl Page {
    /// Returns the smallest key in the page.
    #[must_use]
    pub fn min_key(&self) -> Option<&[u8]> {
        self.items.first().map(|item| &*item.key.user_key)
    }

    /// Returns the largest key in the page.
    #[must_use]
    pub fn max_key(&self) -> Option<&[u8]> {
        self.items.last().map(|item| &*item.key.user_key)
    }

    fn encode_body(&self) -> crate::Result<Vec<u8>> {
        let mut body = Vec::new();
        body.write_u32_varint(
            self.items
                .len()
                .try_into()
                .expect("page item count should fit into u32"),
        )?;

        for item in &self.items {
            item.encode_into(&mut body)?;
        }

        Ok(body)
    }

    /// Serializes the page as a self-checksummed, optionally-compressed frame.
    ///
    /// Returns the number of bytes written.
    pub fn write_frame<W: Write>(
        &self,
        writer: &mut W,
        compression: CompressionType,
    ) -> crate::Result<u64> {
        let body = self.encode_body()?;

        #[allow(clippy::cast_possible_truncation)]
        let uncompressed_len = body.len() as u32;

        let stored = match compression {
            CompressionType::None => body,

            #[cfg(feature = "lz4")]
            CompressionType::Lz4 => lz4_flex::compress_prepend_size(&body),
        };

        #[allow(clippy::cast_possible_truncation)]
        let stored_len = stored.len() as u32;

        let mut checksummed = ChecksummedWriter::new(writer);
        compression.encode_into(&mut checksummed)?;
        checksummed.write_u32::<LittleEndian>(uncompressed_len)?;
        checksummed.write_u32::<LittleEndian>(stored_len)?;
        checksummed.write_all(&stored)?;
        let checksum = checksummed.checksum();

        let writer = checksummed.inner_mut();
        writer.write_u128::<LittleEndian>(checksum.into_u128())?;

        Ok(u64::from(1 + 4 + 4 + stored_len) + 16)
    }

    /// Reads back a frame written by [`Page::write_frame`], verifying its checksum.
    pub fn read_frame<R: Read>(reader: &mut R) -> crate::Result<Self> {
        // NOTE: We need the raw bytes to recompute the checksum, so buffer the
        // fixed-size header + payload before handing them to the decoders.
        let compression = CompressionType::decode_from(reader)?;
        let uncompressed_len = reader.read_u32::<LittleEndian>()?;
        let stored_len = reader.read_u32::<LittleEndian>()?;

        let mut stored = vec![0; stored_len as usize];
        reader.read_exact(&mut stored)?;

        let on_disk_checksum = Checksum::from_raw(reader.read_u128::<LittleEndian>()?);

        let mut hasher = xxhash_rust::xxh3::Xxh3Default::new();
        {
            let mut header = Vec::with_capacity(9);
            compression.encode_into(&mut header)?;
            header.write_u32::<LittleEndian>(uncompressed_len)?;
            header.write_u32::<LittleEndian>(stored_len)?;
            hasher.update(&header);
        }
        hasher.update(&stored);
        let computed_checksum = Checksum::from_raw(hasher.digest128());
        computed_checksum.check(on_disk_checksum)?;

        let body = match compression {
            CompressionType::None => stored,

            #[cfg(feature = "lz4")]
            CompressionType::Lz4 => lz4_flex::decompress_size_prepended(&stored)
                .map_err(|_| crate::Error::InvalidRun)?,
        };

        let mut cursor = Cursor::new(body);
        let item_count = cursor.read_u32_varint()?;
        let mut items = Vec::with_capacity(item_count as usize);

        for _ in 0..item_count {
            items.push(InternalValue::decode_from(&mut cursor)?);
        }

        Ok(Self { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType;
    use test_log::test;

    #[test]
    fn page_roundtrip() -> crate::Result<()> {
        let page = Page {
            items: vec![
                InternalValue::from_components(*b"a", *b"1", 0, ValueType::Value),
                InternalValue::from_components(*b"b", *b"2", 1, ValueType::Value),
                InternalValue::new_tombstone(*b"c", 2),
            ],
        };

        let mut buf = Vec::new();
        page.write_frame(&mut buf, CompressionType::None)?;

        let decoded = Page::read_frame(&mut Cursor::new(buf))?;
        assert_eq!(page.items, decoded.items);

        Ok(())
    }

    #[test]
    fn page_checksum_catches_corruption() -> crate::Result<()> {
        let page = Page {
            items: vec![InternalValue::from_components(
                *b"a",
                *b"1",
                0,
                ValueType::Value,
            )],
        };

        let mut buf = Vec::new();
        page.write_frame(&mut buf, CompressionType::None)?;

        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let result = Page::read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(crate::Error::InvalidChecksum { .. })));

        Ok(())
    }
}
