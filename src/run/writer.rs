// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{meta::RunMeta, page::Page};
use crate::{
    checksum::ChecksummedWriter, coding::Encode, file::MAGIC_BYTES, value::InternalValue,
    CompressionType, ItemSize, UserKey,
};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Fixed-size trailer describing where the run's trailer lives.
///
/// Always the last 16 bytes of a run file: `u64 trailer_offset`,
/// `u32 trailer_len`, 4 magic bytes.
const FOOTER_LEN: u64 = 8 + 4 + 4;

struct PageIndexEntry {
    min_key: UserKey,
    offset: u64,
    length: u64,
}

/// Builds a run file from a sorted stream of statements.
///
/// Statements must be fed in `(user_key asc, seqno desc)` order, matching
/// what a mem's iterator or a merge iterator already produces. Pages are
/// flushed once their uncompressed size reaches the configured page size.
pub struct RunWriter<W: Write> {
    writer: W,
    compression: CompressionType,
    page_size: u32,

    offset: u64,
    current_page: Vec<InternalValue>,
    current_page_size: u32,

    page_index: Vec<PageIndexEntry>,

    min_lsn: u64,
    max_lsn: u64,
    item_count: u64,
    total_bytes: u64,
    min_key: Option<UserKey>,
    max_key: Option<UserKey>,
}

impl<W: Write> RunWriter<W> {
    /// Creates a new run writer over `writer`, targeting `page_size`-byte pages.
    pub fn new(writer: W, page_size: u32, compression: CompressionType) -> Self {
        Self {
            writer,
            compression,
            page_size,
            offset: 0,
            current_page: Vec::new(),
            current_page_size: 0,
            page_index: Vec::new(),
            min_lsn: u64::MAX,
            max_lsn: 0,
            item_count: 0,
            total_bytes: 0,
            min_key: None,
            max_key: None,
        }
    }

    /// Appends a statement to the run.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing the current page to the writer fails.
    pub fn write(&mut self, item: InternalValue) -> crate::Result<()> {
        self.min_lsn = self.min_lsn.min(item.key.seqno);
        self.max_lsn = self.max_lsn.max(item.key.seqno);
        self.item_count += 1;

        if self.min_key.is_none() {
            self.min_key = Some(item.key.user_key.clone());
        }
        self.max_key = Some(item.key.user_key.clone());

        let item_size = item.size();
        self.total_bytes += item_size as u64;

        #[allow(clippy::cast_possible_truncation)]
        let item_size = item_size as u32;

        self.current_page.push(item);
        self.current_page_size += item_size;

        if self.current_page_size >= self.page_size {
            self.flush_page()?;
        }

        Ok(())
    }

    fn flush_page(&mut self) -> crate::Result<()> {
        if self.current_page.is_empty() {
            return Ok(());
        }

        let page = Page {
            items: std::mem::take(&mut self.current_page),
        };
        self.current_page_size = 0;

        let min_key = page
            .min_key()
            .expect("page should be non-empty")
            .to_vec()
            .into();

        let length = page.write_frame(&mut self.writer, self.compression)?;

        self.page_index.push(PageIndexEntry {
            min_key,
            offset: self.offset,
            length,
        });
        self.offset += length;

        Ok(())
    }

    /// Flushes any buffered statements and writes the run's trailer and footer.
    ///
    /// Returns the total size of the run file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the underlying writer fails.
    pub fn finish(mut self) -> crate::Result<u64> {
        self.flush_page()?;

        let meta = RunMeta {
            min_lsn: if self.item_count == 0 { 0 } else { self.min_lsn },
            max_lsn: self.max_lsn,
            item_count: self.item_count,
            page_count: self
                .page_index
                .len()
                .try_into()
                .expect("page count should fit into u32"),
            total_bytes: self.total_bytes,
            compression: self.compression,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or_default(),
        };

        let trailer_offset = self.offset;

        let mut checksummed = ChecksummedWriter::new(CountingWriter::new(&mut self.writer));
        meta.encode_into(&mut checksummed)?;

        checksummed.write_u32::<LittleEndian>(
            self.page_index
                .len()
                .try_into()
                .expect("page count should fit into u32"),
        )?;

        for entry in &self.page_index {
            #[allow(clippy::cast_possible_truncation)]
            checksummed.write_u16::<LittleEndian>(entry.min_key.len() as u16)?;
            checksummed.write_all(&entry.min_key)?;
            checksummed.write_u64::<LittleEndian>(entry.offset)?;
            checksummed.write_u64::<LittleEndian>(entry.length)?;
        }

        let checksum = checksummed.checksum();
        let counting = checksummed.inner_mut();
        counting.write_u128::<LittleEndian>(checksum.into_u128())?;

        let trailer_len = counting.count();

        self.writer.write_u64::<LittleEndian>(trailer_offset)?;
        self.writer.write_u32::<LittleEndian>(
            trailer_len
                .try_into()
                .expect("trailer length should fit into u32"),
        )?;
        self.writer.write_all(&MAGIC_BYTES)?;

        self.writer.flush()?;

        Ok(trailer_offset + trailer_len + FOOTER_LEN)
    }
}

/// Counts bytes written through it, so the trailer's own length can be
/// recorded in the footer without requiring the underlying writer to be
/// seekable.
struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
