// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod id;
pub mod iter;
pub mod meta;
pub mod page;
pub mod writer;

use crate::{
    checksum::Checksum,
    coding::Decode,
    descriptor_table::FileDescriptorTable,
    file::read_exact,
    fs::FileSystem,
    value::SeqNo,
    UserKey,
};
use byteorder::{LittleEndian, ReadBytesExt};
use id::{GlobalRunId, RangeId, RunId};
use meta::RunMeta;
use std::{
    fs::File,
    io::{BufReader, Cursor, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

pub use writer::RunWriter;

/// Fixed-size footer written at the very end of a run file.
const FOOTER_LEN: u64 = 8 + 4 + 4;

/// A single entry in a run's page index, pointing at one page's byte range.
#[derive(Clone, Debug)]
pub(crate) struct PageIndexEntry {
    pub min_key: UserKey,
    pub offset: u64,
    pub length: u64,
}

struct Trailer {
    meta: RunMeta,
    page_index: Vec<PageIndexEntry>,
}

fn read_trailer(file: &File) -> crate::Result<Trailer> {
    let file_len = file.metadata()?.len();

    if file_len < FOOTER_LEN {
        return Err(crate::Error::InvalidRun);
    }

    let footer = read_exact(file, file_len - FOOTER_LEN, FOOTER_LEN as usize)?;
    let mut footer_reader = Cursor::new(&*footer);

    let trailer_offset = footer_reader.read_u64::<LittleEndian>()?;
    let trailer_len = footer_reader.read_u32::<LittleEndian>()?;

    let mut magic = [0; 4];
    footer_reader.read_exact(&mut magic)?;
    if magic != crate::file::MAGIC_BYTES {
        return Err(crate::Error::InvalidRun);
    }

    let trailer_bytes = read_exact(file, trailer_offset, trailer_len as usize)?;

    // The trailer's own checksum covers everything except the checksum field
    // itself (the last 16 bytes).
    let Some(payload_len) = (trailer_len as usize).checked_sub(16) else {
        return Err(crate::Error::InvalidRun);
    };

    #[allow(clippy::indexing_slicing)]
    let payload = &trailer_bytes[..payload_len];
    #[allow(clippy::indexing_slicing)]
    let stored_checksum_bytes = &trailer_bytes[payload_len..];

    let mut stored_checksum_reader = Cursor::new(stored_checksum_bytes);
    let stored_checksum = Checksum::from_raw(stored_checksum_reader.read_u128::<LittleEndian>()?);

    let computed_checksum = Checksum::from_raw(xxhash_rust::xxh3::xxh3_128(payload));
    computed_checksum.check(stored_checksum)?;

    let mut reader = Cursor::new(payload);
    let meta = RunMeta::decode_from(&mut reader)?;

    let page_count = reader.read_u32::<LittleEndian>()?;
    let mut page_index = Vec::with_capacity(page_count as usize);

    for _ in 0..page_count {
        let key_len = reader.read_u16::<LittleEndian>()?;
        let mut min_key = vec![0; key_len.into()];
        reader.read_exact(&mut min_key)?;

        let offset = reader.read_u64::<LittleEndian>()?;
        let length = reader.read_u64::<LittleEndian>()?;

        page_index.push(PageIndexEntry {
            min_key: min_key.into(),
            offset,
            length,
        });
    }

    Ok(Trailer { meta, page_index })
}

/// An immutable, sorted run of statements persisted on disk.
///
/// A run is produced either by dumping a mem or by compacting a set of runs.
/// Once written, a run's bytes never change; compaction replaces runs
/// wholesale rather than mutating them in place.
pub struct Run {
    pub(crate) id: GlobalRunId,
    pub(crate) path: PathBuf,
    pub(crate) meta: RunMeta,
    pub(crate) page_index: Vec<PageIndexEntry>,
    pub(crate) descriptor_table: Arc<FileDescriptorTable>,
}

impl Run {
    /// Recovers a run from an existing file on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, or its trailer is invalid.
    pub fn recover<P: AsRef<Path>>(
        path: P,
        range_id: RangeId,
        run_id: RunId,
        descriptor_table: Arc<FileDescriptorTable>,
    ) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = crate::fs::StdFileSystem::open(&path)?;

        let trailer = read_trailer(&file)?;
        let id = GlobalRunId::from((range_id, run_id));

        descriptor_table.insert(path.clone(), id);

        Ok(Self {
            id,
            path,
            meta: trailer.meta,
            page_index: trailer.page_index,
            descriptor_table,
        })
    }

    /// Returns the run's globally unique ID.
    #[must_use]
    pub fn global_id(&self) -> GlobalRunId {
        self.id
    }

    /// Returns the run's metadata.
    #[must_use]
    pub fn metadata(&self) -> &RunMeta {
        &self.meta
    }

    /// Returns the number of pages in the run.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_index.len()
    }

    /// Returns `true` if `key` cannot possibly be contained in this run,
    /// based on its `[min_key, max_key]` bounds.
    #[must_use]
    pub fn key_out_of_bounds(&self, key: &[u8]) -> bool {
        key < &*self.meta.min_key || key > &*self.meta.max_key
    }

    /// Locates the index of the page that may contain `key`, if any.
    ///
    /// Pages are ordered by ascending min-key, so this is a binary search
    /// over `page_index` for the last page whose min-key is `<= key`.
    #[must_use]
    pub(crate) fn page_for_key(&self, key: &[u8]) -> Option<usize> {
        if self.page_index.is_empty() || self.key_out_of_bounds(key) {
            return None;
        }

        let idx = self
            .page_index
            .partition_point(|entry| &*entry.min_key <= key);

        idx.checked_sub(1)
    }

    /// Reads and decodes the page at `page_no`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page's checksum does not match, or I/O fails.
    pub(crate) fn read_page(&self, page_no: usize) -> crate::Result<page::Page> {
        let entry = self
            .page_index
            .get(page_no)
            .ok_or(crate::Error::InvalidRun)?;

        let guard = self
            .descriptor_table
            .access(&self.id)?
            .ok_or(crate::Error::InvalidRun)?;

        let bytes = {
            let mut file = guard.file.lock().expect("lock is poisoned");
            read_exact(file.get_ref(), entry.offset, entry.length as usize)?
        };

        page::Page::read_frame(&mut BufReader::new(Cursor::new(&*bytes)))
    }

    /// Returns the run's highest sequence number.
    #[must_use]
    pub fn max_lsn(&self) -> SeqNo {
        self.meta.max_lsn
    }

    /// Returns the run's lowest sequence number.
    #[must_use]
    pub fn min_lsn(&self) -> SeqNo {
        self.meta.min_lsn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value::InternalValue, CompressionType, ValueType};
    use test_log::test;

    #[test]
    fn run_write_recover_point_read() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("1.1.run");

        {
            let file = std::fs::File::create(&path)?;
            let mut writer = RunWriter::new(file, 64, CompressionType::None);

            for i in 0u32..500 {
                writer.write(InternalValue::from_components(
                    format!("key-{i:04}").into_bytes(),
                    format!("value-{i:04}").into_bytes(),
                    u64::from(i),
                    ValueType::Value,
                ))?;
            }

            writer.finish()?;
        }

        let descriptor_table = Arc::new(FileDescriptorTable::new(16, 1));
        let run = Run::recover(&path, 1, 1, descriptor_table)?;

        assert_eq!(500, run.metadata().item_count);
        assert!(run.page_count() > 1);

        let page_no = run.page_for_key(b"key-0250").expect("should find page");
        let page = run.read_page(page_no)?;

        assert!(page
            .items
            .iter()
            .any(|item| &*item.key.user_key == b"key-0250"));

        Ok(())
    }

    #[test]
    fn run_key_out_of_bounds() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("1.2.run");

        {
            let file = std::fs::File::create(&path)?;
            let mut writer = RunWriter::new(file, 4_096, CompressionType::None);

            for i in 0u32..10 {
                writer.write(InternalValue::from_components(
                    format!("key-{i:04}").into_bytes(),
                    b"v".to_vec(),
                    u64::from(i),
                    ValueType::Value,
                ))?;
            }

            writer.finish()?;
        }

        let descriptor_table = Arc::new(FileDescriptorTable::new(16, 1));
        let run = Run::recover(&path, 1, 2, descriptor_table)?;

        assert!(run.key_out_of_bounds(b"a"));
        assert!(run.key_out_of_bounds(b"zzz"));
        assert!(!run.key_out_of_bounds(b"key-0005"));

        Ok(())
    }
}
