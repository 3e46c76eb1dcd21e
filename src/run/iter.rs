// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{page::Page, Run};
use crate::value::{InternalValue, SeqNo};
use std::sync::Arc;

/// A tiny 2-slot page cache local to one iterator.
///
/// Forward/backward scans mostly touch the current page and, at a page
/// boundary, the next/previous one - two slots cover that without needing a
/// shared cache lookup per item.
struct PageSlot {
    page_no: usize,
    page: Arc<Page>,
}

/// Iterates a single run's statements in key order, filtering out versions
/// not visible at a given sequence number.
///
/// Given a read snapshot `vlsn`, only the newest version of each key with
/// `seqno <= vlsn` is surfaced; older versions of the same key are skipped
/// unless the caller explicitly asks to see them via [`RunIter::seek_older`].
pub struct RunIter {
    run: Arc<Run>,
    vlsn: SeqNo,

    slots: Vec<PageSlot>,

    front_page_no: Option<usize>,
    front_item_idx: usize,
}

impl RunIter {
    /// Creates an iterator over the whole run, visible at `vlsn`.
    #[must_use]
    pub fn new(run: Arc<Run>, vlsn: SeqNo) -> Self {
        let page_count = run.page_count();

        Self {
            run,
            vlsn,
            slots: Vec::with_capacity(2),
            front_page_no: if page_count == 0 { None } else { Some(0) },
            front_item_idx: 0,
        }
    }

    /// Creates an iterator positioned at the first key `>= key`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the starting page fails.
    pub fn seek(run: Arc<Run>, vlsn: SeqNo, key: &[u8]) -> crate::Result<Self> {
        let mut iter = Self::new(run, vlsn);

        let Some(page_no) = iter.run.page_for_key(key) else {
            // Either out of bounds (before min_key, in which case start at
            // page 0) or the run is empty.
            if key < &*iter.run.meta.min_key {
                return Ok(iter);
            }

            iter.front_page_no = None;
            return Ok(iter);
        };

        iter.front_page_no = Some(page_no);

        let page = iter.load(page_no)?;
        iter.front_item_idx = page
            .items
            .partition_point(|item| &*item.key.user_key < key);

        if iter.front_item_idx >= page.items.len() {
            iter.front_page_no = Some(page_no + 1);
            iter.front_item_idx = 0;
        }

        Ok(iter)
    }

    fn load(&mut self, page_no: usize) -> crate::Result<Arc<Page>> {
        if let Some(slot) = self.slots.iter().find(|slot| slot.page_no == page_no) {
            return Ok(slot.page.clone());
        }

        let page = Arc::new(self.run.read_page(page_no)?);

        if self.slots.len() >= 2 {
            self.slots.remove(0);
        }
        self.slots.push(PageSlot {
            page_no,
            page: page.clone(),
        });

        Ok(page)
    }

    /// Returns the next statement visible at `vlsn`, skipping older duplicate
    /// versions of the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if reading a page fails or its checksum is invalid.
    pub fn next(&mut self) -> crate::Result<Option<InternalValue>> {
        loop {
            let Some(page_no) = self.front_page_no else {
                return Ok(None);
            };

            let page = self.load(page_no)?;

            if self.front_item_idx >= page.items.len() {
                self.front_page_no = Some(page_no + 1);
                self.front_item_idx = 0;

                if Some(page_no + 1) >= Some(self.run.page_count()) {
                    self.front_page_no = None;
                }

                continue;
            }

            let item = page
                .items
                .get(self.front_item_idx)
                .expect("index checked above")
                .clone();
            self.front_item_idx += 1;

            if item.key.seqno > self.vlsn {
                // Not visible yet at this read snapshot - skip it, but also
                // skip any further (older) versions of the same key so we
                // surface at most one version per key per call to `next`.
                continue;
            }

            self.skip_older_versions_of(&item.key.user_key, page_no)?;

            return Ok(Some(item));
        }
    }

    fn skip_older_versions_of(&mut self, key: &[u8], mut page_no: usize) -> crate::Result<()> {
        loop {
            let page = self.load(page_no)?;

            while self.front_item_idx < page.items.len() {
                #[allow(clippy::indexing_slicing)]
                let next = &page.items[self.front_item_idx];

                if &*next.key.user_key != key {
                    return Ok(());
                }

                self.front_item_idx += 1;
            }

            page_no += 1;
            self.front_page_no = Some(page_no);
            self.front_item_idx = 0;

            if page_no >= self.run.page_count() {
                self.front_page_no = None;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{descriptor_table::FileDescriptorTable, run::RunWriter, CompressionType, ValueType};
    use test_log::test;

    fn build_run(dir: &std::path::Path, name: &str, items: &[(&str, SeqNo, &str)]) -> Arc<Run> {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = RunWriter::new(file, 64, CompressionType::None);

        for (key, seqno, value) in items {
            writer
                .write(InternalValue::from_components(
                    key.as_bytes().to_vec(),
                    value.as_bytes().to_vec(),
                    *seqno,
                    ValueType::Value,
                ))
                .unwrap();
        }
        writer.finish().unwrap();

        let descriptor_table = Arc::new(FileDescriptorTable::new(16, 1));
        Arc::new(Run::recover(&path, 1, 1, descriptor_table).unwrap())
    }

    #[test]
    fn run_iter_mvcc_skips_older_versions() {
        let dir = tempfile::tempdir().unwrap();
        let run = build_run(
            dir.path(),
            "1.1.run",
            &[("a", 0, "a0"), ("a", 1, "a1"), ("b", 0, "b0")],
        );

        let mut iter = RunIter::new(run, SeqNo::MAX);

        let first = iter.next().unwrap().unwrap();
        assert_eq!(&*first.key.user_key, b"a");
        assert_eq!(&*first.value, b"a1");

        let second = iter.next().unwrap().unwrap();
        assert_eq!(&*second.key.user_key, b"b");

        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn run_iter_seek_mid_run() {
        let dir = tempfile::tempdir().unwrap();

        let items: Vec<(&str, SeqNo, &str)> =
            vec![("a", 0, "a"), ("b", 0, "b"), ("c", 0, "c"), ("d", 0, "d")];
        let run = build_run(dir.path(), "1.1.run", &items);

        let mut iter = RunIter::seek(run, SeqNo::MAX, b"c").unwrap();
        let item = iter.next().unwrap().unwrap();
        assert_eq!(&*item.key.user_key, b"c");
    }
}
