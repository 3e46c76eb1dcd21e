// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    descriptor_table::FileDescriptorTable, path::absolute_path, CompressionType,
    SequenceNumberCounter,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Default target size of a range before it is split, 64 `KiB`.
pub const DEFAULT_RANGE_SIZE: u64 = 64 * 1_024;

/// Default target size of a run page, 8 `KiB`.
pub const DEFAULT_PAGE_SIZE: u32 = 8 * 1_024;

/// Default number of runs in a range that triggers compaction.
pub const DEFAULT_COMPACT_WATERMARK: usize = 4;

/// Default number of background worker threads.
pub const DEFAULT_THREADS: usize = 1;

/// Engine configuration builder
///
/// Mirrors the `vinyl.*` configuration namespace: directory, memory limit,
/// worker thread count, range size, page size and the compaction watermark.
pub struct Config {
    /// Directory the engine stores its files in (`vinyl_dir`).
    #[doc(hidden)]
    pub path: PathBuf,

    /// Shared file descriptor table.
    #[doc(hidden)]
    pub descriptor_table: Arc<FileDescriptorTable>,

    /// Soft memory quota shared by all mems (`memory_limit`).
    pub memory_limit: u64,

    /// Number of background dump/compaction worker threads (`vinyl.threads`).
    pub threads: usize,

    /// Target uncompressed size of a range before it is split.
    pub range_size: u64,

    /// Target size of a run page.
    pub page_size: u32,

    /// Number of runs accumulated in a range before compaction is scheduled.
    pub compact_wm: usize,

    /// Compression used for newly-written run pages.
    pub page_compression: CompressionType,

    /// The global sequence number generator, shared between all ranges of a database.
    pub(crate) seqno: SequenceNumberCounter,

    /// The lowest sequence number visible to any open read view (`vlsn`).
    pub(crate) visible_seqno: SequenceNumberCounter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: absolute_path(Path::new(".vinyl")),
            descriptor_table: Arc::new(FileDescriptorTable::new(256, 1)),

            memory_limit: /* 128 MiB */ 128 * 1_024 * 1_024,
            threads: DEFAULT_THREADS,
            range_size: DEFAULT_RANGE_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            compact_wm: DEFAULT_COMPACT_WATERMARK,

            #[cfg(feature = "lz4")]
            page_compression: CompressionType::Lz4,

            #[cfg(not(feature = "lz4"))]
            page_compression: CompressionType::None,

            seqno: SequenceNumberCounter::default(),
            visible_seqno: SequenceNumberCounter::default(),
        }
    }
}

impl Config {
    /// Initializes a new config rooted at `path` (`vinyl_dir`).
    pub fn new<P: AsRef<Path>>(
        path: P,
        seqno: SequenceNumberCounter,
        visible_seqno: SequenceNumberCounter,
    ) -> Self {
        Self {
            path: absolute_path(path.as_ref()),
            seqno,
            visible_seqno,
            ..Default::default()
        }
    }

    /// Sets the shared file descriptor table.
    #[must_use]
    pub fn use_descriptor_table(mut self, descriptor_table: Arc<FileDescriptorTable>) -> Self {
        self.descriptor_table = descriptor_table;
        self
    }

    /// Sets the soft memory quota shared by all mems (`memory_limit`).
    ///
    /// When the quota is exceeded, writers are throttled until a dump frees
    /// memory.
    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Sets the number of background worker threads (`vinyl.threads`).
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn threads(mut self, n: usize) -> Self {
        assert!(n > 0, "must have at least one worker thread");
        self.threads = n;
        self
    }

    /// Sets the target range size before a split is triggered.
    #[must_use]
    pub fn range_size(mut self, bytes: u64) -> Self {
        self.range_size = bytes;
        self
    }

    /// Sets the target run page size.
    #[must_use]
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the number of runs that trigger compaction of a range.
    #[must_use]
    pub fn compact_wm(mut self, n: usize) -> Self {
        self.compact_wm = n;
        self
    }

    /// Sets the compression algorithm used for new run pages.
    #[must_use]
    pub fn page_compression(mut self, compression: CompressionType) -> Self {
        self.page_compression = compression;
        self
    }
}
