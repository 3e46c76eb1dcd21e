// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A K.I.S.S. implementation of the core of a log-structured merge-tree
//! (LSM-tree) storage engine, modeled on Tarantool's Vinyl engine.
//!
//! ##### About
//!
//! The engine stores an ordered keyspace split into [`Range`](run::Run)-sized
//! partitions. Each range owns one active [`Mem`] (an in-memory write
//! buffer) plus a list of frozen mems and on-disk [`run::Run`]s. Writes land
//! in the active mem; once a mem grows past a threshold it is frozen and
//! dumped to a new run in the background. Runs amassing on disk are
//! periodically merged by compaction.
//!
//! Because maintaining an efficient on-disk structure is deferred to the
//! background scheduler, writing to the engine is O(1): it only inserts into
//! an in-memory skip list.
//!
//! Keys are limited to 65536 bytes, values are limited to 2^32 bytes.
//!
//! # Example usage
//!
//! ```
//! use vinyl_tree::{Config, Mem, SequenceNumberCounter, ValueType};
//! use vinyl_tree::value::InternalValue;
//!
//! # let folder = tempfile::tempdir()?;
//! let seqno = SequenceNumberCounter::default();
//! let config = Config::new(folder, seqno.clone(), SequenceNumberCounter::default());
//!
//! let mem = Mem::new(0);
//! mem.insert(InternalValue::from_components(
//!     "my_key",
//!     "my_value",
//!     seqno.next(),
//!     ValueType::Value,
//! ));
//!
//! let item = mem.get("my_key", u64::MAX);
//! assert_eq!(Some("my_value".as_bytes()), item.map(|v| v.value.to_vec()).as_deref());
//! #
//! # Ok::<(), vinyl_tree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod binary_search;
mod bounds;
mod checksum;
mod clipping_iter;
mod coding;
mod compression;
mod config;

#[doc(hidden)]
pub mod descriptor_table;

mod double_ended_peekable;
mod either;
mod error;
mod fallible_clipping_iter;

#[doc(hidden)]
pub mod file;

mod fs;
mod hash;
#[doc(hidden)]
pub mod index;

#[doc(hidden)]
pub mod iters;

mod key;
pub mod mem;

#[doc(hidden)]
pub mod merge;

mod merge_peekable;

mod path;

#[doc(hidden)]
pub mod quota;

#[doc(hidden)]
pub mod range;

#[doc(hidden)]
pub mod recovery;

#[doc(hidden)]
pub mod run;

#[doc(hidden)]
pub mod scheduler;

mod seqno;
mod slice;

#[doc(hidden)]
pub mod stop_signal;

mod time;

#[doc(hidden)]
pub mod transaction;

mod upsert;
mod util;
pub mod value;

#[doc(hidden)]
pub mod write_iter;

/// KV-tuple, typically returned by an iterator
pub type KvPair = (UserKey, UserValue);

#[doc(hidden)]
pub use {merge::BoxedIterator, value::InternalValue};

pub use {
    checksum::Checksum,
    coding::{Decode, DecodeError, Encode, EncodeError},
    compression::CompressionType,
    config::Config,
    error::{Error, Result},
    index::Index,
    iters::ReadIter,
    mem::{Mem, MemId},
    quota::Quota,
    range::Range,
    recovery::{gc as recovery_gc, recover},
    run::{id::GlobalRunId, Run, RunWriter},
    scheduler::{Completion, Scheduler},
    seqno::SequenceNumberCounter,
    slice::Slice,
    transaction::{Transaction, TransactionManager, TxnState, TxnType},
    upsert::{apply_upsert, UpsertMerge},
    util::prefixed_range,
    value::{ItemSize, SeqNo, UserKey, UserValue, ValueType},
    write_iter::{write_iter, WriteIter},
};
