// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    Checksum, CompressionType,
};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// A run's data or index page failed its checksum
    InvalidChecksum {
        /// Checksum stored in the page trailer
        expected: Checksum,
        /// Checksum recomputed from the page bytes
        got: Checksum,
    },

    /// A run file's header or trailer did not have the expected layout
    InvalidRun,

    /// On-disk format version is not one this build understands
    FormatMismatch,

    /// Some required runs could not be recovered from disk
    Unrecoverable,

    /// The memory quota was exceeded and the caller requested no waiting
    OutOfMemory,

    /// A REPLACE/UPDATE found an existing tuple where none was expected
    TupleFound,

    /// A statement that requires an existing tuple did not find one
    TupleNotFound,

    /// An UPDATE attempted to modify a primary key field
    CantUpdatePrimaryKey,

    /// A transaction's read-set or write-set conflicted with a committed transaction
    TransactionConflict,

    /// A unique index lookup unexpectedly matched more than one tuple
    MoreThanOneTuple,

    /// An UPSERT produced a value that would violate a unique secondary key
    UpsertUniqueSecondaryKey,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageEngineError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
