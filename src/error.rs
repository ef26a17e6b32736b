//! Unified error channel for the storage core.
//!
//! Every public entry point in the crate returns [`Result`]. The error
//! carries a machine-matchable [`ErrorKind`] plus, where useful, a short
//! human-readable message. Internal helpers either return the same type
//! or are infallible.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The bare classification of an [`Error`], without any payload.
///
/// Useful for matching in callers that do not care about the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidArg,
    NotFound,
    AlreadyExists,
    OutOfMemory,
    Io,
    Corrupted,
    Busy,
    Timeout,
    Full,
    Empty,
    Closed,
    Immutable,
    TooLarge,
    Internal,
}

/// Errors surfaced by the storage core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument was rejected (empty key, zero shard count, …).
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The requested key or record does not exist.
    #[error("not found")]
    NotFound,

    /// The entity being created already exists.
    #[error("already exists")]
    AlreadyExists,

    /// An allocation was refused.
    #[error("out of memory")]
    OutOfMemory,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk state failed integrity validation.
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// A `try_`-style acquisition found the resource held.
    #[error("resource busy")]
    Busy,

    /// A bounded retry loop exhausted its budget.
    #[error("retry budget exhausted")]
    Timeout,

    /// A capacity bound was hit (memtable budget, segment cap).
    #[error("full: {0}")]
    Full(String),

    /// The structure holds no entries.
    #[error("empty")]
    Empty,

    /// The handle was closed; no further operations are accepted.
    #[error("closed")]
    Closed,

    /// The memtable is sealed for flushing and rejects writes.
    #[error("memtable is immutable")]
    Immutable,

    /// A key or value exceeds its configured size bound.
    #[error("too large: {0}")]
    TooLarge(String),

    /// Invariant violation that should never surface in correct use.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the bare [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArg(_) => ErrorKind::InvalidArg,
            Error::NotFound => ErrorKind::NotFound,
            Error::AlreadyExists => ErrorKind::AlreadyExists,
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            Error::Io(_) => ErrorKind::Io,
            Error::Corrupted(_) => ErrorKind::Corrupted,
            Error::Busy => ErrorKind::Busy,
            Error::Timeout => ErrorKind::Timeout,
            Error::Full(_) => ErrorKind::Full,
            Error::Empty => ErrorKind::Empty,
            Error::Closed => ErrorKind::Closed,
            Error::Immutable => ErrorKind::Immutable,
            Error::TooLarge(_) => ErrorKind::TooLarge,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the error indicates a missing key rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
