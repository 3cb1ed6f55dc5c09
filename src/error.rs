//! Summary: Error types for the thunderbox database layer.
//! Copyright (c) YOAB. All rights reserved.
//!
//! Every [`Error`] carries the [`ErrorKind`] that caused it plus a backtrace
//! captured where it was created. Callers match on [`Error::kind`] to test
//! the cause; the backtrace is only collected when `RUST_BACKTRACE` is set.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for thunderbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The cause of a failed operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O error from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The database file could not be opened or created.
    #[error("failed to open database file '{}': {source}", .path.display())]
    FileOpen { path: PathBuf, source: io::Error },

    /// The file lock was not acquired in time.
    #[error("timed out waiting for the database file lock")]
    Timeout,

    /// Database file contents are inconsistent.
    #[error("database corrupted while {context}: {details}")]
    Corrupted {
        context: &'static str,
        details: String,
    },

    /// A meta page failed validation.
    #[error("invalid meta page {page_number}: {reason}")]
    InvalidMetaPage {
        page_number: u64,
        reason: &'static str,
    },

    /// Neither meta page is usable.
    #[error("both meta pages are invalid")]
    BothMetaPagesInvalid,

    /// The database has been closed.
    #[error("database not open")]
    DatabaseClosed,

    /// A write was attempted on a database opened read-only.
    #[error("database is in read-only mode")]
    DatabaseReadOnly,

    /// The database still has live transactions.
    #[error("cannot close database: {count} transaction(s) still open")]
    TxStillOpen { count: usize },

    /// A write was attempted through a read-only transaction.
    #[error("transaction not writable")]
    TxNotWritable,

    /// Persisting a commit failed; the transaction was rolled back.
    #[error("transaction commit failed: {reason}")]
    TxCommitFailed { reason: String, source: io::Error },

    /// Bucket name is empty or too long.
    #[error("invalid bucket name: {reason}")]
    InvalidBucketName { reason: &'static str },

    /// Bucket already exists.
    #[error("bucket already exists: {}", String::from_utf8_lossy(.name))]
    BucketExists { name: Vec<u8> },

    /// Bucket does not exist.
    #[error("bucket not found: {}", String::from_utf8_lossy(.name))]
    BucketNotFound { name: Vec<u8> },

    /// Key is empty.
    #[error("key required")]
    KeyRequired,

    /// Key exceeds the maximum key size.
    #[error("key too large: {len} bytes")]
    KeyTooLarge { len: usize },

    /// Value exceeds the maximum value size.
    #[error("value too large: {len} bytes")]
    ValueTooLarge { len: usize },

    /// A value was used where a bucket is stored, or the reverse.
    #[error("incompatible value")]
    IncompatibleValue,

    /// The bucket sequence cannot be incremented further.
    #[error("bucket sequence overflow")]
    SequenceOverflow,

    /// A path-addressed operation was given no segments.
    #[error("path must contain at least one segment")]
    EmptyPath,

    /// A [`RefCountBox`](crate::RefCountBox) has no data path configured.
    #[error("data path of the reference-counted box was not specified")]
    DataPathNotSpecified,

    /// A batched update could not be applied.
    #[error("batch failed: {reason}")]
    BatchFailed { reason: String },

    /// A batched function panicked. The panic was contained to its caller.
    #[error("batch function panicked: {message}")]
    BatchPanicked { message: String },

    /// Value encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Error returned by a caller-supplied function.
    #[error("{0}")]
    Callback(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Error returned by all thunderbox operations.
pub struct Error {
    kind: Box<ErrorKind>,
    backtrace: Backtrace,
}

impl Error {
    /// Wraps an error produced by caller code (a work function, a visitor,
    /// an open strategy) so it can travel through thunderbox results.
    pub fn callback<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        ErrorKind::Callback(err.into()).into()
    }

    /// Returns the cause of this error.
    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Consumes the error, returning its cause.
    pub fn into_kind(self) -> ErrorKind {
        *self.kind
    }

    /// Returns the backtrace captured when the error was created.
    #[inline]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Returns the caller error wrapped by [`Error::callback`] if it is an `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self.kind() {
            ErrorKind::Callback(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\n\nStack backtrace:\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.kind() {
            ErrorKind::Callback(inner) => std::error::Error::source(inner.as_ref()),
            kind => std::error::Error::source(kind),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(err).into()
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        ErrorKind::Codec(err).into()
    }
}
