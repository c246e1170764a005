//! # Error Types Module
//!
//! Centralized error handling for the recorder.
//! Each concern gets its own error enum so callers can match on exactly
//! the failures their layer can produce.
//!
//! ## Error Types
//! - `BufferError`: ring-buffer arithmetic and bookkeeping violations
//! - `StorageError`: failures reported by the storage service
//! - `SessionError`: session lifecycle misuse plus wrapped buffer/storage errors
//! - `ConfigError`: configuration file I/O and parsing errors
//!
//! ## Severity
//! Buffer errors mean a core invariant was broken and are always propagated.
//! Storage errors during a normal flush are logged and retried; only the
//! finish path reports them to the caller, in aggregate.

use crate::source::SourceKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by `CircularTimeframe` and its pointer arithmetic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Internal bookkeeping implies more live samples than slots
    #[error("timeframe holds {live} live samples but capacity is {capacity}")]
    CapacityInvariantViolation { live: usize, capacity: usize },
    /// Tried to pop more samples than are live
    #[error("attempted to pop {requested} samples but only {available} are live")]
    Underflow { requested: usize, available: usize },
    /// Pointer moved further than the number of valid elements
    #[error("attempted to shift the pointer {shift} positions across {element_count} elements")]
    ShiftOutOfRange { shift: isize, element_count: usize },
    /// Insert into a timeframe that was sealed by a label transition
    #[error("timeframe is sealed and accepts no further samples")]
    Sealed,
}

/// Errors reported by a `StorageService` or the writer task in front of it
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file has an open handle; reading or reopening it now is unsafe
    #[error("file is busy: {}", .0.display())]
    FileBusy(PathBuf),
    #[error("unknown storage handle {0}")]
    UnknownHandle(u64),
    #[error("no such file or directory: {}", .0.display())]
    NotFound(PathBuf),
    /// Failure produced on purpose by `MemoryStorage` fault injection
    #[error("injected failure: {0}")]
    Injected(String),
    /// The background writer for a stream stopped before answering
    #[error("stream writer is no longer running")]
    WriterGone,
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that can occur while building, running or finishing a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("source {0} is already attached")]
    DuplicateSource(SourceKind),
    #[error("unsupported source type: {0}")]
    UnsupportedSource(String),
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    /// A label may not start before the label it follows
    #[error("label starting at {requested} would overlap label starting at {previous}")]
    LabelOutOfOrder { previous: i64, requested: i64 },
    #[error("source {0} is not attached")]
    UnknownSource(SourceKind),
    /// Every sample of a source carries one value per component
    #[error("{kind} samples have {expected} values, got {found}")]
    SampleWidth {
        kind: SourceKind,
        expected: usize,
        found: usize,
    },
    #[error("driver for {kind} failed: {reason}")]
    Driver { kind: SourceKind, reason: String },
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("Failed to write config file: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
