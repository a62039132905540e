//! Error taxonomy for dyadio
//!
//! - Unavailable service: [`StageError::LibraryNotFound`]. Only produced while
//!   connecting; a [`crate::Context`] turns it into a degraded, no-op context.
//! - Initialization failure: [`StageError::InitFailed`] and the fatal
//!   [`StageError::AbiMismatch`].
//! - Operation failure: [`StageError::OperationFailed`], never retried here.
//! - Usage errors: [`UsageError`], always reported immediately.
//!
//! Status codes returned by the native service are carried verbatim. Their
//! meaning belongs to the service, so they are never interpreted here.

use std::fmt;
use std::io;

use crate::config::ConfigError;

/// Foreign operations that can fail with a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Produce,
    Consume,
    ConsumeWithMetadata,
    GetMetadata,
    FreeMetadata,
    Finalize,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Produce => "produce",
            Operation::Consume => "consume",
            Operation::ConsumeWithMetadata => "consume_w_metadata",
            Operation::GetMetadata => "get_metadata",
            Operation::FreeMetadata => "free_metadata",
            Operation::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Programmer errors
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("'mode' argument not provided to open")]
    MissingMode,

    #[error("Invalid open mode: {0:?}")]
    InvalidMode(String),

    #[error("Context is already initialized; set `reinit` to initialize it again")]
    AlreadyInitialized,

    #[error("Metadata handle belongs to a different context")]
    ForeignMetadata,

    #[error("Underlying metadata object has already been freed")]
    MetadataReleased,

    #[error("Operation on a closed file: {0}")]
    FileClosed(String),

    #[error("Path contains an interior NUL byte: {0:?}")]
    NulInPath(String),

    #[error("Path too long: {len} bytes, max {max} bytes")]
    PathTooLong { len: usize, max: usize },

    #[error("Invalid option value: {0}")]
    InvalidOption(String),
}

/// Errors surfaced by the staging layer
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Cannot find {name}: {reason}")]
    LibraryNotFound { name: String, reason: String },

    #[error("Incompatible transfer-service library: {0}")]
    AbiMismatch(String),

    #[error("Could not initialize the transfer service (status {status})")]
    InitFailed { status: i32 },

    #[error("Transfer-service {op} failed with status {status}")]
    OperationFailed { op: Operation, status: i32 },

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StageError {
    /// Whether this error is a programmer error rather than a runtime failure
    pub fn is_usage(&self) -> bool {
        matches!(self, StageError::Usage(_))
    }

    /// Raw status code returned by the service, if any
    pub fn status(&self) -> Option<i32> {
        match self {
            StageError::InitFailed { status } | StageError::OperationFailed { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

pub type StageResult<T> = Result<T, StageError>;
