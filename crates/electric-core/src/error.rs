//! Shape engine errors

use crate::handle::HandleError;
use thiserror::Error;

/// Wire-level error category.
///
/// Every core error maps onto exactly one category; the HTTP layer renders
/// the category as the `error` field of the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    BadRequest,
    ShapeGone,
    NotFound,
    Unavailable,
    Internal,
}

impl ErrorCategory {
    /// Code emitted in the `{error, message}` body
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::BadRequest => "bad_request",
            ErrorCategory::ShapeGone => "shape_gone",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Internal => "internal_error",
        }
    }

    /// HTTP status for the category
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCategory::BadRequest => 400,
            ErrorCategory::ShapeGone => 409,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Unavailable => 503,
            ErrorCategory::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape engine error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid offset: {0}")]
    InvalidOffset(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(#[from] HandleError),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("invalid columns: {0}")]
    InvalidColumns(String),

    #[error("invalid where clause: {0}")]
    InvalidWhere(String),

    #[error("invalid replica mode: {0}, must be 'default' or 'full'")]
    InvalidReplica(String),

    #[error("unknown column(s): {}", .0.join(", "))]
    UnknownColumns(Vec<String>),

    #[error("predicate evaluation failed: {0}")]
    Predicate(String),

    #[error("shape not found: {0}")]
    ShapeNotFound(String),

    #[error("snapshot not found for shape {0}")]
    SnapshotNotFound(String),

    #[error("shape {0} no longer exists")]
    ShapeGone(String),

    #[error("invalid state transition for shape {handle}: {from} -> {to}")]
    InvalidStateTransition {
        handle: String,
        from: String,
        to: String,
    },

    #[error("offset {offset} must be greater than {latest}")]
    OffsetOrder { offset: String, latest: String },

    #[error("too many shapes: limit of {0} reached")]
    TooManyShapes(usize),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("consumer stopped: {0}")]
    ConsumerStopped(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidOffset(_)
            | Error::InvalidHandle(_)
            | Error::InvalidShape(_)
            | Error::InvalidColumns(_)
            | Error::InvalidWhere(_)
            | Error::InvalidReplica(_)
            | Error::UnknownColumns(_) => ErrorCategory::BadRequest,
            Error::ShapeNotFound(_) | Error::ShapeGone(_) | Error::ConsumerStopped(_) => {
                ErrorCategory::ShapeGone
            }
            Error::TooManyShapes(_) => ErrorCategory::Unavailable,
            _ => ErrorCategory::Internal,
        }
    }

    /// HTTP status code
    pub fn http_status(&self) -> u16 {
        self.category().http_status()
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TooManyShapes(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type for shape engine operations
pub type Result<T> = std::result::Result<T, Error>;
