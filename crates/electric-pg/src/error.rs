//! PostgreSQL plumbing errors

use crate::protocol::decoder::DecodeError;
use crate::protocol::scram::ScramError;
use thiserror::Error;

/// SQLSTATE `duplicate_object`
pub const DUPLICATE_OBJECT: &str = "42710";
/// SQLSTATE `undefined_table`
pub const UNDEFINED_TABLE: &str = "42P01";

/// An `ErrorResponse` sent by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    /// SQLSTATE code
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)
    }
}

/// PostgreSQL error types
#[derive(Debug, Error)]
pub enum PgError {
    #[error("invalid connection string: {0}")]
    InvalidDsn(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(ServerError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("SCRAM error: {0}")]
    Scram(#[from] ScramError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("table {0} does not exist")]
    TableNotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PgError {
    /// SQLSTATE of a server-side failure, if any
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            PgError::Server(e) => Some(e.code.as_str()),
            PgError::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }

    /// `true` when the object being created already exists
    pub fn is_duplicate_object(&self) -> bool {
        self.sql_state() == Some(DUPLICATE_OBJECT)
    }

    /// Whether reconnecting may help
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PgError::Connection(_) | PgError::Io(_) | PgError::Timeout(_) | PgError::Postgres(_)
        )
    }
}

impl From<PgError> for electric_core::Error {
    fn from(err: PgError) -> Self {
        match err {
            PgError::TableNotFound(table) => {
                electric_core::Error::InvalidShape(format!("table {table} does not exist"))
            }
            PgError::Io(e) => electric_core::Error::Io(e),
            other => electric_core::Error::Snapshot(other.to_string()),
        }
    }
}

/// Result type for PostgreSQL operations
pub type PgResult<T> = std::result::Result<T, PgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_object() {
        let err = PgError::Server(ServerError {
            severity: "ERROR".into(),
            code: DUPLICATE_OBJECT.into(),
            message: "replication slot \"electric\" already exists".into(),
        });
        assert!(err.is_duplicate_object());
        assert!(!PgError::Protocol("x".into()).is_duplicate_object());
    }

    #[test]
    fn test_core_conversion() {
        let err: electric_core::Error = PgError::TableNotFound("\"public\".\"nope\"".into()).into();
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("does not exist"));

        let err: electric_core::Error = PgError::Connection("refused".into()).into();
        assert_eq!(err.http_status(), 500);
    }
}
