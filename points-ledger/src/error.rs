//! Error types for the points ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing input (empty reason, zero or non-numeric amount,
    /// unknown operation kind, bad account id format)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown account, or an entry that does not belong to the given account
    #[error("Not found: {0}")]
    NotFound(String),

    /// Actor lacks the admin grant or presented bad credentials
    #[error("Unauthorized: {0}")]
    Authorization(String),

    /// Isolation conflict, lock timeout or duplicate key surfaced by the store
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`Error`], for callers that need to branch on
/// the outcome without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::Validation`]
    Validation,
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::Authorization`]
    Authorization,
    /// See [`Error::Conflict`]
    Conflict,
    /// Storage, configuration and IO failures
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Authorization(_) => ErrorKind::Authorization,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Storage(_) | Error::Config(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}

// Postgres SQLSTATE codes treated as conflicts
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Error::Conflict(db.message().to_string());
            }
            if let Some(code) = db.code() {
                if matches!(
                    code.as_ref(),
                    SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE
                ) {
                    return Error::Conflict(db.message().to_string());
                }
            }
        }
        Error::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Storage(format!("migration failed: {}", err))
    }
}
