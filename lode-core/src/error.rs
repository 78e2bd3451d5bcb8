use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The engine refused to create or open storage.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Desired and physical schema disagree and the conflict policy forbids
    /// destructive reconciliation.
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    /// Malformed key, key range, record or schema, rejected before any I/O.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Native engine failure during a transaction.
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// Unknown store or index. Absent records are `Ok(None)`, never this.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller broke an API contract (write in a read-only transaction,
    /// out-of-order input to a merge solver).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Connection closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by clients for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Permission(_) => "PERMISSION_DENIED",
            Error::SchemaConflict(_) => "SCHEMA_CONFLICT",
            Error::InvalidValue(_) => "INVALID_VALUE",
            Error::Engine(_) => "ENGINE_ERROR",
            Error::Constraint(_) => "CONSTRAINT_VIOLATION",
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Closed => "CLOSED",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// IO failures and a busy engine are transient. Permission denials need
    /// outside intervention and contract violations are programming errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Engine(msg) => msg.contains("database is locked") || msg.contains("busy"),

            Error::Permission(_) => false,
            Error::SchemaConflict(_) => false,
            Error::InvalidValue(_) => false,
            Error::Constraint(_) => false,
            Error::NotFound(_) => false,
            Error::InvalidState(_) => false,
            Error::Closed => false,
            Error::Serialization(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// Adds context to an error by wrapping it in an Internal error.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use lode_core::Error;
    ///
    /// fn load() -> Result<(), Error> {
    ///     Err(Error::Engine("disk I/O error".to_string()))
    /// }
    ///
    /// fn refresh() -> Result<(), Error> {
    ///     load().map_err(|e| e.with_context("failed to refresh store"))
    /// }
    /// ```
    pub fn with_context(self, context: &str) -> Error {
        Error::Internal(format!("{}: {}", context, self))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::ConstraintViolation => Error::Constraint(err.to_string()),
                ErrorCode::CannotOpen
                | ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly
                | ErrorCode::AuthorizationForStatementDenied => Error::Permission(err.to_string()),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Error::Engine(format!("busy: {}", err))
                }
                _ => Error::Engine(err.to_string()),
            },
            _ => Error::Engine(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Permission("denied".into()).code(), "PERMISSION_DENIED");
        assert_eq!(Error::InvalidValue("nan".into()).code(), "INVALID_VALUE");
        assert_eq!(Error::Closed.code(), "CLOSED");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Io(io::Error::new(io::ErrorKind::Interrupted, "x")).is_retryable());
        assert!(Error::Engine("busy: database is locked".into()).is_retryable());
        assert!(!Error::Engine("no such table: t".into()).is_retryable());
        assert!(!Error::InvalidState("reversal".into()).is_retryable());
    }

    #[test]
    fn test_with_context() {
        let err = Error::NotFound("store animals".into()).with_context("count");
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(err.to_string().contains("count"));
        assert!(err.to_string().contains("store animals"));
    }

    #[test]
    fn test_sqlite_constraint_maps_to_constraint() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER UNIQUE); INSERT INTO t VALUES (1);")
            .unwrap();
        let err: Error = conn.execute("INSERT INTO t VALUES (1)", []).unwrap_err().into();
        assert_eq!(err.code(), "CONSTRAINT_VIOLATION");
    }
}
