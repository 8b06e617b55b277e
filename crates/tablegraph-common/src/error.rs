//! Error types for tablegraph

use thiserror::Error;

/// Result type alias for tablegraph operations
pub type Result<T> = std::result::Result<T, TableGraphError>;

/// Unified error type for all tablegraph operations
#[derive(Error, Debug, Clone)]
pub enum TableGraphError {
    /// Entity mapping is structurally broken (missing id, missing join table,
    /// id type mismatch, unknown association target). Never retryable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single value could not be converted between storage and domain form.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// An UPDATE expected to hit an existing row matched nothing.
    #[error("Stale entity: {0}")]
    Stale(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Unique constraint violation (SQLSTATE 23505, SQLite 1555/2067)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Foreign key constraint violation (SQLSTATE 23503, SQLite 787)
    #[error("Foreign key constraint violation: {0}")]
    ForeignKey(String),

    /// Deadlock detected (SQLSTATE 40P01) - retryable
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Statement or pool timeout - retryable
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transient error that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),
}

impl TableGraphError {
    /// Returns true if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TableGraphError::Deadlock(_)
                | TableGraphError::Timeout(_)
                | TableGraphError::Transient(_)
        )
    }

    /// Returns true if this is a constraint violation error
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            TableGraphError::Conflict(_) | TableGraphError::ForeignKey(_)
        )
    }

    /// Returns true if the mapping itself is broken
    pub fn is_configuration(&self) -> bool {
        matches!(self, TableGraphError::Configuration(_))
    }
}

impl From<serde_json::Error> for TableGraphError {
    fn from(err: serde_json::Error) -> Self {
        TableGraphError::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlx-errors")]
impl From<sqlx::Error> for TableGraphError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error;
        match &err {
            Error::Configuration(_) => TableGraphError::Connection(err.to_string()),
            Error::Database(db_err) => {
                // PostgreSQL reports SQLSTATE codes, SQLite its extended result codes.
                // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
                // and https://www.sqlite.org/rescode.html
                if let Some(code) = db_err.code() {
                    let code_str: &str = &code;
                    match code_str {
                        "23505" | "23P01" | "1555" | "2067" => {
                            return TableGraphError::Conflict(err.to_string())
                        }
                        "23503" | "787" => return TableGraphError::ForeignKey(err.to_string()),
                        // Not null / check violations
                        "23502" | "23514" | "1299" | "275" => {
                            return TableGraphError::Validation(err.to_string())
                        }
                        "40P01" => return TableGraphError::Deadlock(err.to_string()),
                        "40001" => return TableGraphError::Transient(err.to_string()),
                        code if code.starts_with("40") && code.len() == 5 => {
                            return TableGraphError::Transient(err.to_string())
                        }
                        code if code.starts_with("08") && code.len() == 5 => {
                            return TableGraphError::Connection(err.to_string())
                        }
                        "57P01" | "57P02" | "57P03" => {
                            return TableGraphError::Transient(err.to_string())
                        }
                        // SQLITE_BUSY / SQLITE_LOCKED
                        "5" | "6" | "517" => return TableGraphError::Transient(err.to_string()),
                        _ => {}
                    }
                }
                TableGraphError::Database(err.to_string())
            }
            Error::Io(_) => TableGraphError::Connection(err.to_string()),
            Error::Tls(_) => TableGraphError::Connection(err.to_string()),
            Error::Protocol(_) => TableGraphError::Connection(err.to_string()),
            Error::RowNotFound => TableGraphError::Query("Row not found".to_string()),
            Error::TypeNotFound { .. } => TableGraphError::Deserialization(err.to_string()),
            Error::ColumnIndexOutOfBounds { .. } => TableGraphError::Query(err.to_string()),
            Error::ColumnNotFound(_) => TableGraphError::Query(err.to_string()),
            Error::ColumnDecode { .. } => TableGraphError::Deserialization(err.to_string()),
            Error::Decode(_) => TableGraphError::Deserialization(err.to_string()),
            Error::PoolTimedOut => TableGraphError::Timeout("Connection pool timed out".to_string()),
            Error::PoolClosed => TableGraphError::Connection("Connection pool closed".to_string()),
            Error::WorkerCrashed => TableGraphError::Internal("Worker thread crashed".to_string()),
            _ => TableGraphError::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_configuration() {
        let err = TableGraphError::Configuration("person has no id field".to_string());
        assert_eq!(err.to_string(), "Configuration error: person has no id field");
    }

    #[test]
    fn test_error_display_conversion() {
        let err = TableGraphError::Conversion("BIGINT 70000 does not fit SMALLINT".to_string());
        assert_eq!(
            err.to_string(),
            "Conversion error: BIGINT 70000 does not fit SMALLINT"
        );
    }

    #[test]
    fn test_error_display_stale() {
        let err = TableGraphError::Stale("person id 7".to_string());
        assert_eq!(err.to_string(), "Stale entity: person id 7");
    }

    #[test]
    fn test_error_display_database() {
        let err = TableGraphError::Database("invalid query".to_string());
        assert_eq!(err.to_string(), "Database error: invalid query");
    }

    #[test]
    fn test_error_display_query() {
        let err = TableGraphError::Query("invalid operator".to_string());
        assert_eq!(err.to_string(), "Query error: invalid operator");
    }

    #[test]
    fn test_error_display_foreign_key() {
        let err = TableGraphError::ForeignKey("violates foreign key constraint".to_string());
        assert_eq!(
            err.to_string(),
            "Foreign key constraint violation: violates foreign key constraint"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: TableGraphError = json_err.into();
        assert!(matches!(err, TableGraphError::Serialization(_)));
    }

    #[test]
    fn test_is_retryable() {
        assert!(TableGraphError::Deadlock("test".to_string()).is_retryable());
        assert!(TableGraphError::Timeout("test".to_string()).is_retryable());
        assert!(TableGraphError::Transient("test".to_string()).is_retryable());
        assert!(!TableGraphError::Stale("test".to_string()).is_retryable());
        assert!(!TableGraphError::Configuration("test".to_string()).is_retryable());
        assert!(!TableGraphError::Conflict("test".to_string()).is_retryable());
    }

    #[test]
    fn test_is_constraint_violation() {
        assert!(TableGraphError::Conflict("test".to_string()).is_constraint_violation());
        assert!(TableGraphError::ForeignKey("test".to_string()).is_constraint_violation());
        assert!(!TableGraphError::Deadlock("test".to_string()).is_constraint_violation());
        assert!(!TableGraphError::Stale("test".to_string()).is_constraint_violation());
    }

    #[test]
    fn test_is_configuration() {
        assert!(TableGraphError::Configuration("x".to_string()).is_configuration());
        assert!(!TableGraphError::Conversion("x".to_string()).is_configuration());
        assert!(!TableGraphError::Stale("x".to_string()).is_configuration());
    }
}
