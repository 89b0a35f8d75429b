//! Error types and result handling for storage and domain operations.
//!
//! Separates failures callers should surface immediately (validation, not
//! found, constraint violations) from transient store conditions that the
//! delivery drivers retry with backoff.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller supplied input that can never succeed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Lock contention, serialization failure, deadlock or lost connection.
    ///
    /// Safe to retry the whole operation.
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database operation failed permanently.
    #[error("database error: {0}")]
    Database(String),
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Returns true if retrying the same operation may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }

    /// Short machine-readable code used in API error bodies.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::TransientStore(_) => "store_unavailable",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::Database(_) => "database_error",
        }
    }
}

/// SQLSTATE codes that indicate a retryable condition.
///
/// 40001 serialization_failure, 40P01 deadlock_detected, 55P03 lock_not_available,
/// 57P01 admin_shutdown. Class 08 covers connection exceptions.
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "55P03" | "57P01") || code.starts_with("08")
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::TransientStore(err.to_string()),
            sqlx::Error::Database(ref db_err)
                if db_err.code().is_some_and(|code| is_transient_sqlstate(&code)) =>
            {
                Self::TransientStore(err.to_string())
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("migration failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_transient() {
        let err = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        assert_eq!(err.code(), "store_unavailable");
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(CoreError::from(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn sqlstate_classification() {
        for code in ["40001", "40P01", "55P03", "57P01", "08006", "08003"] {
            assert!(is_transient_sqlstate(code), "{code} should be transient");
        }
        for code in ["23505", "23503", "42P01", "22P02"] {
            assert!(!is_transient_sqlstate(code), "{code} should be permanent");
        }
    }

    #[test]
    fn validation_is_not_retried() {
        let err = CoreError::validation("namespace must not be empty");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "validation failed: namespace must not be empty");
    }
}
