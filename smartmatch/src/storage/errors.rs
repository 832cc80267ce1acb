use thiserror::Error;

/// Unified error type for storage operations that engine code can handle
#[derive(Error, Debug)]
pub enum StorageError {
    /// Entity not found by the given identifier
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation
    #[error("Unique constraint violation")]
    UniqueViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    /// Exclusion constraint violation (overlapping slot locks)
    #[error("Exclusion constraint violation")]
    ExclusionViolation { constraint: Option<String>, message: String },

    /// Foreign key constraint violation
    #[error("Foreign key constraint violation")]
    ForeignKeyViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    /// Check constraint violation
    #[error("Check constraint violation")]
    CheckViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    /// Attempted to move an entity out of a state it is no longer in (e.g. overwrite a
    /// terminal invitation). Surfaces compare-and-swap failures.
    #[error("{entity} {id} is {current}, expected {expected}")]
    InvalidState {
        entity: String,
        id: String,
        current: String,
        expected: String,
    },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        StorageError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid_state(entity: &str, id: impl ToString, current: &str, expected: &str) -> Self {
        StorageError::InvalidState {
            entity: entity.to_string(),
            id: id.to_string(),
            current: current.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// PostgreSQL SQLSTATE for `exclusion_violation`.
#[cfg(feature = "postgres")]
const EXCLUSION_VIOLATION: &str = "23P01";

/// Convert from sqlx::Error using proper sqlx error categorization
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::NotFound {
                entity: "row".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    StorageError::UniqueViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        table: db_err.table().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.code().as_deref() == Some(EXCLUSION_VIOLATION) {
                    StorageError::ExclusionViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_foreign_key_violation() {
                    StorageError::ForeignKeyViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        table: db_err.table().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_check_violation() {
                    StorageError::CheckViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        table: db_err.table().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else {
                    // All other database errors are non-recoverable - convert to anyhow
                    StorageError::Other(anyhow::Error::from(err))
                }
            }
            // All other sqlx errors are non-recoverable - convert to anyhow with context
            _ => StorageError::Other(anyhow::Error::from(err)),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::Other(anyhow::Error::from(err))
    }
}

/// Type alias for storage operation results
pub type Result<T> = std::result::Result<T, StorageError>;
