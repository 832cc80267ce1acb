use crate::storage::errors::StorageError;
use thiserror::Error as ThisError;

/// Engine-level error.
///
/// Expected business conditions (a lock already held, an invitation already answered, no
/// eligible candidates) are reported through typed outcomes on the operations themselves. The
/// `Conflict` variant is only used where an operation has no success payload to carry a
/// conflict outcome in.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed booking/candidate/config input, rejected before any state mutation
    #[error("{message}")]
    Validation { message: String },

    /// Requested entity not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// State conflict, e.g. confirming an expired lock
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Storage backend error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Generic internal failure
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain (collaborator failures, etc.)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by callers deciding how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Storage(storage_err) => match storage_err {
                StorageError::NotFound { .. } => ErrorKind::NotFound,
                StorageError::UniqueViolation { .. }
                | StorageError::ExclusionViolation { .. }
                | StorageError::InvalidState { .. } => ErrorKind::Conflict,
                StorageError::CheckViolation { .. } => ErrorKind::Validation,
                StorageError::ForeignKeyViolation { .. } => ErrorKind::Validation,
                StorageError::Other(_) => ErrorKind::Fatal,
            },
            Error::Internal { .. } | Error::Other(_) => ErrorKind::Fatal,
        }
    }

    /// Returns an operator-safe message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Conflict { message } => message.clone(),
            Error::Storage(storage_err) => match storage_err {
                StorageError::NotFound { entity, id } => format!("{entity} with ID {id} not found"),
                StorageError::UniqueViolation { table, .. } => match table.as_deref() {
                    Some("assignments") => "Provider is already assigned to this booking".to_string(),
                    Some("invitations") => "Provider already has an open invitation for this booking".to_string(),
                    _ => "Resource already exists".to_string(),
                },
                StorageError::ExclusionViolation { .. } => "Provider is already booked for an overlapping time slot".to_string(),
                StorageError::InvalidState { entity, current, .. } => format!("{entity} is already {current}"),
                StorageError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                StorageError::CheckViolation { .. } => "Invalid data provided".to_string(),
                StorageError::Other(_) => "Storage error occurred".to_string(),
            },
            Error::Internal { .. } | Error::Other(_) => "Internal error".to_string(),
        }
    }

    /// Log the error at a level matching its severity.
    pub fn log(&self) {
        match self.kind() {
            ErrorKind::Fatal => tracing::error!("Internal matching error: {:#}", self),
            ErrorKind::Conflict => tracing::warn!("Conflict error: {}", self),
            ErrorKind::Validation | ErrorKind::NotFound => tracing::debug!("Client error: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
