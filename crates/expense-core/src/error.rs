//! Error types module
//!
//! `PipelineError` unifies the failures workers record against a row.
//! `ErrorClass` is the temporary/permanent split surfaced to operators in
//! persisted error messages.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

use crate::models::AttachmentStatus;

/// Whether retrying the failed operation could plausibly succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Temporary,
    Permanent,
}

impl ErrorClass {
    pub fn from_temporary(temporary: bool) -> Self {
        if temporary {
            ErrorClass::Temporary
        } else {
            ErrorClass::Permanent
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ErrorClass::Temporary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Temporary => "temporary",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: AttachmentStatus,
        to: AttachmentStatus,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("External service error ({class}): {message}")]
    External { message: String, class: ErrorClass },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn external(message: impl Into<String>, class: ErrorClass) -> Self {
        PipelineError::External {
            message: message.into(),
            class,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::External { class, .. } => *class,
            PipelineError::Database(_) | PipelineError::Storage(_) => ErrorClass::Temporary,
            _ => ErrorClass::Permanent,
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for PipelineError {
    fn from(err: SqlxError) -> Self {
        PipelineError::Database(err)
    }
}

impl From<io::Error> for PipelineError {
    fn from(err: io::Error) -> Self {
        PipelineError::Storage(format!("IO error: {}", err))
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_error_carries_class() {
        let err = PipelineError::external("connection reset", ErrorClass::Temporary);
        assert!(err.class().is_temporary());
        assert!(err.to_string().contains("temporary"));
    }

    #[test]
    fn invalid_state_is_permanent() {
        let err = PipelineError::InvalidState("missing source URL".to_string());
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn transition_error_message() {
        let err = PipelineError::InvalidTransition {
            id: "a-1".to_string(),
            from: AttachmentStatus::Processed,
            to: AttachmentStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for a-1: PROCESSED -> PENDING"
        );
    }
}
