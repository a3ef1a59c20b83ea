//! Error types for the tracker.

use crate::types::{Mode, Timestamp, UserId};
use std::time::Duration;
use thiserror::Error;

/// Main error type for tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Concurrent ingestion for user {user} in {mode} did not settle after {attempts} attempts")]
    ConcurrencyConflict {
        user: UserId,
        mode: Mode,
        attempts: u32,
    },

    #[error("Snapshot timestamp {got:?} is not after the last stored snapshot at {last:?}")]
    NonMonotonicTimestamp { last: Timestamp, got: Timestamp },

    #[error("User not tracked: {0}")]
    UserNotFound(UserId),

    #[error("Query exceeded its timeout of {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of a [`TrackerError`], for callers that branch on
/// the failure class rather than the exact cause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any write.
    Validation,
    /// Two writers raced on the same key and retries ran out.
    ConcurrencyConflict,
    /// A read ran past its deadline.
    Timeout,
    /// The referenced entity is not tracked.
    NotFound,
    /// Persistence is unavailable or damaged. Nothing was partially committed.
    StorageFailure,
}

impl TrackerError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        TrackerError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn missing(field: &'static str) -> Self {
        Self::validation(field, "missing required field")
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::Validation { .. } | TrackerError::NonMonotonicTimestamp { .. } => {
                ErrorKind::Validation
            }
            TrackerError::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            TrackerError::Timeout(_) => ErrorKind::Timeout,
            TrackerError::UserNotFound(_) => ErrorKind::NotFound,
            TrackerError::Io(_)
            | TrackerError::Serialization(_)
            | TrackerError::Deserialization(_)
            | TrackerError::Corruption(_)
            | TrackerError::ChecksumMismatch { .. }
            | TrackerError::InvalidFormat(_)
            | TrackerError::Locked
            | TrackerError::NotInitialized
            | TrackerError::Config(_) => ErrorKind::StorageFailure,
        }
    }

    /// Whether this is a storage-layer failure.
    pub fn is_storage_failure(&self) -> bool {
        self.kind() == ErrorKind::StorageFailure
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TrackerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TrackerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TrackerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TrackerError::Deserialization(e.to_string())
    }
}

impl From<toml::de::Error> for TrackerError {
    fn from(e: toml::de::Error) -> Self {
        TrackerError::Config(e.to_string())
    }
}

/// Result type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            TrackerError::missing("playcount").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            TrackerError::Timeout(Duration::from_millis(5)).kind(),
            ErrorKind::Timeout
        );
        assert!(TrackerError::Locked.is_storage_failure());
        assert!(TrackerError::Corruption("bad frame".into()).is_storage_failure());
        assert!(!TrackerError::UserNotFound(UserId(3)).is_storage_failure());
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = TrackerError::validation("accuracy", "must be between 0 and 100");
        assert_eq!(
            err.to_string(),
            "Invalid accuracy: must be between 0 and 100"
        );
    }
}
