//! Error types for stride-core

use thiserror::Error;

use crate::models::{EntityKind, RecordId};

/// Result type alias using stride-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stride-core operations
///
/// Nothing here is fatal to the engine: every sync failure is retried on the
/// next opportunity (next pass, reconnect, or explicit resync).
#[derive(Error, Debug)]
pub enum Error {
    /// Companion device unreachable or transport failed
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Companion device received a message but answered with an error
    #[error("Peer rejected message: {0}")]
    PeerRejected(String),

    /// Unparseable message or record missing required fields
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Merge could not find the record it targets
    #[error("Merge target missing: {kind} {id}")]
    MergeTargetMissing { kind: EntityKind, id: RecordId },

    /// Network or backend error while writing to the cloud
    #[error("Cloud write failed: {0}")]
    CloudWriteFailure(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the failure should leave work queued for a later attempt.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_) | Self::PeerRejected(_) | Self::CloudWriteFailure(_)
        )
    }

    /// Whether the failure is specific to one incoming record.
    ///
    /// Such records are skipped; the rest of the batch still applies.
    pub fn rejects_record(&self) -> bool {
        match self {
            Self::MalformedMessage(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => {
                failure.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}
