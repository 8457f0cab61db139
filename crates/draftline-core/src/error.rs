//! Error types for the core library.

use thiserror::Error;

use crate::draft_state::{MessageId, UserId};

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No draft state is stored for the message.
    #[error("Draft state not found for message {message_id} of user {user_id}")]
    DraftStateNotFound {
        /// Owning user.
        user_id: UserId,
        /// Local message identifier.
        message_id: MessageId,
    },

    /// A persisted value could not be decoded.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Concurrent writers kept winning the compare-and-swap on a row.
    #[error("Too many concurrent updates for message {message_id} of user {user_id}")]
    Contention {
        /// Owning user.
        user_id: UserId,
        /// Local message identifier.
        message_id: MessageId,
    },

    /// Work could not be handed to the scheduler.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Returns true for failures reading or writing a draft state row,
    /// including a row that is missing.
    #[must_use]
    pub const fn is_local_data(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Serde(_)
                | Self::DraftStateNotFound { .. }
                | Self::InvalidData(_)
                | Self::Contention { .. }
        )
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
