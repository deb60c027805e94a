//! Error types for the moderation core
//!
//! Backing-store failures are kept apart from core failures so callers can tell
//! a transient outage (retry, then fail open) from a real rejection.

use thiserror::Error;

/// Errors raised by a backing store implementation
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (timeout, connection loss)
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    /// Requested row does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Row already exists or conflicts with current state
    #[error("Record conflict: {0}")]
    Conflict(String),

    /// Snapshot file could not be read or written
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file could not be encoded or decoded
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

impl StoreError {
    /// Whether retrying the same call can succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Result type for backing store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during moderation operations
#[derive(Debug, Error)]
pub enum ModerationError {
    /// Invalid state transition attempted
    #[error("Invalid state transition")]
    InvalidStateTransition,

    /// Sanction or destination not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<poise::serenity_prelude::Error>),

    /// Chat transport rejected the call
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backing store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Action validation failed
    #[error("Action validation failed: {0}")]
    ValidationFailed(String),

    /// Shutdown has started and no new work is accepted
    #[error("Shutting down, request not accepted")]
    ShuttingDown,

    /// Generic error
    #[error("Moderation error: {0}")]
    Other(String),
}

impl From<poise::serenity_prelude::Error> for ModerationError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

/// Convert a string into a `ModerationError`
impl From<String> for ModerationError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Result type for moderation operations
pub type ModerationResult<T> = Result<T, ModerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ModerationError::InvalidStateTransition;
        assert_eq!(error.to_string(), "Invalid state transition");

        let error = ModerationError::NotFound("sanction-1".to_string());
        assert_eq!(error.to_string(), "Not found: sanction-1");

        let error = ModerationError::from("Something went wrong".to_string());
        assert_eq!(error.to_string(), "Moderation error: Something went wrong");

        let error = ModerationError::from(StoreError::Unavailable("timeout".to_string()));
        assert_eq!(error.to_string(), "Backing store unavailable: timeout");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("down".to_string()).is_transient());
        assert!(StoreError::Io(std::io::Error::other("disk")).is_transient());
        assert!(!StoreError::NotFound("x".to_string()).is_transient());
        assert!(!StoreError::Conflict("x".to_string()).is_transient());
    }
}
