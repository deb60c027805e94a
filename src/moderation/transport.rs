//! Chat platform operations consumed by the moderation core

use crate::moderation::ModerationResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Member rights toggled by a restriction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatPermissions {
    pub send_messages: bool,
    pub send_media: bool,
    pub add_reactions: bool,
}

impl ChatPermissions {
    /// Everything revoked
    #[must_use]
    pub const fn muted() -> Self {
        Self {
            send_messages: false,
            send_media: false,
            add_reactions: false,
        }
    }

    #[must_use]
    pub const fn is_silenced(&self) -> bool {
        !self.send_messages
    }
}

/// Outbound calls against the chat platform
///
/// Destination and subject ids are opaque platform ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Restrict a member until `until`, or indefinitely when `None`
    async fn apply_restriction(
        &self,
        destination: u64,
        subject: u64,
        permissions: ChatPermissions,
        until: Option<DateTime<Utc>>,
    ) -> ModerationResult<()>;

    async fn lift_restriction(&self, destination: u64, subject: u64) -> ModerationResult<()>;

    /// Remove a member and keep them out
    async fn remove_member(&self, destination: u64, subject: u64) -> ModerationResult<()>;

    async fn unban_member(&self, destination: u64, subject: u64) -> ModerationResult<()>;

    async fn leave_destination(&self, destination: u64) -> ModerationResult<()>;

    async fn send_message(&self, destination: u64, text: &str) -> ModerationResult<()>;

    async fn send_direct_message(&self, user: u64, text: &str) -> ModerationResult<()>;

    /// Live lookup of whether `user` holds an elevated role in `destination`
    async fn is_destination_moderator(&self, destination: u64, user: u64)
    -> ModerationResult<bool>;
}
