//! Discord adapter for the chat transport
//!
//! A destination is a guild. Restrictions map to member timeouts, removal to a
//! guild ban. Timeouts cannot exceed 28 days, so longer or permanent mutes are
//! capped there.

use crate::moderation::{ChatPermissions, ChatTransport, ModerationError, ModerationResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use poise::serenity_prelude::{
    ChannelId, EditMember, GuildId, Http, Permissions, Timestamp, UserId,
};
use std::num::NonZeroU64;
use std::sync::Arc;
use tracing::{debug, info};

/// Longest timeout Discord accepts
const MAX_TIMEOUT_DAYS: i64 = 28;

/// `ChatTransport` over the Discord REST API
#[derive(Clone)]
pub struct DiscordTransport {
    http: Arc<Http>,
}

impl std::fmt::Debug for DiscordTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordTransport").finish_non_exhaustive()
    }
}

fn non_zero(id: u64, what: &str) -> ModerationResult<NonZeroU64> {
    NonZeroU64::new(id).ok_or_else(|| ModerationError::ValidationFailed(format!("{what} id cannot be 0")))
}

fn guild(id: u64) -> ModerationResult<GuildId> {
    non_zero(id, "guild").map(GuildId::from)
}

fn user(id: u64) -> ModerationResult<UserId> {
    non_zero(id, "user").map(UserId::from)
}

fn channel(id: u64) -> ModerationResult<ChannelId> {
    non_zero(id, "channel").map(ChannelId::from)
}

/// Clamp a requested restriction end to what Discord accepts
fn timeout_end(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let cap = now + Duration::days(MAX_TIMEOUT_DAYS);
    until.map_or(cap, |until| until.min(cap))
}

impl DiscordTransport {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatTransport for DiscordTransport {
    async fn apply_restriction(
        &self,
        destination: u64,
        subject: u64,
        permissions: ChatPermissions,
        until: Option<DateTime<Utc>>,
    ) -> ModerationResult<()> {
        if !permissions.is_silenced() {
            return self.lift_restriction(destination, subject).await;
        }

        let end = timeout_end(until, Utc::now());
        let builder = EditMember::new().disable_communication_until_datetime(Timestamp::from(end));
        guild(destination)?
            .edit_member(&*self.http, user(subject)?, builder)
            .await?;
        debug!(destination, subject, until = %end, "Timed out member");
        Ok(())
    }

    async fn lift_restriction(&self, destination: u64, subject: u64) -> ModerationResult<()> {
        guild(destination)?
            .edit_member(&*self.http, user(subject)?, EditMember::new().enable_communication())
            .await?;
        Ok(())
    }

    async fn remove_member(&self, destination: u64, subject: u64) -> ModerationResult<()> {
        guild(destination)?
            .ban(&*self.http, user(subject)?, 0)
            .await?;
        Ok(())
    }

    async fn unban_member(&self, destination: u64, subject: u64) -> ModerationResult<()> {
        guild(destination)?
            .unban(&*self.http, user(subject)?)
            .await?;
        Ok(())
    }

    async fn leave_destination(&self, destination: u64) -> ModerationResult<()> {
        guild(destination)?.leave(&*self.http).await?;
        info!(destination, "Left guild");
        Ok(())
    }

    async fn send_message(&self, destination: u64, text: &str) -> ModerationResult<()> {
        channel(destination)?.say(&*self.http, text).await?;
        Ok(())
    }

    async fn send_direct_message(&self, user_id: u64, text: &str) -> ModerationResult<()> {
        let dm = user(user_id)?.create_dm_channel(&*self.http).await?;
        dm.id.say(&*self.http, text).await?;
        Ok(())
    }

    async fn is_destination_moderator(
        &self,
        destination: u64,
        user_id: u64,
    ) -> ModerationResult<bool> {
        let guild = guild(destination)?.to_partial_guild(&*self.http).await?;
        let user_id = user(user_id)?;
        if guild.owner_id == user_id {
            return Ok(true);
        }

        let member = guild.member(&*self.http, user_id).await?;
        let elevated = Permissions::ADMINISTRATOR | Permissions::BAN_MEMBERS;
        Ok(member.roles.iter().any(|role| {
            guild
                .roles
                .get(role)
                .is_some_and(|role| role.permissions.intersects(elevated))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_capped() {
        let now = Utc::now();
        let cap = now + Duration::days(MAX_TIMEOUT_DAYS);

        assert_eq!(timeout_end(None, now), cap);
        assert_eq!(timeout_end(Some(now + Duration::days(90)), now), cap);

        let short = now + Duration::minutes(30);
        assert_eq!(timeout_end(Some(short), now), short);
    }

    #[test]
    fn test_zero_ids_are_rejected() {
        assert!(matches!(guild(0), Err(ModerationError::ValidationFailed(_))));
        assert!(matches!(user(0), Err(ModerationError::ValidationFailed(_))));
        assert_eq!(channel(5).unwrap().get(), 5);
    }
}
