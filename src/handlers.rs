use crate::moderation::{DestinationInfo, EligibilityVerdict, SanctionKind, Subject};
use crate::{Data, EVENT_TARGET};
use chrono::Utc;
use poise::serenity_prelude::{self as serenity, Context, EventHandler, GuildId, Member, Message, Ready};
use tracing::{debug, info, warn};

pub struct Handler {
    pub data: Data,
}

impl Handler {
    #[must_use]
    pub fn new(data: Data) -> Self {
        Self { data }
    }
}

/// Name and vanity handle of a guild, from the cache
fn destination_info(ctx: &Context, guild_id: GuildId) -> DestinationInfo {
    let (name, handle) = ctx
        .cache
        .guild(guild_id)
        .map(|guild| (guild.name.clone(), guild.vanity_url_code.clone()))
        .unwrap_or_else(|| (guild_id.to_string(), None));
    DestinationInfo::new(guild_id.get(), name, handle)
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!(target: EVENT_TARGET, guilds = ready.guilds.len(), "Connected as {user_name}, shard {shard_id}");
    }

    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                target: EVENT_TARGET,
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!(target: EVENT_TARGET, "Cache ready! The bot is in {guild_count} guild(s)");
    }

    /// Every guild message doubles as an eligibility check for its guild
    async fn message(&self, ctx: Context, msg: Message) {
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        let own_id = ctx.cache.current_user().id;
        if msg.author.id == own_id {
            return;
        }

        let info = destination_info(&ctx, guild_id);
        let verdict = self
            .data
            .eligibility
            .check(&info, Some(msg.author.id.get()))
            .await;
        match verdict {
            EligibilityVerdict::Exempt | EligibilityVerdict::Authorized => {}
            verdict => debug!(target: EVENT_TARGET, guild = guild_id.get(), ?verdict, "Eligibility check"),
        }
    }

    /// Refresh metadata for authorized guilds; log joins elsewhere
    async fn guild_create(&self, _ctx: Context, guild: serenity::Guild, is_new: Option<bool>) {
        let id = guild.id.get();
        if self.data.permissions.is_destination_authorized(id).await {
            if let Err(e) = self
                .data
                .store
                .update_destination_metadata(id, &guild.name, guild.vanity_url_code.clone())
                .await
            {
                warn!(target: EVENT_TARGET, guild = id, error = %e, "Failed to update guild metadata");
            }
            debug!(target: EVENT_TARGET, guild = id, name = %guild.name, "Authorized guild available");
        } else if is_new == Some(true) {
            warn!(
                target: EVENT_TARGET,
                guild = id,
                name = %guild.name,
                "Joined an unauthorized guild, it will be left on first activity"
            );
        }
    }

    /// Keep banned members out when a guild admin lets them back in
    async fn guild_member_addition(&self, ctx: Context, new_member: Member) {
        let guild = new_member.guild_id.get();
        let user = new_member.user.id.get();

        let sanctions = match self
            .data
            .store
            .active_sanctions_for(user, SanctionKind::Ban)
            .await
        {
            Ok(sanctions) => sanctions,
            Err(e) => {
                warn!(target: EVENT_TARGET, guild, user, error = %e, "Ban lookup on join failed");
                return;
            }
        };
        let now = Utc::now();
        if !sanctions.iter().any(|s| s.is_in_force(now)) {
            return;
        }
        if !self.data.permissions.is_destination_authorized(guild).await {
            return;
        }

        if let Err(e) = self.data.transport.remove_member(guild, user).await {
            warn!(target: EVENT_TARGET, guild, user, error = %e, "Failed to remove banned member on join");
            return;
        }
        info!(target: EVENT_TARGET, guild, user, "Removed banned member on join");

        let system_channel = ctx
            .cache
            .guild(new_member.guild_id)
            .and_then(|g| g.system_channel_id);
        if let Some(channel) = system_channel {
            let subject = Subject::new(user, new_member.user.name.clone());
            self.data
                .notifier
                .banned_member_removed(channel.get(), &subject)
                .await;
        }
    }
}
