use crate::DataAdminExt;
use crate::duration::parse_duration;
use crate::moderation::{
    AuditQuery, Destination, ModerationAction, NotificationTarget, Operator, Origin, Subject,
};
use crate::{Context, Error};
use poise::{CreateReply, command};
use poise::serenity_prelude as serenity;
use tracing::{info, warn};

/// Every command the bot registers
pub fn all() -> Vec<poise::Command<crate::Data, Error>> {
    vec![
        ban(),
        mute(),
        kick(),
        unban(),
        unmute(),
        authorize(),
        revoke(),
        cachestatus(),
        addmod(),
        delmod(),
        mods(),
        groups(),
        setchannel(),
        localmods(),
        logs(),
    ]
}

fn origin(ctx: Context<'_>) -> Origin {
    let Some(guild_id) = ctx.guild_id() else {
        return Origin::new(None, "");
    };
    let name = ctx
        .guild()
        .map(|guild| guild.name.clone())
        .unwrap_or_default();
    Origin::new(Some(guild_id.get()), name)
}

fn operator(ctx: Context<'_>) -> Operator {
    let author = ctx.author();
    Operator::new(author.id.get(), author.name.clone())
}

/// Seconds from a duration argument; `None` is permanent
fn duration_arg(duration: Option<&str>) -> Result<Option<u32>, String> {
    match duration.map(parse_duration).transpose() {
        Ok(secs) => Ok(secs.filter(|s| *s > 0)),
        Err(e) => Err(e.to_string()),
    }
}

/// Run the permission ladder, acknowledge, fan out, then report the outcome
async fn moderate(ctx: Context<'_>, user: serenity::User, action: ModerationAction) -> Result<(), Error> {
    let data = ctx.data();
    let actor = ctx.author().id.get();
    let destination = ctx.guild_id().map(serenity::GuildId::get);

    let decision = data.permissions.check(actor, destination).await;
    if !decision.allowed {
        warn!(actor, destination = ?destination, reason = %decision.reason, "Moderation command denied");
        ctx.send(
            CreateReply::default()
                .content(format!("Permission denied ({})", decision.reason))
                .ephemeral(true),
        )
        .await?;
        return Ok(());
    }

    let action_type = action.get_type();
    let reply = ctx.say(format!("Processing {action_type}...")).await?;

    let subject = Subject::new(user.id.get(), user.name.clone());
    let summary = data
        .service
        .enforce_batch(action, vec![subject], origin(ctx), operator(ctx))
        .await;

    info!(
        action = %action_type,
        actor,
        reason = %decision.reason,
        succeeded = summary.succeeded(),
        "Moderation command finished"
    );
    reply
        .edit(ctx, CreateReply::default().content(summary.render()))
        .await?;
    Ok(())
}

async fn reply_invalid_duration(ctx: Context<'_>, error: String) -> Result<(), Error> {
    ctx.send(
        CreateReply::default()
            .content(format!("Invalid duration: {error}"))
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Ban a member from every authorized group
#[command(slash_command, prefix_command)]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "Member to ban"] user: serenity::User,
    #[description = "Duration like 30m, 2h or 1d; permanent when omitted"] duration: Option<String>,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    match duration_arg(duration.as_deref()) {
        Ok(duration) => moderate(ctx, user, ModerationAction::ban(duration, reason)).await,
        Err(e) => reply_invalid_duration(ctx, e).await,
    }
}

/// Mute a member in every authorized group
#[command(slash_command, prefix_command)]
pub async fn mute(
    ctx: Context<'_>,
    #[description = "Member to mute"] user: serenity::User,
    #[description = "Duration like 30m, 2h or 1d; permanent when omitted"] duration: Option<String>,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    match duration_arg(duration.as_deref()) {
        Ok(duration) => moderate(ctx, user, ModerationAction::mute(duration, reason)).await,
        Err(e) => reply_invalid_duration(ctx, e).await,
    }
}

/// Kick a member from every authorized group; they may rejoin
#[command(slash_command, prefix_command)]
pub async fn kick(
    ctx: Context<'_>,
    #[description = "Member to kick"] user: serenity::User,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    moderate(ctx, user, ModerationAction::kick(reason)).await
}

/// Lift a ban everywhere
#[command(slash_command, prefix_command)]
pub async fn unban(
    ctx: Context<'_>,
    #[description = "Member to unban"] user: serenity::User,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    moderate(ctx, user, ModerationAction::unban(reason)).await
}

/// Lift a mute everywhere
#[command(slash_command, prefix_command)]
pub async fn unmute(
    ctx: Context<'_>,
    #[description = "Member to unmute"] user: serenity::User,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    moderate(ctx, user, ModerationAction::unmute(reason)).await
}

async fn root_only(ctx: Context<'_>) -> Result<bool, Error> {
    let allowed = ctx.data().is_root(ctx.author().id.get());
    if !allowed {
        ctx.send(
            CreateReply::default()
                .content("Only root operators can use this command")
                .ephemeral(true),
        )
        .await?;
    }
    Ok(allowed)
}

/// The explicit id, else the current guild
fn target_destination(ctx: Context<'_>, id: Option<&str>) -> Result<u64, String> {
    match id {
        Some(id) => id
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| format!("`{id}` is not a valid group id")),
        None => ctx
            .guild_id()
            .map(serenity::GuildId::get)
            .ok_or_else(|| "Give a group id or run this inside a group".to_string()),
    }
}

/// Authorize a group for moderation
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn authorize(
    ctx: Context<'_>,
    #[description = "Group id; the current group when omitted"] id: Option<String>,
) -> Result<(), Error> {
    let destination = match target_destination(ctx, id.as_deref()) {
        Ok(destination) => destination,
        Err(e) => {
            ctx.say(e).await?;
            return Ok(());
        }
    };

    let current = origin(ctx);
    let name = if current.destination == Some(destination) && !current.name.is_empty() {
        current.name
    } else {
        destination.to_string()
    };

    let data = ctx.data();
    data.store
        .authorize_destination(Destination::authorized(destination, name.clone(), None))
        .await?;
    data.cache.add(destination);

    info!(destination, name = %name, actor = ctx.author().id.get(), "Group authorized");
    ctx.say(format!("Authorized {name} ({destination})")).await?;
    Ok(())
}

/// Revoke a group's authorization
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn revoke(
    ctx: Context<'_>,
    #[description = "Group id; the current group when omitted"] id: Option<String>,
) -> Result<(), Error> {
    let destination = match target_destination(ctx, id.as_deref()) {
        Ok(destination) => destination,
        Err(e) => {
            ctx.say(e).await?;
            return Ok(());
        }
    };

    let data = ctx.data();
    let existed = data.store.revoke_destination(destination).await?;
    data.cache.remove(destination);

    if existed {
        info!(destination, actor = ctx.author().id.get(), "Group authorization revoked");
        ctx.say(format!("Revoked authorization for {destination}")).await?;
    } else {
        ctx.say(format!("{destination} was not authorized")).await?;
    }
    Ok(())
}

async fn reply_private(ctx: Context<'_>, text: impl Into<String>) -> Result<(), Error> {
    ctx.send(CreateReply::default().content(text).ephemeral(true))
        .await?;
    Ok(())
}

/// Show the authorization cache state
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn cachestatus(ctx: Context<'_>) -> Result<(), Error> {
    let status = ctx.data().cache.status();
    reply_private(ctx, status.to_string()).await
}

/// Grant a member moderator rights in every authorized group
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn addmod(
    ctx: Context<'_>,
    #[description = "Member to promote"] user: serenity::User,
) -> Result<(), Error> {
    let added = ctx
        .data()
        .add_moderator(user.id.get(), &user.name, ctx.author().id.get())
        .await?;
    let text = if added {
        format!("{} is now a global moderator", user.name)
    } else {
        format!("{} is already a global moderator", user.name)
    };
    ctx.say(text).await?;
    Ok(())
}

/// Revoke a member's global moderator rights
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn delmod(
    ctx: Context<'_>,
    #[description = "Member to demote"] user: serenity::User,
) -> Result<(), Error> {
    let text = if ctx.data().remove_moderator(user.id.get()).await? {
        format!("{} is no longer a global moderator", user.name)
    } else {
        format!("{} was not a global moderator", user.name)
    };
    ctx.say(text).await?;
    Ok(())
}

/// List global moderators
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn mods(ctx: Context<'_>) -> Result<(), Error> {
    let report = ctx.data().moderators_report().await?;
    reply_private(ctx, report).await
}

/// List authorized groups
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn groups(ctx: Context<'_>) -> Result<(), Error> {
    let report = ctx.data().groups_report().await?;
    reply_private(ctx, report).await
}

/// Post operator notifications in a channel
#[command(slash_command, prefix_command, guild_only, check = "root_only")]
pub async fn setchannel(
    ctx: Context<'_>,
    #[description = "Channel; the current one when omitted"] channel: Option<serenity::Channel>,
) -> Result<(), Error> {
    let target = match channel {
        Some(channel) => {
            let Some(channel) = channel.guild() else {
                return reply_private(ctx, "Pick a channel inside a group").await;
            };
            NotificationTarget::new(channel.guild_id.get(), channel.id.get())
        }
        None => {
            let guild_id = ctx.guild_id().ok_or("Run this inside a group")?;
            NotificationTarget::new(guild_id.get(), ctx.channel_id().get())
        }
    };

    ctx.data().set_notification(target).await?;
    info!(
        destination = target.destination,
        channel = target.channel,
        actor = ctx.author().id.get(),
        "Notification channel set"
    );
    ctx.say(format!("Notifications will be posted in <#{}>", target.channel))
        .await?;
    Ok(())
}

/// Allow or stop group-local moderators using moderation commands
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn localmods(
    ctx: Context<'_>,
    #[description = "Whether group moderators may act"] enabled: bool,
) -> Result<(), Error> {
    ctx.data().set_destination_moderators(enabled).await?;
    info!(enabled, actor = ctx.author().id.get(), "Group moderators toggled");
    let text = if enabled {
        "Group moderators can use moderation commands"
    } else {
        "Only root operators and global moderators can use moderation commands"
    };
    ctx.say(text).await?;
    Ok(())
}

/// Query the operation log
#[command(
    slash_command,
    prefix_command,
    check = "root_only",
    subcommands("member", "group", "failed"),
    subcommand_required
)]
pub async fn logs(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Entries targeting a member
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn member(
    ctx: Context<'_>,
    #[description = "Member"] user: serenity::User,
    #[description = "How many entries, at most 25"] limit: Option<u32>,
) -> Result<(), Error> {
    let report = ctx
        .data()
        .audit_report(AuditQuery::Subject(user.id.get()), limit_arg(limit))
        .await?;
    reply_private(ctx, report).await
}

/// Entries issued from a group
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn group(
    ctx: Context<'_>,
    #[description = "Group id; the current group when omitted"] id: Option<String>,
    #[description = "How many entries, at most 25"] limit: Option<u32>,
) -> Result<(), Error> {
    let destination = match target_destination(ctx, id.as_deref()) {
        Ok(destination) => destination,
        Err(e) => return reply_private(ctx, e).await,
    };
    let report = ctx
        .data()
        .audit_report(AuditQuery::Destination(destination), limit_arg(limit))
        .await?;
    reply_private(ctx, report).await
}

/// Entries that failed everywhere
#[command(slash_command, prefix_command, check = "root_only")]
pub async fn failed(
    ctx: Context<'_>,
    #[description = "How many entries, at most 25"] limit: Option<u32>,
) -> Result<(), Error> {
    let report = ctx
        .data()
        .audit_report(AuditQuery::Failed, limit_arg(limit))
        .await?;
    reply_private(ctx, report).await
}

fn limit_arg(limit: Option<u32>) -> Option<usize> {
    limit.and_then(|n| usize::try_from(n).ok())
}
