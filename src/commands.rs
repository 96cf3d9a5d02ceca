use crate::repository::{
    DailyClaim, NewPunishment, PunishmentKind, PunishmentRecord, RepositoryError,
    xp_for_next_level,
};
use crate::{COMMAND_TARGET, Data, ERROR_TARGET, Error};
use chrono::{DateTime, Duration, Utc};
use poise::serenity_prelude::{self as serenity, EditMember};
use poise::{Context, command};
use tracing::{error, info};

/// Discord rejects timeouts longer than this
const MAX_TIMEOUT_DAYS: i64 = 28;
const STORAGE_FAILURE_REPLY: &str = "Something went wrong saving that. Please try again later.";

/// Parse a duration such as `90s`, `10m`, `1h30m` or `2d`
#[must_use]
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim().to_ascii_lowercase();
    if input.is_empty() {
        return None;
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: i64 = digits.parse().ok()?;
        digits.clear();
        let part = match c {
            's' => Duration::try_seconds(amount)?,
            'm' => Duration::try_minutes(amount)?,
            'h' => Duration::try_hours(amount)?,
            'd' => Duration::try_days(amount)?,
            'w' => Duration::try_weeks(amount)?,
            _ => return None,
        };
        total = total.checked_add(&part)?;
    }

    // Trailing digits without a unit
    if !digits.is_empty() || total <= Duration::zero() {
        return None;
    }
    Some(total)
}

/// Parse `input` as a delay from `now`, returning the delay and the instant
/// it ends. `None` when the input is not a duration or ends past the
/// representable date range.
#[must_use]
pub fn parse_deadline(input: &str, now: DateTime<Utc>) -> Option<(Duration, DateTime<Utc>)> {
    let delay = parse_duration(input)?;
    let deadline = now.checked_add_signed(delay)?;
    Some((delay, deadline))
}

/// Render a duration as `1d 2h 3m`, dropping zero parts
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        total % 86_400 / 3_600,
        total % 3_600 / 60,
        total % 60,
    );

    let parts: Vec<String> = [(days, "d"), (hours, "h"), (minutes, "m"), (seconds, "s")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

/// Log a repository failure and tell the user to retry
async fn report_failure(
    ctx: Context<'_, Data, Error>,
    action: &str,
    error: &RepositoryError,
) -> Result<(), Error> {
    error!(
        target: ERROR_TARGET,
        command = %ctx.command().qualified_name,
        action,
        error = %error,
        "Repository operation failed"
    );
    ctx.say(STORAGE_FAILURE_REPLY).await?;
    Ok(())
}

/// Drop a punishment record whose Discord action failed, so the sweep does
/// not later lift something that was never applied
async fn revoke_unapplied(
    ctx: Context<'_, Data, Error>,
    record: &PunishmentRecord,
    kind: PunishmentKind,
) {
    match ctx.data().moderation.revoke(kind, &record.id).await {
        Ok(_) => info!(
            target: COMMAND_TARGET,
            record_id = %record.id,
            kind = %kind,
            "Revoked punishment that Discord rejected"
        ),
        Err(e) => error!(
            target: ERROR_TARGET,
            record_id = %record.id,
            kind = %kind,
            error = %e,
            "Failed to revoke unapplied punishment"
        ),
    }
}

async fn reply_bad_duration(ctx: Context<'_, Data, Error>, input: &str) -> Result<(), Error> {
    ctx.say(format!(
        "I couldn't understand `{input}` as a duration. Try something like `10m`, `2h` or `1d12h`."
    ))
    .await?;
    Ok(())
}

/// Basic ping command
/// This command is used to check if the bot is responsive.
#[command(prefix_command, slash_command, guild_only)]
pub async fn ping(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    ctx.say("Pong!").await?;
    Ok(())
}

/// Set a reminder, delivered by DM when it is due
#[command(prefix_command, slash_command)]
pub async fn remind(
    ctx: Context<'_, Data, Error>,
    #[description = "When to remind you, e.g. 10m, 2h, 1d"] when: String,
    #[description = "What to remind you about"]
    #[rest]
    message: String,
) -> Result<(), Error> {
    let now = Utc::now();
    let Some((delay, remind_at)) = parse_deadline(&when, now) else {
        return reply_bad_duration(ctx, &when).await;
    };

    let channel_id = Some(ctx.channel_id().get());
    match ctx
        .data()
        .reminders
        .add(ctx.author().id.get(), channel_id, message, remind_at, now)
        .await
    {
        Ok(reminder) => {
            ctx.say(format!(
                "Okay, I'll remind you in {} (id `{}`).",
                format_duration(delay),
                reminder.short_id()
            ))
            .await?;
            Ok(())
        }
        Err(e) => report_failure(ctx, "add reminder", &e).await,
    }
}

/// List your pending reminders
#[command(prefix_command, slash_command)]
pub async fn reminders(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    let pending = match ctx.data().reminders.active_for(ctx.author().id.get()).await {
        Ok(pending) => pending,
        Err(e) => return report_failure(ctx, "list reminders", &e).await,
    };

    if pending.is_empty() {
        ctx.say("You have no pending reminders.").await?;
        return Ok(());
    }

    let lines: Vec<String> = pending
        .iter()
        .map(|reminder| {
            format!(
                "`{}` <t:{}:R> {}",
                reminder.short_id(),
                reminder.remind_at.timestamp(),
                reminder.message
            )
        })
        .collect();
    ctx.say(lines.join("\n")).await?;
    Ok(())
}

/// Cancel one of your pending reminders
#[command(prefix_command, slash_command)]
pub async fn cancel_reminder(
    ctx: Context<'_, Data, Error>,
    #[description = "Reminder id from /reminders"] id: String,
) -> Result<(), Error> {
    match ctx.data().reminders.cancel(ctx.author().id.get(), &id).await {
        Ok(reminder) => {
            ctx.say(format!("Cancelled reminder `{}`.", reminder.short_id()))
                .await?;
            Ok(())
        }
        Err(RepositoryError::NotFound(_)) => {
            ctx.say(format!("You have no pending reminder `{id}`.")).await?;
            Ok(())
        }
        Err(e) => report_failure(ctx, "cancel reminder", &e).await,
    }
}

/// Ban a member for a limited time
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "BAN_MEMBERS"
)]
pub async fn tempban(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to ban"] user: serenity::User,
    #[description = "How long, e.g. 1d or 12h"] duration: String,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let now = Utc::now();
    let Some((length, _)) = parse_deadline(&duration, now) else {
        return reply_bad_duration(ctx, &duration).await;
    };
    let reason = reason.unwrap_or_else(|| "No reason given".to_string());

    // Record first so a crash between the two steps leaves an expiry behind
    let record = match ctx
        .data()
        .moderation
        .add_temp_ban(
            NewPunishment {
                guild_id: guild_id.get(),
                user_id: user.id.get(),
                moderator_id: ctx.author().id.get(),
                reason: reason.clone(),
                duration: length,
                channel_id: None,
            },
            now,
        )
        .await
    {
        Ok(record) => record,
        Err(e) => return report_failure(ctx, "record temp ban", &e).await,
    };

    if let Err(e) = guild_id
        .ban_with_reason(ctx.http(), user.id, 0, &reason)
        .await
    {
        revoke_unapplied(ctx, &record, PunishmentKind::TempBan).await;
        return Err(e.into());
    }

    info!(
        target: COMMAND_TARGET,
        guild_id = guild_id.get(),
        user_id = user.id.get(),
        expires_at = %record.expires_at,
        "Temporary ban applied"
    );
    ctx.say(format!(
        "Banned {} for {}. The ban lifts <t:{}:R>.",
        user.name,
        format_duration(length),
        record.expires_at.timestamp()
    ))
    .await?;
    Ok(())
}

/// Time out a member
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn timeout(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to time out"] user: serenity::User,
    #[description = "How long, at most 28d"] duration: String,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let now = Utc::now();
    let Some((length, _)) = parse_deadline(&duration, now) else {
        return reply_bad_duration(ctx, &duration).await;
    };
    if length > Duration::days(MAX_TIMEOUT_DAYS) {
        ctx.say(format!("Timeouts can last at most {MAX_TIMEOUT_DAYS} days."))
            .await?;
        return Ok(());
    }
    let reason = reason.unwrap_or_else(|| "No reason given".to_string());

    let record = match ctx
        .data()
        .moderation
        .add_timeout(
            NewPunishment {
                guild_id: guild_id.get(),
                user_id: user.id.get(),
                moderator_id: ctx.author().id.get(),
                reason: reason.clone(),
                duration: length,
                channel_id: Some(ctx.channel_id().get()),
            },
            now,
        )
        .await
    {
        Ok(record) => record,
        Err(e) => return report_failure(ctx, "record timeout", &e).await,
    };

    let builder = EditMember::new()
        .disable_communication_until(record.expires_at.to_rfc3339())
        .audit_log_reason(&reason);
    if let Err(e) = guild_id.edit_member(ctx.http(), user.id, builder).await {
        revoke_unapplied(ctx, &record, PunishmentKind::Timeout).await;
        return Err(e.into());
    }

    ctx.say(format!(
        "Timed out {} for {}.",
        user.name,
        format_duration(length)
    ))
    .await?;
    Ok(())
}

/// Warn a member
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn warn(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to warn"] user: serenity::User,
    #[description = "Reason"]
    #[rest]
    reason: String,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let moderation = &ctx.data().moderation;
    let recorded = moderation
        .add_warning(
            guild_id.get(),
            user.id.get(),
            ctx.author().id.get(),
            reason,
            Utc::now(),
        )
        .await;
    if let Err(e) = recorded {
        return report_failure(ctx, "record warning", &e).await;
    }

    let count = match moderation.warnings_for(guild_id.get(), user.id.get()).await {
        Ok(warnings) => warnings.len(),
        Err(e) => return report_failure(ctx, "count warnings", &e).await,
    };
    ctx.say(format!("Warned {}. They now have {count} warning(s).", user.name))
        .await?;
    Ok(())
}

/// Show a member's warnings and active punishments
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn warnings(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to look up"] user: serenity::User,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let moderation = &ctx.data().moderation;
    let (warnings, active) = match tokio::try_join!(
        moderation.warnings_for(guild_id.get(), user.id.get()),
        moderation.active_punishments_for(guild_id.get(), user.id.get())
    ) {
        Ok(found) => found,
        Err(e) => return report_failure(ctx, "look up history", &e).await,
    };

    let mut lines = vec![format!("**{}**: {} warning(s)", user.name, warnings.len())];
    lines.extend(
        warnings.iter().map(|warning| {
            format!("- <t:{}:d> {}", warning.created_at.timestamp(), warning.reason)
        }),
    );
    lines.extend(active.iter().map(|(kind, record)| {
        format!("- Active {kind}, ends <t:{}:R>", record.expires_at.timestamp())
    }));
    ctx.say(lines.join("\n")).await?;
    Ok(())
}

/// Show a coin balance
#[command(prefix_command, slash_command)]
pub async fn balance(
    ctx: Context<'_, Data, Error>,
    #[description = "Whose balance to show"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let user = user.as_ref().unwrap_or_else(|| ctx.author());
    match ctx.data().economy.balance(user.id.get()).await {
        Ok(coins) => {
            ctx.say(format!("{} has {coins} coins.", user.name)).await?;
            Ok(())
        }
        Err(e) => report_failure(ctx, "read balance", &e).await,
    }
}

/// Claim your daily coins
#[command(prefix_command, slash_command)]
pub async fn daily(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    match ctx
        .data()
        .economy
        .claim_daily(ctx.author().id.get(), Utc::now())
        .await
    {
        Ok(DailyClaim::Claimed { reward, balance }) => {
            ctx.say(format!("You claimed {reward} coins. Balance: {balance}."))
                .await?;
            Ok(())
        }
        Ok(DailyClaim::Cooldown { remaining }) => {
            ctx.say(format!(
                "You already claimed today. Come back in {}.",
                format_duration(remaining)
            ))
            .await?;
            Ok(())
        }
        Err(e) => report_failure(ctx, "claim daily", &e).await,
    }
}

/// Give some of your coins to another member
#[command(prefix_command, slash_command)]
pub async fn pay(
    ctx: Context<'_, Data, Error>,
    #[description = "Who to pay"] user: serenity::User,
    #[description = "How many coins"] amount: i64,
) -> Result<(), Error> {
    if user.id == ctx.author().id {
        ctx.say("You can't pay yourself.").await?;
        return Ok(());
    }
    match ctx
        .data()
        .economy
        .transfer(ctx.author().id.get(), user.id.get(), amount)
        .await
    {
        Ok(remaining) => {
            ctx.say(format!(
                "Paid {amount} coins to {}. You have {remaining} left.",
                user.name
            ))
            .await?;
            Ok(())
        }
        Err(RepositoryError::InsufficientFunds { balance, .. }) => {
            ctx.say(format!("You only have {balance} coins.")).await?;
            Ok(())
        }
        Err(RepositoryError::InvalidAmount(_)) => {
            ctx.say("The amount must be positive.").await?;
            Ok(())
        }
        Err(e) => report_failure(ctx, "transfer coins", &e).await,
    }
}

/// Show level and XP
#[command(prefix_command, slash_command, guild_only)]
pub async fn rank(
    ctx: Context<'_, Data, Error>,
    #[description = "Whose rank to show"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let user = user.as_ref().unwrap_or_else(|| ctx.author());
    match ctx.data().leveling.profile(guild_id.get(), user.id.get()).await {
        Ok(profile) => {
            ctx.say(format!(
                "{} is level {} ({}/{} XP, {} total).",
                user.name,
                profile.level,
                profile.xp,
                xp_for_next_level(profile.level),
                profile.total_xp
            ))
            .await?;
            Ok(())
        }
        Err(e) => report_failure(ctx, "read profile", &e).await,
    }
}

/// Run the expiry sweep now
#[command(
    prefix_command,
    slash_command,
    guild_only,
    required_permissions = "ADMINISTRATOR"
)]
pub async fn sweep(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    if ctx.data().request_sweep().await {
        ctx.say("Sweep requested.").await?;
    } else {
        ctx.say("The sweep task is not running.").await?;
    }
    Ok(())
}

/// Every command the bot registers
#[must_use]
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        ping(),
        remind(),
        reminders(),
        cancel_reminder(),
        tempban(),
        timeout(),
        warn(),
        warnings(),
        balance(),
        daily(),
        pay(),
        rank(),
        sweep(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test that the ping command is properly defined
    #[test]
    fn test_ping_command_definition() {
        let cmd = ping();
        assert_eq!(cmd.name, "ping");
        assert!(cmd.description.clone().unwrap_or_default().contains("check if the bot is responsive"));
        assert!(cmd.guild_only);
        assert!(cmd.create_as_slash_command().is_some());
    }

    #[test]
    fn test_moderation_commands_need_permissions() {
        assert!(tempban().required_permissions.contains(serenity::Permissions::BAN_MEMBERS));
        assert!(timeout().required_permissions.contains(serenity::Permissions::MODERATE_MEMBERS));
        assert!(warn().required_permissions.contains(serenity::Permissions::MODERATE_MEMBERS));
        assert!(sweep().required_permissions.contains(serenity::Permissions::ADMINISTRATOR));
        assert!(balance().required_permissions.is_empty());
    }

    #[test]
    fn test_command_names_are_unique() {
        let mut names: Vec<String> = all().into_iter().map(|cmd| cmd.name).collect();
        let count = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), count);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s"), Some(Duration::seconds(90)));
        assert_eq!(parse_duration("10m"), Some(Duration::minutes(10)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration(" 2D "), Some(Duration::days(2)));
        assert_eq!(parse_duration("1w"), Some(Duration::weeks(1)));

        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("0m"), None);
        assert_eq!(parse_duration("5y"), None);
        assert_eq!(parse_duration("99999999999999999d"), None);
    }

    #[test]
    fn test_parse_deadline_stays_in_range() {
        let now = Utc::now();
        assert_eq!(
            parse_deadline("10m", now),
            Some((Duration::minutes(10), now + Duration::minutes(10)))
        );
        assert_eq!(parse_deadline("later", now), None);

        // A valid duration whose end lies past the last representable date
        assert!(parse_duration("100000000w").is_some());
        assert_eq!(parse_deadline("100000000w", now), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::minutes(90)), "1h 30m");
        assert_eq!(format_duration(Duration::days(1) + Duration::seconds(5)), "1d 5s");
        assert_eq!(format_duration(Duration::zero()), "0s");
        assert_eq!(format_duration(Duration::seconds(-3)), "0s");
    }
}
