use crate::repository::XpAward;
use crate::{Data, EVENT_TARGET};
use chrono::Utc;
use poise::serenity_prelude::{self as serenity, Context, EventHandler, GuildId, Message, Ready};
use tracing::{debug, error, info, warn};

pub struct Handler {
    data: Data,
}

impl Handler {
    #[must_use]
    pub const fn new(data: Data) -> Self {
        Self { data }
    }
}

/// Congratulation posted when a message pushes a member to a new level
#[must_use]
pub fn level_up_message(user_id: u64, award: &XpAward) -> Option<String> {
    award
        .leveled_up
        .then(|| format!("<@{user_id}> reached level {}!", award.level))
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!(target: EVENT_TARGET, "Connected as {user_name}, shard {shard_id}");
    }

    /// Called when the cache is fully populated.
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

    /// Award message XP in guilds
    async fn message(&self, ctx: Context, message: Message) {
        if message.author.bot {
            return;
        }
        let Some(guild_id) = message.guild_id else {
            return;
        };

        let user_id = message.author.id.get();
        let award = match self
            .data
            .leveling
            .award_message_xp(guild_id.get(), user_id, Utc::now())
            .await
        {
            Ok(Some(award)) => award,
            Ok(None) => return,
            Err(e) => {
                error!(target: EVENT_TARGET, user_id, error = %e, "Failed to award message XP");
                return;
            }
        };
        debug!(target: EVENT_TARGET, user_id, gained = award.gained, "Awarded message XP");

        if let Some(text) = level_up_message(user_id, &award) {
            if let Err(e) = message.channel_id.say(&ctx.http, text).await {
                warn!(target: EVENT_TARGET, user_id, error = %e, "Failed to announce level up");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // This test verifies at compile time that Handler implements EventHandler
    #[test]
    fn test_handler_implements_event_handler() {
        fn assert_impl<T: EventHandler>() {}
        assert_impl::<Handler>();
    }

    #[test]
    fn test_level_up_message() {
        let award = XpAward {
            gained: 20,
            level: 3,
            leveled_up: true,
        };
        assert_eq!(
            level_up_message(42, &award).as_deref(),
            Some("<@42> reached level 3!")
        );

        let quiet = XpAward {
            leveled_up: false,
            ..award
        };
        assert_eq!(level_up_message(42, &quiet), None);
    }
}
