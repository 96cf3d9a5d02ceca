//! Guild moderation capability used by the expiry sweeps
//!
//! Reversals must be idempotent: a ban that is already gone or a member that
//! already left is reported as `AlreadyClear`, not as an error.

use crate::sweep::{SweepError, SweepResult};
use async_trait::async_trait;
use poise::serenity_prelude::{self as serenity, EditMember, GuildId, Http, UserId};
use std::sync::Arc;
use tracing::info;

/// What a reversal did on the Discord side
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ActionOutcome {
    #[display("applied")]
    Applied,
    #[display("already clear")]
    AlreadyClear,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GuildModeration: Send + Sync {
    /// Lift a ban
    async fn unban(&self, guild_id: u64, user_id: u64) -> SweepResult<ActionOutcome>;

    /// Lift a communication timeout
    async fn remove_timeout(&self, guild_id: u64, user_id: u64) -> SweepResult<ActionOutcome>;
}

/// `GuildModeration` over the Discord HTTP client
pub struct HttpGuildModeration {
    http: Arc<Http>,
}

impl HttpGuildModeration {
    #[must_use]
    pub const fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

/// Discord answers 404 when the ban, member or guild no longer exists
fn is_unknown_resource(error: &serenity::Error) -> bool {
    matches!(
        error,
        serenity::Error::Http(serenity::HttpError::UnsuccessfulRequest(response))
            if response.status_code.as_u16() == 404
    )
}

fn snowflakes(guild_id: u64, user_id: u64) -> SweepResult<(GuildId, UserId)> {
    if guild_id == 0 || user_id == 0 {
        return Err(SweepError::InvalidRecord(format!(
            "guild {guild_id} / user {user_id} is not a valid snowflake"
        )));
    }
    Ok((GuildId::new(guild_id), UserId::new(user_id)))
}

#[async_trait]
impl GuildModeration for HttpGuildModeration {
    async fn unban(&self, guild_id: u64, user_id: u64) -> SweepResult<ActionOutcome> {
        let (guild_id, user_id) = snowflakes(guild_id, user_id)?;
        match guild_id.unban(&*self.http, user_id).await {
            Ok(()) => {
                info!("Unbanned user {user_id} in guild {guild_id}");
                Ok(ActionOutcome::Applied)
            }
            Err(e) if is_unknown_resource(&e) => {
                info!("User {user_id} is no longer banned in guild {guild_id}");
                Ok(ActionOutcome::AlreadyClear)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_timeout(&self, guild_id: u64, user_id: u64) -> SweepResult<ActionOutcome> {
        let (guild_id, user_id) = snowflakes(guild_id, user_id)?;
        let builder = EditMember::new().enable_communication();
        match guild_id.edit_member(&*self.http, user_id, builder).await {
            Ok(_) => {
                info!("Removed timeout for user {user_id} in guild {guild_id}");
                Ok(ActionOutcome::Applied)
            }
            Err(e) if is_unknown_resource(&e) => {
                info!("User {user_id} is no longer in guild {guild_id}");
                Ok(ActionOutcome::AlreadyClear)
            }
            Err(e) => Err(e.into()),
        }
    }
}
