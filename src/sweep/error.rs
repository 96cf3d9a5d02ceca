//! Error types for the sweep system

use crate::store::StoreError;
use thiserror::Error;

/// Errors that can occur while firing a due record
#[derive(Debug, Error)]
pub enum SweepError {
    /// Record lacks a field the handler needs, or holds a malformed value
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<poise::serenity_prelude::Error>),

    /// Notification could not be delivered by any route
    #[error("Notification not delivered to user {0}")]
    Undelivered(u64),

    /// Document could not be read or written
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<poise::serenity_prelude::Error> for SweepError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

/// Result type for sweep operations
pub type SweepResult<T> = Result<T, SweepError>;
