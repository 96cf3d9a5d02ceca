//! Typed views over store documents
//!
//! Each repository owns one document and changes it only through
//! `FileStore::update`, so command writes and sweep writes never clobber each
//! other.

mod economy;
mod leveling;
mod moderation;
mod reminders;

pub use economy::{
    DAILY_COOLDOWN_HOURS, DAILY_REWARD, DailyClaim, ECONOMY_KEY, EconomyRepository, Wallet,
};
pub use leveling::{
    LEVELING_KEY, LevelProfile, LevelingRepository, XP_COOLDOWN_SECS, XpAward, xp_for_next_level,
};
pub use moderation::{
    ModerationRepository, NewPunishment, PUNISHMENTS_KEY, PunishmentKind, PunishmentRecord,
    WarningRecord,
};
pub use reminders::{REMINDERS_KEY, ReminderRecord, ReminderRepository};

use crate::store::{Document, FileStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Document {key} does not have the expected shape: {source}")]
    Malformed {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Insufficient funds: balance is {balance}, needed {needed}")]
    InsufficientFunds { balance: i64, needed: i64 },

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duration {0} runs past the supported date range")]
    DurationOutOfRange(chrono::Duration),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

fn decode<D>(key: &'static str, document: Option<&Document>) -> RepositoryResult<D>
where
    D: DeserializeOwned + Default,
{
    match document {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|source| RepositoryError::Malformed { key, source }),
        None => Ok(D::default()),
    }
}

/// Read a typed document; a missing document is the default
async fn load<D>(store: &FileStore, key: &'static str) -> RepositoryResult<D>
where
    D: DeserializeOwned + Default,
{
    let document = store.read(key).await?;
    decode(key, document.as_ref())
}

/// Read-modify-write a typed document under the store's key lock.
///
/// Nothing is written when `f` fails or leaves the document unchanged.
async fn modify<D, T, F>(store: &FileStore, key: &'static str, f: F) -> RepositoryResult<T>
where
    D: Serialize + DeserializeOwned + Default + Clone + PartialEq,
    F: FnOnce(&mut D) -> RepositoryResult<T>,
{
    store
        .update(key, |document: &mut Option<Document>| {
            let before: D = decode(key, document.as_ref())?;
            let mut after = before.clone();
            let result = f(&mut after)?;
            if after != before {
                let value = serde_json::to_value(&after)
                    .map_err(|source| RepositoryError::Malformed { key, source })?;
                *document = Some(value);
            }
            Ok(result)
        })
        .await
}
