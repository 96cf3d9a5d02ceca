use super::{RepositoryError, RepositoryResult, load, modify};
use crate::store::FileStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const REMINDERS_KEY: &str = "reminders";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub remind_at: DateTime<Utc>,
    pub active: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReminderRecord {
    /// Leading part of the id, enough to tell a user's reminders apart
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RemindersDocument {
    #[serde(default)]
    reminders: Vec<ReminderRecord>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// User reminders in the `reminders` document
#[derive(Debug, Clone)]
pub struct ReminderRepository {
    store: FileStore,
}

impl ReminderRepository {
    #[must_use]
    pub const fn new(store: FileStore) -> Self {
        Self { store }
    }

    /// # Errors
    /// Store or shape errors.
    pub async fn add(
        &self,
        user_id: u64,
        channel_id: Option<u64>,
        message: String,
        remind_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<ReminderRecord> {
        let reminder = ReminderRecord {
            id: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            channel_id: channel_id.map(|id| id.to_string()),
            message,
            created_at: now,
            remind_at,
            active: true,
            extra: Map::new(),
        };
        let stored = reminder.clone();
        modify(&self.store, REMINDERS_KEY, move |document: &mut RemindersDocument| {
            document.reminders.push(stored);
            Ok(())
        })
        .await?;
        Ok(reminder)
    }

    /// Pending reminders of a user, soonest first
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn active_for(&self, user_id: u64) -> RepositoryResult<Vec<ReminderRecord>> {
        let user_id = user_id.to_string();
        let document: RemindersDocument = load(&self.store, REMINDERS_KEY).await?;
        let mut reminders: Vec<ReminderRecord> = document
            .reminders
            .into_iter()
            .filter(|reminder| reminder.active && reminder.user_id == user_id)
            .collect();
        reminders.sort_by_key(|reminder| reminder.remind_at);
        Ok(reminders)
    }

    /// Remove a pending reminder by id or id prefix
    ///
    /// # Errors
    /// `NotFound` if the user has no pending reminder with that id, store or
    /// shape errors.
    pub async fn cancel(&self, user_id: u64, id: &str) -> RepositoryResult<ReminderRecord> {
        let user_id = user_id.to_string();
        let id = id.trim().to_lowercase();
        modify(&self.store, REMINDERS_KEY, |document: &mut RemindersDocument| {
            let position = document
                .reminders
                .iter()
                .position(|reminder| {
                    reminder.active
                        && reminder.user_id == user_id
                        && !id.is_empty()
                        && reminder.id.starts_with(&id)
                })
                .ok_or_else(|| RepositoryError::NotFound(format!("reminder {id}")))?;
            Ok(document.reminders.remove(position))
        })
        .await
    }
}
