use super::{RepositoryError, RepositoryResult, load, modify};
use crate::store::FileStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const PUNISHMENTS_KEY: &str = "punishments";

/// Time-limited punishments the sweep reverses
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PunishmentKind {
    #[display("temporary ban")]
    TempBan,
    #[display("timeout")]
    Timeout,
}

impl PunishmentKind {
    /// Collection of the `punishments` document holding this kind
    #[must_use]
    pub const fn collection(self) -> &'static str {
        match self {
            Self::TempBan => "temp_bans",
            Self::Timeout => "mutes",
        }
    }
}

/// A temporary ban or timeout. Ids are stored as strings to keep every
/// snowflake exact in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunishmentRecord {
    pub id: String,
    pub guild_id: String,
    pub user_id: String,
    pub moderator_id: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    /// Fields written by others, e.g. the completion timestamp
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub id: String,
    pub guild_id: String,
    pub user_id: String,
    pub moderator_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to record a temporary punishment
#[derive(Debug, Clone)]
pub struct NewPunishment {
    pub guild_id: u64,
    pub user_id: u64,
    pub moderator_id: u64,
    pub reason: String,
    pub duration: Duration,
    /// Channel for the expiry notice if the user cannot be DMed
    pub channel_id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PunishmentsDocument {
    #[serde(default)]
    temp_bans: Vec<PunishmentRecord>,
    #[serde(default)]
    mutes: Vec<PunishmentRecord>,
    #[serde(default)]
    warnings: Vec<WarningRecord>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl PunishmentsDocument {
    fn records_mut(&mut self, kind: PunishmentKind) -> &mut Vec<PunishmentRecord> {
        match kind {
            PunishmentKind::TempBan => &mut self.temp_bans,
            PunishmentKind::Timeout => &mut self.mutes,
        }
    }
}

/// Moderation history in the `punishments` document
#[derive(Debug, Clone)]
pub struct ModerationRepository {
    store: FileStore,
}

impl ModerationRepository {
    #[must_use]
    pub const fn new(store: FileStore) -> Self {
        Self { store }
    }

    /// Record a temporary ban that the sweep lifts at expiry
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn add_temp_ban(
        &self,
        punishment: NewPunishment,
        now: DateTime<Utc>,
    ) -> RepositoryResult<PunishmentRecord> {
        self.add(PunishmentKind::TempBan, punishment, now).await
    }

    /// Record a timeout that the sweep lifts at expiry
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn add_timeout(
        &self,
        punishment: NewPunishment,
        now: DateTime<Utc>,
    ) -> RepositoryResult<PunishmentRecord> {
        self.add(PunishmentKind::Timeout, punishment, now).await
    }

    async fn add(
        &self,
        kind: PunishmentKind,
        punishment: NewPunishment,
        now: DateTime<Utc>,
    ) -> RepositoryResult<PunishmentRecord> {
        let expires_at = now
            .checked_add_signed(punishment.duration)
            .ok_or(RepositoryError::DurationOutOfRange(punishment.duration))?;
        let record = PunishmentRecord {
            id: Uuid::new_v4().to_string(),
            guild_id: punishment.guild_id.to_string(),
            user_id: punishment.user_id.to_string(),
            moderator_id: punishment.moderator_id.to_string(),
            reason: punishment.reason,
            channel_id: punishment.channel_id.map(|id| id.to_string()),
            created_at: now,
            expires_at,
            active: true,
            extra: Map::new(),
        };
        let stored = record.clone();
        modify(&self.store, PUNISHMENTS_KEY, move |document: &mut PunishmentsDocument| {
            document.records_mut(kind).push(stored);
            Ok(())
        })
        .await?;
        Ok(record)
    }

    /// Remove a punishment that never took effect, e.g. when Discord refused
    /// the ban. Returns `false` when no record has that id.
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn revoke(&self, kind: PunishmentKind, id: &str) -> RepositoryResult<bool> {
        modify(&self.store, PUNISHMENTS_KEY, |document: &mut PunishmentsDocument| {
            let records = document.records_mut(kind);
            let before = records.len();
            records.retain(|record| record.id != id);
            Ok(records.len() < before)
        })
        .await
    }

    /// # Errors
    /// Store or shape errors.
    pub async fn add_warning(
        &self,
        guild_id: u64,
        user_id: u64,
        moderator_id: u64,
        reason: String,
        now: DateTime<Utc>,
    ) -> RepositoryResult<WarningRecord> {
        let warning = WarningRecord {
            id: Uuid::new_v4().to_string(),
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            moderator_id: moderator_id.to_string(),
            reason,
            created_at: now,
        };
        let stored = warning.clone();
        modify(&self.store, PUNISHMENTS_KEY, move |document: &mut PunishmentsDocument| {
            document.warnings.push(stored);
            Ok(())
        })
        .await?;
        Ok(warning)
    }

    /// Warnings for a member, oldest first
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn warnings_for(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> RepositoryResult<Vec<WarningRecord>> {
        let (guild_id, user_id) = (guild_id.to_string(), user_id.to_string());
        let document: PunishmentsDocument = load(&self.store, PUNISHMENTS_KEY).await?;
        Ok(document
            .warnings
            .into_iter()
            .filter(|warning| warning.guild_id == guild_id && warning.user_id == user_id)
            .collect())
    }

    /// Temporary punishments of a member that have not expired yet
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn active_punishments_for(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> RepositoryResult<Vec<(PunishmentKind, PunishmentRecord)>> {
        let (guild_id, user_id) = (guild_id.to_string(), user_id.to_string());
        let document: PunishmentsDocument = load(&self.store, PUNISHMENTS_KEY).await?;

        let bans = document
            .temp_bans
            .into_iter()
            .map(|record| (PunishmentKind::TempBan, record));
        let mutes = document
            .mutes
            .into_iter()
            .map(|record| (PunishmentKind::Timeout, record));
        Ok(bans
            .chain(mutes)
            .filter(|(_, record)| {
                record.active && record.guild_id == guild_id && record.user_id == user_id
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{MockNotificationSink, NotificationSink};
    use crate::store::StoreConfig;
    use crate::sweep::{
        DueRecord, Registration, SweepConfig, SweepHandler, SweepResult, SweepScheduler,
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    fn repository() -> (tempfile::TempDir, FileStore, ModerationRepository) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(StoreConfig::new(dir.path()));
        (dir, store.clone(), ModerationRepository::new(store))
    }

    fn punishment(user_id: u64, minutes: i64) -> NewPunishment {
        NewPunishment {
            guild_id: 1,
            user_id,
            moderator_id: 99,
            reason: "spam".to_string(),
            duration: Duration::minutes(minutes),
            channel_id: Some(5),
        }
    }

    #[tokio::test]
    async fn test_warnings_are_filtered_by_member() {
        let (_dir, _store, moderation) = repository();
        let now = Utc::now();
        moderation.add_warning(1, 2, 99, "rude".into(), now).await.unwrap();
        moderation.add_warning(1, 3, 99, "loud".into(), now).await.unwrap();
        moderation.add_warning(1, 2, 99, "rude again".into(), now).await.unwrap();

        let warnings = moderation.warnings_for(1, 2).await.unwrap();
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[1].reason, "rude again");
        assert!(moderation.warnings_for(2, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_match_the_sweep_layout() {
        let (_dir, store, moderation) = repository();
        let now = Utc::now();
        let ban = moderation.add_temp_ban(punishment(2, 10), now).await.unwrap();
        moderation.add_timeout(punishment(2, 5), now).await.unwrap();

        let document = store.read(PUNISHMENTS_KEY).await.unwrap().unwrap();
        let stored = &document["temp_bans"][0];
        assert_eq!(stored["user_id"], "2");
        assert_eq!(stored["channel_id"], "5");
        assert_eq!(stored["active"], true);
        assert_eq!(ban.expires_at, now + Duration::minutes(10));
        assert_eq!(document["mutes"].as_array().unwrap().len(), 1);

        let active = moderation.active_punishments_for(1, 2).await.unwrap();
        let kinds: Vec<PunishmentKind> = active.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(kinds, vec![PunishmentKind::TempBan, PunishmentKind::Timeout]);
    }

    #[tokio::test]
    async fn test_revoke_removes_only_the_named_record() {
        let (_dir, store, moderation) = repository();
        let now = Utc::now();
        let ban = moderation.add_temp_ban(punishment(2, 10), now).await.unwrap();
        let kept = moderation.add_temp_ban(punishment(3, 10), now).await.unwrap();
        let mute = moderation.add_timeout(punishment(2, 10), now).await.unwrap();

        assert!(moderation.revoke(PunishmentKind::TempBan, &ban.id).await.unwrap());
        let active = moderation.active_punishments_for(1, 2).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1.id, mute.id);
        assert_eq!(moderation.active_punishments_for(1, 3).await.unwrap()[0].1, kept);

        // Ids are per collection
        assert!(!moderation.revoke(PunishmentKind::Timeout, &kept.id).await.unwrap());
        assert!(!moderation.revoke(PunishmentKind::TempBan, &ban.id).await.unwrap());

        store.clear_cache(None);
        let document = store.read(PUNISHMENTS_KEY).await.unwrap().unwrap();
        assert_eq!(document["temp_bans"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_duration_is_rejected() {
        let (_dir, store, moderation) = repository();
        let mut huge = punishment(2, 0);
        huge.duration = Duration::weeks(100_000_000);

        let result = moderation.add_temp_ban(huge, Utc::now()).await;
        assert!(matches!(result, Err(RepositoryError::DurationOutOfRange(_))));
        assert!(store.read(PUNISHMENTS_KEY).await.unwrap().is_none());
    }

    struct Accept;

    #[async_trait]
    impl SweepHandler for Accept {
        async fn fire(
            &self,
            _record: &DueRecord,
            _notifier: Arc<dyn NotificationSink>,
        ) -> SweepResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_swept_records_keep_completion_field() {
        let (_dir, store, moderation) = repository();
        let now = Utc::now();
        moderation.add_temp_ban(punishment(2, 1), now).await.unwrap();

        let scheduler = SweepScheduler::new(
            store.clone(),
            Arc::new(MockNotificationSink::new()),
            SweepConfig::default(),
        )
        .with_registration(
            Registration::new(PUNISHMENTS_KEY, "expires_at", Arc::new(Accept))
                .in_collection(PunishmentKind::TempBan.collection())
                .completed_field("unbanned_at"),
        );
        let report = scheduler.sweep_at(now + Duration::minutes(2)).await;
        assert_eq!(report.fired, 1);
        assert!(moderation.active_punishments_for(1, 2).await.unwrap().is_empty());

        // A later command write keeps the field the sweep added
        moderation.add_warning(1, 2, 99, "again".into(), now).await.unwrap();
        let document = store.read(PUNISHMENTS_KEY).await.unwrap().unwrap();
        assert!(document["temp_bans"][0]["unbanned_at"].is_string());
        assert_eq!(document["temp_bans"][0]["active"], false);
    }
}
