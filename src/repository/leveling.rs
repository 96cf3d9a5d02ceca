use super::{RepositoryResult, load, modify};
use crate::store::FileStore;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

pub const LEVELING_KEY: &str = "leveling";
/// Minimum gap between two XP-earning messages from one member
pub const XP_COOLDOWN_SECS: i64 = 60;
const XP_PER_MESSAGE: RangeInclusive<u64> = 15..=25;

/// XP needed to advance from `level` to `level + 1`
#[must_use]
pub const fn xp_for_next_level(level: u32) -> u64 {
    let n = level as u64;
    5 * n * n + 50 * n + 100
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelProfile {
    #[serde(default)]
    pub level: u32,
    /// XP earned toward the next level
    #[serde(default)]
    pub xp: u64,
    #[serde(default)]
    pub total_xp: u64,
    #[serde(default)]
    pub messages: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_award: Option<DateTime<Utc>>,
}

impl LevelProfile {
    fn gain(&mut self, amount: u64) -> bool {
        let start = self.level;
        // Counters come from hand-editable files and may already sit near the limit
        self.xp = self.xp.saturating_add(amount);
        self.total_xp = self.total_xp.saturating_add(amount);
        while self.xp >= xp_for_next_level(self.level) {
            self.xp -= xp_for_next_level(self.level);
            self.level = self.level.saturating_add(1);
        }
        self.level > start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpAward {
    pub gained: u64,
    pub level: u32,
    pub leveled_up: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LevelingDocument {
    #[serde(default)]
    members: BTreeMap<String, LevelProfile>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn member_key(guild_id: u64, user_id: u64) -> String {
    format!("{guild_id}:{user_id}")
}

/// Message XP in the `leveling` document, tracked per guild member
#[derive(Debug, Clone)]
pub struct LevelingRepository {
    store: FileStore,
}

impl LevelingRepository {
    #[must_use]
    pub const fn new(store: FileStore) -> Self {
        Self { store }
    }

    /// Award a random amount of XP for a message. `None` while the member is
    /// on cooldown.
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn award_message_xp(
        &self,
        guild_id: u64,
        user_id: u64,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<XpAward>> {
        let amount = rand::rng().random_range(XP_PER_MESSAGE);
        self.award_xp(guild_id, user_id, amount, now).await
    }

    /// Award a fixed amount of XP, honoring the message cooldown
    ///
    /// # Errors
    /// Store or shape errors.
    pub async fn award_xp(
        &self,
        guild_id: u64,
        user_id: u64,
        amount: u64,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Option<XpAward>> {
        let cooldown = Duration::seconds(XP_COOLDOWN_SECS);
        modify(&self.store, LEVELING_KEY, |document: &mut LevelingDocument| {
            let profile = document
                .members
                .entry(member_key(guild_id, user_id))
                .or_default();
            if profile.last_award.is_some_and(|last| now - last < cooldown) {
                return Ok(None);
            }

            let leveled_up = profile.gain(amount);
            profile.messages += 1;
            profile.last_award = Some(now);
            Ok(Some(XpAward {
                gained: amount,
                level: profile.level,
                leveled_up,
            }))
        })
        .await
    }

    /// # Errors
    /// Store or shape errors.
    pub async fn profile(&self, guild_id: u64, user_id: u64) -> RepositoryResult<LevelProfile> {
        let document: LevelingDocument = load(&self.store, LEVELING_KEY).await?;
        Ok(document
            .members
            .get(&member_key(guild_id, user_id))
            .cloned()
            .unwrap_or_default())
    }
}
