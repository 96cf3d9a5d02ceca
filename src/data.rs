use std::{ops::Deref, sync::Arc};

use crate::config::BotConfig;
use crate::repository::{
    EconomyRepository, LevelingRepository, ModerationRepository, ReminderRepository,
};
use crate::store::FileStore;
use crate::sweep::SweepHandle;
use poise::serenity_prelude as serenity;
use serenity::prelude::TypeMapKey;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared bot state
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Implement TypeMapKey for Data to allow storing it in Serenity's data map
impl TypeMapKey for Data {
    type Value = Data;
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Data {
    /// Create a new Data instance over the configured store
    #[must_use]
    pub fn new(config: BotConfig) -> Self {
        let store = FileStore::new(config.store_config());
        Self(Arc::new(DataInner::new(config, store)))
    }

    /// Hand over the running sweep task. A task already installed is
    /// replaced and stopped.
    pub async fn set_sweeper(&self, handle: SweepHandle) {
        let previous = self.sweeper.lock().await.replace(handle);
        if let Some(previous) = previous {
            warn!("Replacing a running sweep task");
            previous.stop().await;
        }
    }

    /// Ask the sweep task for an immediate sweep. Returns `false` if no task
    /// is running.
    pub async fn request_sweep(&self) -> bool {
        match self.sweeper.lock().await.as_ref() {
            Some(handle) => handle.sweep_now().await,
            None => false,
        }
    }

    /// Stop the sweep task, waiting for an in-flight sweep
    pub async fn stop_sweeper(&self) {
        let handle = self.sweeper.lock().await.take();
        if let Some(handle) = handle {
            info!("Stopping sweep task");
            handle.stop().await;
        }
    }
}

pub struct DataInner {
    pub config: BotConfig,
    pub store: FileStore,
    pub economy: EconomyRepository,
    pub moderation: ModerationRepository,
    pub leveling: LevelingRepository,
    pub reminders: ReminderRepository,
    // Handle of the sweep task, once the client is ready
    pub sweeper: Mutex<Option<SweepHandle>>,
}

impl DataInner {
    #[must_use]
    pub fn new(config: BotConfig, store: FileStore) -> Self {
        Self {
            economy: EconomyRepository::new(store.clone()),
            moderation: ModerationRepository::new(store.clone()),
            leveling: LevelingRepository::new(store.clone()),
            reminders: ReminderRepository::new(store.clone()),
            store,
            config,
            sweeper: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MockNotificationSink;
    use crate::sweep::{SweepConfig, SweepScheduler};
    use std::time::Duration;

    fn test_data(dir: &tempfile::TempDir) -> Data {
        Data::new(BotConfig {
            data_dir: dir.path().to_path_buf(),
            ..BotConfig::default()
        })
    }

    #[tokio::test]
    async fn test_repositories_share_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_data(&dir);

        data.economy.deposit(1, 10).await.unwrap();
        assert!(data.store.is_cached("economy"));
        assert!(dir.path().join("economy.json").exists());
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let data = test_data(&dir);
        assert!(!data.request_sweep().await);

        let scheduler = SweepScheduler::new(
            data.store.clone(),
            Arc::new(MockNotificationSink::new()),
            SweepConfig {
                interval: Duration::from_secs(3600),
                retention: None,
            },
        );
        data.set_sweeper(scheduler.start()).await;
        assert!(data.request_sweep().await);

        data.stop_sweeper().await;
        assert!(data.sweeper.lock().await.is_none());
        assert!(!data.request_sweep().await);
    }
}
