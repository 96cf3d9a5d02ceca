//! Sweep handlers
//!
//! A handler is the side effect of a record firing: lift a ban, end a
//! timeout, deliver a reminder. Handlers must tolerate the external state
//! having already changed.

use crate::SWEEP_TARGET;
use crate::guild::GuildModeration;
use crate::notify::{DeliveryTarget, NotificationSink};
use crate::sweep::record::DueRecord;
use crate::sweep::{SweepError, SweepResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Completion field used when a registration does not name its own
pub const DEFAULT_COMPLETED_FIELD: &str = "completed_at";

/// Trait for firing due records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SweepHandler: Send + Sync {
    /// Apply the record's side effect
    async fn fire(
        &self,
        record: &DueRecord,
        notifier: Arc<dyn NotificationSink>,
    ) -> SweepResult<()>;
}

/// Ties a handler to the records of one document collection
#[derive(Clone)]
pub struct Registration {
    pub document_key: String,
    /// Field of the document holding the records; `None` for the root
    pub collection: Option<String>,
    pub due_field: String,
    pub completed_field: String,
    pub handler: Arc<dyn SweepHandler>,
}

impl Registration {
    pub fn new(
        document_key: impl Into<String>,
        due_field: impl Into<String>,
        handler: Arc<dyn SweepHandler>,
    ) -> Self {
        Self {
            document_key: document_key.into(),
            collection: None,
            due_field: due_field.into(),
            completed_field: DEFAULT_COMPLETED_FIELD.to_string(),
            handler,
        }
    }

    #[must_use]
    pub fn in_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    #[must_use]
    pub fn completed_field(mut self, field: impl Into<String>) -> Self {
        self.completed_field = field.into();
        self
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("document_key", &self.document_key)
            .field("collection", &self.collection)
            .field("due_field", &self.due_field)
            .field("completed_field", &self.completed_field)
            .finish_non_exhaustive()
    }
}

fn delivery_target(record: &DueRecord, user_id: u64) -> DeliveryTarget {
    // A malformed channel only loses the fallback route
    let channel_id = record.optional_snowflake("channel_id").ok().flatten();
    DeliveryTarget::user(user_id).with_fallback(channel_id)
}

/// Lifts expired temporary bans
pub struct UnbanHandler {
    gateway: Arc<dyn GuildModeration>,
}

impl UnbanHandler {
    pub fn new(gateway: Arc<dyn GuildModeration>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SweepHandler for UnbanHandler {
    async fn fire(
        &self,
        record: &DueRecord,
        notifier: Arc<dyn NotificationSink>,
    ) -> SweepResult<()> {
        let guild_id = record.snowflake("guild_id")?;
        let user_id = record.snowflake("user_id")?;

        let outcome = self.gateway.unban(guild_id, user_id).await?;
        info!(
            target: SWEEP_TARGET,
            guild_id,
            user_id,
            outcome = %outcome,
            "Temporary ban expired"
        );

        let message = "Your temporary ban has expired. You are welcome to rejoin the server.";
        if !notifier.deliver(&delivery_target(record, user_id), message).await {
            // Unbanned users usually share no server with the bot any more
            debug!(target: SWEEP_TARGET, user_id, "Unban notice not delivered");
        }
        Ok(())
    }
}

/// Lifts expired timeouts
pub struct UnmuteHandler {
    gateway: Arc<dyn GuildModeration>,
}

impl UnmuteHandler {
    pub fn new(gateway: Arc<dyn GuildModeration>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl SweepHandler for UnmuteHandler {
    async fn fire(
        &self,
        record: &DueRecord,
        notifier: Arc<dyn NotificationSink>,
    ) -> SweepResult<()> {
        let guild_id = record.snowflake("guild_id")?;
        let user_id = record.snowflake("user_id")?;

        let outcome = self.gateway.remove_timeout(guild_id, user_id).await?;
        info!(
            target: SWEEP_TARGET,
            guild_id,
            user_id,
            outcome = %outcome,
            "Timeout expired"
        );

        let message = "Your timeout has ended. Please keep the server rules in mind.";
        if !notifier.deliver(&delivery_target(record, user_id), message).await {
            debug!(target: SWEEP_TARGET, user_id, "Timeout notice not delivered");
        }
        Ok(())
    }
}

/// Delivers due reminders
#[derive(Default)]
pub struct ReminderHandler;

#[async_trait]
impl SweepHandler for ReminderHandler {
    async fn fire(
        &self,
        record: &DueRecord,
        notifier: Arc<dyn NotificationSink>,
    ) -> SweepResult<()> {
        let user_id = record.snowflake("user_id")?;
        let text = record.str_field("message").unwrap_or("(no message)");
        let message = format!("\u{23f0} Reminder: {text}");

        if notifier.deliver(&delivery_target(record, user_id), &message).await {
            Ok(())
        } else {
            Err(SweepError::Undelivered(user_id))
        }
    }
}
