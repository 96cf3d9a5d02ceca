//! Notification delivery
//!
//! A `NotificationSink` tells a user that something happened (a ban expired,
//! a reminder is due). Delivery is best effort: direct message first, then one
//! attempt in a channel, and the result is reported as a plain `bool`.

use crate::SWEEP_TARGET;
use async_trait::async_trait;
use poise::serenity_prelude::{ChannelId, CreateMessage, Http, UserId};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Who to notify, and where to fall back to if direct delivery fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub user_id: u64,
    pub fallback_channel_id: Option<u64>,
}

impl DeliveryTarget {
    #[must_use]
    pub const fn user(user_id: u64) -> Self {
        Self {
            user_id,
            fallback_channel_id: None,
        }
    }

    #[must_use]
    pub const fn with_fallback(mut self, channel_id: Option<u64>) -> Self {
        self.fallback_channel_id = channel_id;
        self
    }
}

/// Errors a transport can report for a single send
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<poise::serenity_prelude::Error>),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

impl From<poise::serenity_prelude::Error> for DeliveryError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

/// Delivers human-readable notifications. Never fails; `false` means
/// "logged, not delivered".
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, target: &DeliveryTarget, message: &str) -> bool;
}

/// The raw sends a `Notifier` is built on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send a direct message to a user
    async fn send_direct(&self, user_id: u64, message: &str) -> Result<(), DeliveryError>;

    /// Post a message in a channel
    async fn send_to_channel(&self, channel_id: u64, message: &str) -> Result<(), DeliveryError>;
}

/// `NotificationSink` with the direct-then-channel fallback policy
pub struct Notifier<T> {
    transport: T,
    default_channel_id: Option<u64>,
}

impl<T: MessageTransport> Notifier<T> {
    /// `default_channel_id` is used when a target has no fallback of its own
    pub const fn new(transport: T, default_channel_id: Option<u64>) -> Self {
        Self {
            transport,
            default_channel_id,
        }
    }
}

#[async_trait]
impl<T: MessageTransport> NotificationSink for Notifier<T> {
    async fn deliver(&self, target: &DeliveryTarget, message: &str) -> bool {
        let user_id = target.user_id;
        let direct_error = match self.transport.send_direct(user_id, message).await {
            Ok(()) => {
                debug!(target: SWEEP_TARGET, user_id, "Notification delivered by DM");
                return true;
            }
            Err(e) => e,
        };

        let Some(channel_id) = target.fallback_channel_id.or(self.default_channel_id) else {
            warn!(
                target: SWEEP_TARGET,
                user_id,
                error = %direct_error,
                "DM failed and no fallback channel is configured"
            );
            return false;
        };

        let mention = format!("<@{user_id}> {message}");
        match self.transport.send_to_channel(channel_id, &mention).await {
            Ok(()) => {
                debug!(
                    target: SWEEP_TARGET,
                    user_id,
                    channel_id,
                    dm_error = %direct_error,
                    "Notification delivered in fallback channel"
                );
                true
            }
            Err(e) => {
                warn!(
                    target: SWEEP_TARGET,
                    user_id,
                    channel_id,
                    dm_error = %direct_error,
                    error = %e,
                    "Notification could not be delivered"
                );
                false
            }
        }
    }
}

/// Transport over the Discord HTTP client
pub struct DiscordTransport {
    http: Arc<Http>,
}

impl DiscordTransport {
    #[must_use]
    pub const fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn non_zero(id: u64, what: &str) -> Result<u64, DeliveryError> {
    // Snowflake constructors panic on zero
    if id == 0 {
        Err(DeliveryError::InvalidTarget(format!("{what} id 0")))
    } else {
        Ok(id)
    }
}

#[async_trait]
impl MessageTransport for DiscordTransport {
    async fn send_direct(&self, user_id: u64, message: &str) -> Result<(), DeliveryError> {
        let user_id = UserId::new(non_zero(user_id, "user")?);
        user_id
            .direct_message(&*self.http, CreateMessage::new().content(message))
            .await?;
        Ok(())
    }

    async fn send_to_channel(&self, channel_id: u64, message: &str) -> Result<(), DeliveryError> {
        let channel_id = ChannelId::new(non_zero(channel_id, "channel")?);
        channel_id.say(&*self.http, message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn dm_closed() -> DeliveryError {
        DeliveryError::InvalidTarget("DMs closed".to_string())
    }

    #[tokio::test]
    async fn test_direct_delivery_skips_fallback() {
        let mut transport = MockMessageTransport::new();
        transport
            .expect_send_direct()
            .with(eq(42), eq("hello"))
            .times(1)
            .returning(|_, _| Ok(()));
        transport.expect_send_to_channel().never();

        let notifier = Notifier::new(transport, Some(7));
        assert!(notifier.deliver(&DeliveryTarget::user(42), "hello").await);
    }

    #[tokio::test]
    async fn test_falls_back_to_target_channel_once() {
        let mut transport = MockMessageTransport::new();
        transport
            .expect_send_direct()
            .times(1)
            .returning(|_, _| Err(dm_closed()));
        transport
            .expect_send_to_channel()
            .with(eq(99), eq("<@42> hello"))
            .times(1)
            .returning(|_, _| Ok(()));

        let notifier = Notifier::new(transport, Some(7));
        let target = DeliveryTarget::user(42).with_fallback(Some(99));
        assert!(notifier.deliver(&target, "hello").await);
    }

    #[tokio::test]
    async fn test_uses_default_channel() {
        let mut transport = MockMessageTransport::new();
        transport
            .expect_send_direct()
            .returning(|_, _| Err(dm_closed()));
        transport
            .expect_send_to_channel()
            .with(eq(7), eq("<@42> hello"))
            .times(1)
            .returning(|_, _| Ok(()));

        let notifier = Notifier::new(transport, Some(7));
        assert!(notifier.deliver(&DeliveryTarget::user(42), "hello").await);
    }

    #[tokio::test]
    async fn test_both_paths_failing_returns_false() {
        let mut transport = MockMessageTransport::new();
        transport
            .expect_send_direct()
            .times(1)
            .returning(|_, _| Err(dm_closed()));
        transport
            .expect_send_to_channel()
            .times(1)
            .returning(|_, _| Err(DeliveryError::InvalidTarget("missing access".to_string())));

        let notifier = Notifier::new(transport, None);
        let target = DeliveryTarget::user(42).with_fallback(Some(99));
        assert!(!notifier.deliver(&target, "hello").await);
    }

    #[tokio::test]
    async fn test_no_channel_returns_false() {
        let mut transport = MockMessageTransport::new();
        transport
            .expect_send_direct()
            .returning(|_, _| Err(dm_closed()));
        transport.expect_send_to_channel().never();

        let notifier = Notifier::new(transport, None);
        assert!(!notifier.deliver(&DeliveryTarget::user(42), "hello").await);
    }
}
