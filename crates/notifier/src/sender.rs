//! Per-notification delivery across all requested channels.
//!
//! Every channel is attempted independently under the retry policy. The
//! notification ends up `sent` only if every channel succeeded, otherwise
//! `failed`. The terminal status is always written, also when delivery was
//! cut short by cancellation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::store::{Store, status_key};
use herald_common::types::{ChannelKind, DelayedNotification, NotificationStatus};

use crate::channels::Transport;
use crate::retry::{RetryError, RetryPolicy, retry};

/// One channel that could not be delivered.
#[derive(Debug)]
pub struct ChannelFailure {
    pub channel: ChannelKind,
    pub error: RetryError<anyhow::Error>,
}

impl fmt::Display for ChannelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.channel, self.error)
    }
}

/// Everything that went wrong while sending one notification.
#[derive(Debug)]
pub struct SendError {
    pub notification_id: String,
    pub channel_failures: Vec<ChannelFailure>,
    pub status_error: Option<AppError>,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification {}", self.notification_id)?;
        let mut sep = ": ";
        for failure in &self.channel_failures {
            write!(f, "{}{}", sep, failure)?;
            sep = "; ";
        }
        if let Some(e) = &self.status_error {
            write!(f, "{}status write failed: {}", sep, e)?;
        }
        Ok(())
    }
}

impl std::error::Error for SendError {}

pub struct NotificationSender {
    store: Arc<dyn Store>,
    email: Arc<dyn Transport>,
    telegram: Arc<dyn Transport>,
    policy: RetryPolicy,
    status_retention: Option<Duration>,
}

impl NotificationSender {
    pub fn new(
        store: Arc<dyn Store>,
        email: Arc<dyn Transport>,
        telegram: Arc<dyn Transport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            email,
            telegram,
            policy,
            status_retention: None,
        }
    }

    /// Expire terminal status records after `retention`.
    pub fn with_status_retention(mut self, retention: Duration) -> Self {
        self.status_retention = Some(retention);
        self
    }

    /// Deliver `notification` to each of its channels and record the outcome.
    ///
    /// A notification whose status is already terminal is a duplicate
    /// delivery from the queue and is skipped.
    pub async fn send(
        &self,
        notification: &DelayedNotification,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        let id = notification.id.as_str();

        if let Some(status) = self.finished_status(id).await {
            tracing::info!(
                notification_id = %id,
                status = %status,
                "Notification already finished, skipping duplicate"
            );
            return Ok(());
        }

        let deliveries = notification
            .channels
            .targets()
            .into_iter()
            .map(|(channel, destination)| {
                let transport = self.transport(channel);
                let body = notification.body.as_str();
                async move {
                    retry(&self.policy, cancel, || transport.send(destination, body))
                        .await
                        .map_err(|error| ChannelFailure { channel, error })
                }
            });

        let channel_failures: Vec<ChannelFailure> = join_all(deliveries)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        for failure in &channel_failures {
            tracing::warn!(
                notification_id = %id,
                channel = %failure.channel,
                attempts = failure.error.attempts(),
                error = %failure.error,
                "Channel delivery failed"
            );
        }

        let status = if channel_failures.is_empty() {
            NotificationStatus::Sent
        } else {
            NotificationStatus::Failed
        };

        let status_error = self
            .store
            .add(&status_key(id), status.as_str(), self.status_retention)
            .await
            .err();

        match &status_error {
            None => tracing::info!(notification_id = %id, status = %status, "Notification finished"),
            Some(e) => tracing::error!(
                notification_id = %id,
                status = %status,
                error = %e,
                "Failed to record notification status"
            ),
        }

        if channel_failures.is_empty() && status_error.is_none() {
            Ok(())
        } else {
            Err(SendError {
                notification_id: notification.id.clone(),
                channel_failures,
                status_error,
            })
        }
    }

    fn transport(&self, channel: ChannelKind) -> &dyn Transport {
        match channel {
            ChannelKind::Email => self.email.as_ref(),
            ChannelKind::Telegram => self.telegram.as_ref(),
        }
    }

    async fn finished_status(&self, id: &str) -> Option<NotificationStatus> {
        let raw = self.store.get(&status_key(id)).await.ok()?;
        raw.parse::<NotificationStatus>()
            .ok()
            .filter(|status| status.is_terminal())
    }
}
