//! Notification scheduling: accepts new notifications, answers status
//! lookups and cancels notifications that have not been dispatched yet.
//!
//! Scheduling writes three records: the serialized payload, the initial
//! `scheduled` status, and the due-index entry scored by due time in Unix
//! milliseconds. The writes are independent keyed commands, so any number of
//! callers may schedule concurrently without coordination.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::store::{Store, payload_key, status_key};
use herald_common::types::{Channels, DelayedNotification, NotificationStatus};

/// Creates, inspects and cancels delayed notifications.
pub struct NotificationScheduler {
    store: Arc<dyn Store>,
    delayed_set: String,
}

impl NotificationScheduler {
    pub fn new(store: Arc<dyn Store>, delayed_set: impl Into<String>) -> Self {
        Self {
            store,
            delayed_set: delayed_set.into(),
        }
    }

    /// Schedule `body` for delivery to `channels` once `delay` has elapsed.
    ///
    /// Returns the stored notification, including its freshly generated id.
    /// If a later write fails, the records already written are deleted on a
    /// best-effort basis before the error is returned.
    pub async fn schedule(
        &self,
        body: impl Into<String>,
        delay: Duration,
        channels: Channels,
    ) -> Result<DelayedNotification, AppError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|_| AppError::Validation("delay is out of range".to_string()))?;

        let notification = DelayedNotification {
            id: Uuid::new_v4().to_string(),
            body: body.into(),
            due_at: Utc::now() + delay,
            channels,
        };
        let payload = serde_json::to_string(&notification)?;

        let payload_key = payload_key(&notification.id);
        let status_key = status_key(&notification.id);

        self.store.add(&payload_key, &payload, None).await?;

        if let Err(e) = self
            .store
            .add(&status_key, NotificationStatus::Scheduled.as_str(), None)
            .await
        {
            self.compensate(&notification.id, &[payload_key.as_str()])
                .await;
            return Err(e);
        }

        let score = notification.due_at.timestamp_millis() as f64;
        if let Err(e) = self
            .store
            .sorted_set_add(&self.delayed_set, &notification.id, score)
            .await
        {
            self.compensate(&notification.id, &[payload_key.as_str(), status_key.as_str()])
                .await;
            return Err(e);
        }

        tracing::info!(
            notification_id = %notification.id,
            due_at = %notification.due_at,
            channels = notification.channels.targets().len(),
            "Notification scheduled"
        );

        Ok(notification)
    }

    /// Current status of a notification.
    pub async fn get_status(&self, id: &str) -> Result<NotificationStatus, AppError> {
        let raw = self.store.get(&status_key(id)).await.map_err(|e| match e {
            AppError::NotFound(_) => AppError::NotFound(format!("Notification {} not found", id)),
            other => other,
        })?;

        raw.parse().map_err(AppError::Internal)
    }

    /// Cancel a notification that is still waiting for its due time.
    ///
    /// Fails with [`AppError::Conflict`] once the poller has picked it up, in
    /// which case nothing is modified.
    pub async fn remove(&self, id: &str) -> Result<(), AppError> {
        let status = self.get_status(id).await?;
        if status != NotificationStatus::Scheduled {
            return Err(AppError::Conflict(format!(
                "Notification {} already processed (status: {})",
                id, status
            )));
        }

        self.store.remove(&payload_key(id)).await?;
        self.store.remove(&status_key(id)).await?;
        self.store.sorted_set_remove(&self.delayed_set, id).await?;

        tracing::info!(notification_id = %id, "Notification removed");
        Ok(())
    }

    async fn compensate(&self, id: &str, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.store.remove(key).await {
                tracing::error!(
                    notification_id = %id,
                    key = %key,
                    error = %e,
                    "Failed to roll back partially scheduled notification"
                );
            }
        }
    }
}
