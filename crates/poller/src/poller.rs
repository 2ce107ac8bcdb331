use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::queue::Queue;
use herald_common::store::{Store, payload_key, publish_attempts_key, status_key};
use herald_common::types::NotificationStatus;

/// Tuning knobs for [`DuePoller`].
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Sorted set holding pending notification ids scored by due time.
    pub delayed_set: String,
    pub tick: Duration,
    /// Maximum due entries dispatched per tick.
    pub batch_size: usize,
    /// How far a failed publish is pushed back before it is tried again.
    pub publish_retry_delay: Duration,
    /// Failed publishes tolerated before the notification is marked failed.
    pub max_publish_attempts: u32,
    /// TTL applied to a terminal `failed` status.
    pub status_retention: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            delayed_set: "notifications:delayed".to_string(),
            tick: Duration::from_secs(1),
            batch_size: 10,
            publish_retry_delay: Duration::from_secs(5),
            max_publish_attempts: 5,
            status_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl PollerConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            delayed_set: config.delayed_set_name.clone(),
            tick: config.poller_tick(),
            batch_size: config.poller_batch_size,
            publish_retry_delay: config.publish_retry_delay(),
            max_publish_attempts: config.poller_max_publish_attempts,
            status_retention: config.status_retention(),
        }
    }
}

/// What happened to a single due entry during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Published to the queue and retired from the index.
    Dispatched,
    /// Publish failed; re-scored for a later attempt.
    Deferred,
    /// Publish budget exhausted; marked failed and retired.
    Failed,
    /// Payload no longer exists; index entry retired.
    Orphaned,
    /// An earlier tick published it but could not retire it; retired now
    /// without publishing again.
    AlreadyDispatched,
    /// Transient store failure; left untouched for the next tick.
    Skipped,
}

/// Per-scan tally, mostly for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub due: usize,
    pub dispatched: usize,
    pub deferred: usize,
    pub failed: usize,
    pub orphaned: usize,
    pub already_dispatched: usize,
    pub skipped: usize,
}

impl ScanReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Dispatched => self.dispatched += 1,
            DispatchOutcome::Deferred => self.deferred += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Orphaned => self.orphaned += 1,
            DispatchOutcome::AlreadyDispatched => self.already_dispatched += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Poller that moves due notifications from the delay index onto the queue.
///
/// A single instance is assumed to be active; there is no lease between
/// pollers.
pub struct DuePoller {
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    config: PollerConfig,
}

impl DuePoller {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn Queue>, config: PollerConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Start the tick loop. Returns once `cancel` fires and the in-flight
    /// scan (if any) has finished.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        // A slow scan delays the next tick instead of queueing a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            delayed_set = %self.config.delayed_set,
            tick_ms = self.config.tick.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Due poller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.scan(Utc::now()).await;
                    if report.due > 0 {
                        tracing::debug!(?report, "Scan finished");
                    }
                }
            }
        }

        tracing::info!("Due poller stopped");
    }

    /// Dispatch up to one batch of entries due at or before `now`.
    pub async fn scan(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::default();

        let ids = match self
            .store
            .sorted_set_range_by_score(
                &self.config.delayed_set,
                f64::NEG_INFINITY,
                now.timestamp_millis() as f64,
                0,
                self.config.batch_size,
            )
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query due notifications");
                return report;
            }
        };

        report.due = ids.len();
        for id in &ids {
            let outcome = self.dispatch(id, now).await;
            report.record(outcome);
        }

        report
    }

    /// Hand one due notification to the queue.
    async fn dispatch(&self, id: &str, now: DateTime<Utc>) -> DispatchOutcome {
        let payload = match self.store.get(&payload_key(id)).await {
            Ok(payload) => payload,
            Err(AppError::NotFound(_)) => {
                // Removed or already dispatched; the index entry points at nothing.
                tracing::warn!(notification_id = %id, "Due entry has no payload, retiring it");
                self.retire(id).await;
                return DispatchOutcome::Orphaned;
            }
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Failed to fetch payload");
                return DispatchOutcome::Skipped;
            }
        };

        match self.already_dispatched(id).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!(notification_id = %id, "Due entry was already dispatched, retiring it");
                self.retire(id).await;
                self.remove_logged(id, &payload_key(id)).await;
                self.remove_logged(id, &publish_attempts_key(id)).await;
                return DispatchOutcome::AlreadyDispatched;
            }
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Failed to fetch status");
                return DispatchOutcome::Skipped;
            }
        }

        // Written before publishing so a fast consumer's terminal status is
        // never overwritten by this one.
        if let Err(e) = self
            .store
            .add(&status_key(id), NotificationStatus::Sending.as_str(), None)
            .await
        {
            tracing::warn!(notification_id = %id, error = %e, "Failed to mark notification sending");
            return DispatchOutcome::Skipped;
        }

        if let Err(e) = self.queue.publish(&payload).await {
            return self.handle_publish_failure(id, now, e).await;
        }

        self.retire(id).await;
        self.remove_logged(id, &payload_key(id)).await;
        self.remove_logged(id, &publish_attempts_key(id)).await;

        tracing::info!(notification_id = %id, "Notification dispatched");
        DispatchOutcome::Dispatched
    }

    /// Whether an earlier tick published `id` and then failed to retire it.
    ///
    /// A terminal status always means so. `sending` does too, unless a
    /// publish-attempts record shows the last publish was refused.
    async fn already_dispatched(&self, id: &str) -> Result<bool, AppError> {
        let status = match self.store.get(&status_key(id)).await {
            Ok(raw) => raw.parse::<NotificationStatus>().ok(),
            Err(AppError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        match status {
            Some(status) if status.is_terminal() => Ok(true),
            Some(NotificationStatus::Sending) => {
                match self.store.get(&publish_attempts_key(id)).await {
                    Ok(_) => Ok(false),
                    Err(AppError::NotFound(_)) => Ok(true),
                    Err(e) => Err(e),
                }
            }
            _ => Ok(false),
        }
    }

    async fn handle_publish_failure(
        &self,
        id: &str,
        now: DateTime<Utc>,
        error: AppError,
    ) -> DispatchOutcome {
        let attempts_key = publish_attempts_key(id);
        let previous = match self.store.get(&attempts_key).await {
            Ok(raw) => raw.parse::<u32>().unwrap_or(0),
            Err(_) => 0,
        };
        let attempts = previous + 1;

        if attempts >= self.config.max_publish_attempts {
            tracing::error!(
                notification_id = %id,
                attempts,
                error = %error,
                "Publish attempts exhausted, marking notification failed"
            );
            if let Err(e) = self
                .store
                .add(
                    &status_key(id),
                    NotificationStatus::Failed.as_str(),
                    Some(self.config.status_retention),
                )
                .await
            {
                // Leave the entry indexed so the next tick retries the write.
                tracing::error!(notification_id = %id, error = %e, "Failed to record failed status");
                return DispatchOutcome::Skipped;
            }
            self.retire(id).await;
            self.remove_logged(id, &payload_key(id)).await;
            self.remove_logged(id, &attempts_key).await;
            return DispatchOutcome::Failed;
        }

        tracing::warn!(
            notification_id = %id,
            attempts,
            max_attempts = self.config.max_publish_attempts,
            error = %error,
            "Publish failed, deferring notification"
        );

        if let Err(e) = self
            .store
            .add(&attempts_key, &attempts.to_string(), None)
            .await
        {
            tracing::error!(notification_id = %id, error = %e, "Failed to record publish attempt");
        }

        let retry_at = now
            + chrono::Duration::from_std(self.config.publish_retry_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(5));
        if let Err(e) = self
            .store
            .sorted_set_add(
                &self.config.delayed_set,
                id,
                retry_at.timestamp_millis() as f64,
            )
            .await
        {
            // Still indexed under its old score, so it is retried next tick anyway.
            tracing::error!(notification_id = %id, error = %e, "Failed to defer notification");
        }

        DispatchOutcome::Deferred
    }

    async fn retire(&self, id: &str) {
        if let Err(e) = self
            .store
            .sorted_set_remove(&self.config.delayed_set, id)
            .await
        {
            tracing::error!(notification_id = %id, error = %e, "Failed to remove due entry");
        }
    }

    async fn remove_logged(&self, id: &str, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            tracing::error!(notification_id = %id, key = %key, error = %e, "Failed to remove key");
        }
    }
}
