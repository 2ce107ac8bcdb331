//! Worker pool draining queued notifications into the [`NotificationSender`].

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use herald_common::types::DelayedNotification;

use crate::sender::NotificationSender;

/// What a worker did with one queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Ignored,
    Malformed,
    Delivered,
    Failed,
}

pub struct ConsumerPool {
    sender: Arc<NotificationSender>,
    workers: usize,
}

impl ConsumerPool {
    pub fn new(sender: Arc<NotificationSender>, workers: usize) -> Self {
        Self {
            sender,
            workers: workers.max(1),
        }
    }

    /// Run the workers until `cancel` fires or `messages` is closed and drained.
    ///
    /// Returns once every worker has finished its in-flight message.
    pub async fn run(&self, messages: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        let messages = Arc::new(Mutex::new(messages));
        let mut workers = JoinSet::new();

        for worker in 0..self.workers {
            let sender = self.sender.clone();
            let messages = messages.clone();
            let cancel = cancel.clone();
            workers.spawn(async move { work(worker, sender, messages, cancel).await });
        }
        tracing::info!(workers = self.workers, "Consumer pool started");

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Consumer worker panicked");
            }
        }
        tracing::info!("Consumer pool stopped");
    }
}

async fn work(
    worker: usize,
    sender: Arc<NotificationSender>,
    messages: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            message = async { messages.lock().await.recv().await } => message,
        };
        let Some(message) = message else {
            break;
        };
        handle_message(&sender, &message, &cancel).await;
    }
    tracing::debug!(worker, "Consumer worker exiting");
}

/// Decode one queue message and hand it to the sender.
pub async fn handle_message(
    sender: &NotificationSender,
    message: &[u8],
    cancel: &CancellationToken,
) -> MessageOutcome {
    if message.is_empty() {
        return MessageOutcome::Ignored;
    }

    let notification: DelayedNotification = match serde_json::from_slice(message) {
        Ok(notification) => notification,
        Err(e) => {
            tracing::warn!(
                error = %e,
                bytes = message.len(),
                "Dropping malformed queue message"
            );
            return MessageOutcome::Malformed;
        }
    };

    match sender.send(&notification, cancel).await {
        Ok(()) => MessageOutcome::Delivered,
        Err(e) => {
            tracing::error!(error = %e, "Notification delivery failed");
            MessageOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use herald_common::memory::MemoryStore;
    use herald_common::store::{Store, status_key};
    use herald_common::types::Channels;

    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testing::ScriptedTransport;

    fn message(id: &str, channels: Channels) -> Vec<u8> {
        serde_json::to_vec(&DelayedNotification {
            id: id.to_string(),
            body: format!("body of {}", id),
            due_at: Utc::now(),
            channels,
        })
        .unwrap()
    }

    fn sender(store: Arc<MemoryStore>, email: Arc<ScriptedTransport>) -> Arc<NotificationSender> {
        Arc::new(NotificationSender::new(
            store,
            email,
            Arc::new(ScriptedTransport::ok()),
            RetryPolicy::new(3, Duration::from_secs(60), 2.0),
        ))
    }

    #[tokio::test]
    async fn test_handle_message_outcomes() {
        let store = Arc::new(MemoryStore::new());
        let email = Arc::new(ScriptedTransport::ok());
        let sender = sender(store.clone(), email.clone());
        let cancel = CancellationToken::new();

        assert_eq!(
            handle_message(&sender, b"", &cancel).await,
            MessageOutcome::Ignored
        );
        assert_eq!(
            handle_message(&sender, b"{not json", &cancel).await,
            MessageOutcome::Malformed
        );
        assert_eq!(
            handle_message(&sender, &message("a", Channels::email("a@b.com")), &cancel).await,
            MessageOutcome::Delivered
        );
        assert_eq!(email.call_count(), 1);
        // Only the delivered notification left a status behind.
        assert_eq!(store.stats().adds, 1);
    }

    #[tokio::test]
    async fn test_pool_drains_until_channel_closes() {
        let store = Arc::new(MemoryStore::new());
        let email = Arc::new(ScriptedTransport::ok());
        let pool = ConsumerPool::new(sender(store.clone(), email.clone()), 3);

        let (tx, rx) = mpsc::channel(10);
        for i in 0..5 {
            tx.send(message(&format!("n-{}", i), Channels::email("a@b.com")))
                .await
                .unwrap();
        }
        tx.send(b"garbage".to_vec()).await.unwrap();
        drop(tx);

        pool.run(rx, CancellationToken::new()).await;

        assert_eq!(email.call_count(), 5);
        for i in 0..5 {
            assert_eq!(
                store.get(&status_key(&format!("n-{}", i))).await.unwrap(),
                "sent"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_status() {
        let store = Arc::new(MemoryStore::new());
        let email = Arc::new(ScriptedTransport::broken());
        let pool = ConsumerPool::new(sender(store.clone(), email.clone()), 2);

        let (tx, rx) = mpsc::channel(10);
        tx.send(message("slow", Channels::email("a@b.com")))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        // The sender is mid-backoff when shutdown starts; the pool must not
        // return before the failure is recorded.
        pool.run(rx, cancel).await;

        assert_eq!(email.call_count(), 1);
        assert_eq!(store.get(&status_key("slow")).await.unwrap(), "failed");
        drop(tx);
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_workers() {
        let store = Arc::new(MemoryStore::new());
        let pool = ConsumerPool::new(sender(store, Arc::new(ScriptedTransport::ok())), 4);
        let (_tx, rx) = mpsc::channel::<Vec<u8>>(1);

        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), pool.run(rx, cancel))
            .await
            .expect("pool should stop once cancelled");
    }
}
