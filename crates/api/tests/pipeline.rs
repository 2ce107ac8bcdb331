//! End-to-end pipeline tests: schedule, poll, queue, consume, deliver.
//!
//! Everything runs in-process on the memory store and queue; transports are
//! test doubles.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::memory::{MemoryQueue, MemoryStore};
use herald_common::queue::Queue;
use herald_common::store::payload_key;
use herald_common::types::{Channels, NotificationStatus};
use herald_notifier::{ConsumerPool, NotificationSender, RetryPolicy, Transport};
use herald_poller::{DuePoller, PollerConfig};
use herald_scheduler::NotificationScheduler;

const SET: &str = "notifications:delayed";

#[derive(Default)]
struct RecordingTransport {
    unreachable: bool,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, destination: &str, body: &str) -> anyhow::Result<()> {
        if self.unreachable {
            anyhow::bail!("connection refused");
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), body.to_string()));
        Ok(())
    }
}

struct Pipeline {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    scheduler: NotificationScheduler,
    poller: DuePoller,
    sender: Arc<NotificationSender>,
}

fn pipeline(email: Arc<RecordingTransport>, telegram: Arc<RecordingTransport>) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::connected());
    let scheduler = NotificationScheduler::new(store.clone(), SET);
    let poller = DuePoller::new(
        store.clone(),
        queue.clone(),
        PollerConfig {
            delayed_set: SET.to_string(),
            ..PollerConfig::default()
        },
    );
    let sender = Arc::new(NotificationSender::new(
        store.clone(),
        email,
        telegram,
        RetryPolicy::new(3, Duration::from_millis(10), 1.0),
    ));
    Pipeline {
        store,
        queue,
        scheduler,
        poller,
        sender,
    }
}

/// Drain whatever is on the queue through a consumer pool, then shut down.
async fn deliver_queued(p: &Pipeline) {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(10);
    let pool = ConsumerPool::new(p.sender.clone(), 2);

    let queue = p.queue.clone();
    let consume_cancel = cancel.clone();
    let consume = tokio::spawn(async move { queue.consume(tx, consume_cancel).await });

    // The consume loop keeps waiting for new messages; stop it once drained.
    let stopper = {
        let queue = p.queue.clone();
        async move {
            while !queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            queue.close().await.unwrap();
        }
    };

    tokio::join!(pool.run(rx, cancel.clone()), stopper);
    consume.await.unwrap().unwrap();
}

async fn wait_for_terminal(scheduler: &NotificationScheduler, id: &str) -> NotificationStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = scheduler.get_status(id).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("notification never reached a terminal status")
}

#[tokio::test]
async fn test_due_notification_is_delivered_and_sent() {
    let email = Arc::new(RecordingTransport::default());
    let telegram = Arc::new(RecordingTransport::default());
    let p = pipeline(email.clone(), telegram.clone());

    let notification = p
        .scheduler
        .schedule(
            "Your build finished",
            Duration::from_secs(1),
            Channels {
                email: Some("dev@example.com".to_string()),
                telegram: Some("777".to_string()),
            },
        )
        .await
        .unwrap();

    // Not yet due: nothing moves.
    let report = p.poller.scan(Utc::now()).await;
    assert_eq!(report.dispatched, 0);
    assert!(p.queue.is_empty());

    let report = p
        .poller
        .scan(notification.due_at + chrono::Duration::milliseconds(1))
        .await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        p.scheduler.get_status(&notification.id).await.unwrap(),
        NotificationStatus::Sending
    );

    deliver_queued(&p).await;

    assert_eq!(
        wait_for_terminal(&p.scheduler, &notification.id).await,
        NotificationStatus::Sent
    );
    assert_eq!(
        email.sent(),
        vec![("dev@example.com".to_string(), "Your build finished".to_string())]
    );
    assert_eq!(
        telegram.sent(),
        vec![("777".to_string(), "Your build finished".to_string())]
    );
    // Dispatch retires the payload and index entry.
    assert!(!p.store.contains_key(&payload_key(&notification.id)));
    assert_eq!(p.store.score(SET, &notification.id), None);
}

#[tokio::test]
async fn test_unreachable_email_ends_failed() {
    let email = Arc::new(RecordingTransport::unreachable());
    let telegram = Arc::new(RecordingTransport::default());
    let p = pipeline(email, telegram);

    let notification = p
        .scheduler
        .schedule("Invoice ready", Duration::from_secs(1), Channels::email("x@nowhere.invalid"))
        .await
        .unwrap();

    let err = p
        .sender
        .send(&notification, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.channel_failures.len(), 1);
    assert!(err.to_string().contains("connection refused"));

    assert_eq!(
        p.scheduler.get_status(&notification.id).await.unwrap(),
        NotificationStatus::Failed
    );
}

#[tokio::test]
async fn test_removed_notification_is_never_dispatched() {
    let p = pipeline(
        Arc::new(RecordingTransport::default()),
        Arc::new(RecordingTransport::default()),
    );

    let notification = p
        .scheduler
        .schedule("Cancelled", Duration::from_secs(1), Channels::telegram("1"))
        .await
        .unwrap();
    p.scheduler.remove(&notification.id).await.unwrap();

    assert!(p
        .scheduler
        .get_status(&notification.id)
        .await
        .unwrap_err()
        .is_not_found());

    let report = p
        .poller
        .scan(notification.due_at + chrono::Duration::seconds(10))
        .await;
    assert_eq!(report.due, 0);
    assert_eq!(p.queue.published(), 0);
}

#[tokio::test]
async fn test_remove_after_delivery_conflicts() {
    let email = Arc::new(RecordingTransport::default());
    let p = pipeline(email, Arc::new(RecordingTransport::default()));

    let notification = p
        .scheduler
        .schedule("Delivered", Duration::from_secs(1), Channels::email("a@b.com"))
        .await
        .unwrap();
    p.poller
        .scan(notification.due_at + chrono::Duration::seconds(1))
        .await;
    deliver_queued(&p).await;
    assert_eq!(
        wait_for_terminal(&p.scheduler, &notification.id).await,
        NotificationStatus::Sent
    );

    let err = p.scheduler.remove(&notification.id).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(
        p.scheduler.get_status(&notification.id).await.unwrap(),
        NotificationStatus::Sent
    );
}

#[tokio::test]
async fn test_redelivered_message_is_not_sent_twice() {
    let email = Arc::new(RecordingTransport::default());
    let p = pipeline(email.clone(), Arc::new(RecordingTransport::default()));

    let notification = p
        .scheduler
        .schedule("Once", Duration::from_secs(1), Channels::email("a@b.com"))
        .await
        .unwrap();
    p.poller
        .scan(notification.due_at + chrono::Duration::seconds(1))
        .await;
    deliver_queued(&p).await;
    assert_eq!(
        wait_for_terminal(&p.scheduler, &notification.id).await,
        NotificationStatus::Sent
    );

    // The broker hands the same message out again after it was processed.
    let payload = serde_json::to_vec(&notification).unwrap();
    let outcome =
        herald_notifier::consumer::handle_message(&p.sender, &payload, &CancellationToken::new())
            .await;

    assert_eq!(outcome, herald_notifier::MessageOutcome::Delivered);
    assert_eq!(email.sent().len(), 1);
    assert_eq!(
        p.scheduler.get_status(&notification.id).await.unwrap(),
        NotificationStatus::Sent
    );
}
