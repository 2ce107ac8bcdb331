//! Broker abstraction decoupling the poller from the consumer pool.
//!
//! Messages are acknowledged when they are handed to the consumer channel,
//! before the consumer has processed them. A crash after hand-off loses the
//! message; delivery is at-least-once only across broker failures, never
//! exactly-once.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Client;
use redis::aio::ConnectionManager;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::redis_pool;

/// Seconds a single `BRPOP` blocks before the consume loop re-checks cancellation.
const BRPOP_TIMEOUT_SECS: u64 = 1;

/// Durable queue between producer (poller) and consumers.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Establish the connection, retrying up to `max_attempts` times.
    async fn connect_with_retry(&self, max_attempts: u32, pause: Duration) -> Result<(), AppError>;

    /// Enqueue one message.
    async fn publish(&self, payload: &str) -> Result<(), AppError>;

    /// Receive messages into `out` until `cancel` fires, `out` closes, or the
    /// connection fails.
    async fn consume(
        &self,
        out: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<(), AppError>;

    /// Release the connection. Publishing afterwards fails.
    async fn close(&self) -> Result<(), AppError>;
}

/// Queue backed by a Redis list (`LPUSH` to publish, `BRPOP` to consume).
pub struct RedisQueue {
    client: Client,
    queue: String,
    publisher: RwLock<Option<ConnectionManager>>,
    closed: CancellationToken,
}

impl RedisQueue {
    pub fn new(redis_url: &str, queue: impl Into<String>) -> Result<Self, AppError> {
        Ok(Self {
            client: Client::open(redis_url)?,
            queue: queue.into(),
            publisher: RwLock::new(None),
            closed: CancellationToken::new(),
        })
    }

    async fn publisher(&self) -> Result<ConnectionManager, AppError> {
        self.publisher
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::Io(format!("queue {} is not connected", self.queue)))
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn connect_with_retry(&self, max_attempts: u32, pause: Duration) -> Result<(), AppError> {
        let manager = redis_pool::connect_with_retry(&self.client, max_attempts, pause).await?;
        *self.publisher.write().await = Some(manager);

        tracing::info!(queue = %self.queue, "Connected to queue");
        Ok(())
    }

    async fn publish(&self, payload: &str) -> Result<(), AppError> {
        if self.closed.is_cancelled() {
            return Err(AppError::Io(format!("queue {} is closed", self.queue)));
        }
        let mut conn = self.publisher().await?;
        conn.lpush::<_, _, ()>(&self.queue, payload).await?;
        Ok(())
    }

    async fn consume(
        &self,
        out: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        if self.publisher.read().await.is_none() {
            return Err(AppError::Io(format!("queue {} is not connected", self.queue)));
        }

        // BRPOP blocks its connection, so the consume loop gets its own.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut brpop = redis::cmd("BRPOP");
        brpop.arg(&self.queue).arg(BRPOP_TIMEOUT_SECS);
        tracing::info!(queue = %self.queue, "Queue consumer started");

        loop {
            if cancel.is_cancelled() || self.closed.is_cancelled() {
                break;
            }
            // Never dropped mid-flight: a cancelled BRPOP may already have
            // popped its message server-side. The timeout bounds shutdown.
            let popped: Option<(String, Vec<u8>)> = brpop.query_async(&mut conn).await?;

            let Some((_, payload)) = popped else {
                continue;
            };

            let permit = tokio::select! {
                permit = out.reserve() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            match permit {
                Some(permit) => permit.send(payload),
                None => {
                    // Nobody will take it; put it back at the consuming end.
                    conn.rpush::<_, _, ()>(&self.queue, payload).await?;
                    break;
                }
            }
        }

        tracing::info!(queue = %self.queue, "Queue consumer stopped");
        Ok(())
    }

    async fn close(&self) -> Result<(), AppError> {
        self.closed.cancel();
        self.publisher.write().await.take();

        tracing::info!(queue = %self.queue, "Queue connection closed");
        Ok(())
    }
}
