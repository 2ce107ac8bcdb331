use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string
    pub redis_url: String,

    /// HTTP listen address (default: 0.0.0.0:3000)
    pub http_address: String,

    /// Name of the sorted set holding not-yet-due notifications
    pub delayed_set_name: String,

    /// Name of the Redis list used as the delivery queue
    pub queue_name: String,

    /// Poller tick interval in milliseconds (default: 1000)
    pub poller_tick_ms: u64,

    /// Maximum number of due notifications dispatched per tick (default: 10)
    pub poller_batch_size: usize,

    /// Delay before a failed publish is retried, in milliseconds (default: 5000)
    pub poller_publish_retry_delay_ms: u64,

    /// Failed publishes tolerated before a notification is marked failed (default: 5)
    pub poller_max_publish_attempts: u32,

    /// Number of consumer workers (default: 4)
    pub consumer_workers: usize,

    /// Capacity of the channel between the queue and the workers (default: 10)
    pub consumer_buffer: usize,

    /// Delivery attempts per channel (default: 10)
    pub send_retry_attempts: u32,

    /// Delay before the second delivery attempt, in milliseconds (default: 2000)
    pub send_retry_delay_ms: u64,

    /// Multiplier applied to the delay after each failed attempt (default: 2.0)
    pub send_retry_backoff: f64,

    /// Broker connection attempts at startup (default: 3)
    pub broker_connect_attempts: u32,

    /// Pause between broker connection attempts, in milliseconds (default: 1000)
    pub broker_connect_pause_ms: u64,

    /// How long terminal statuses are kept, in seconds (default: 7 days)
    pub status_retention_secs: u64,

    /// Telegram bot token
    pub telegram_bot_token: Option<String>,

    /// Telegram Bot API base URL
    pub telegram_api_url: String,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Resend API base URL
    pub resend_api_url: String,

    /// Email sender address
    pub email_from: String,

    /// Email subject line
    pub email_subject: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            http_address: "0.0.0.0:3000".to_string(),
            delayed_set_name: "notifications:delayed".to_string(),
            queue_name: "notifications:queue".to_string(),
            poller_tick_ms: 1000,
            poller_batch_size: 10,
            poller_publish_retry_delay_ms: 5000,
            poller_max_publish_attempts: 5,
            consumer_workers: 4,
            consumer_buffer: 10,
            send_retry_attempts: 10,
            send_retry_delay_ms: 2000,
            send_retry_backoff: 2.0,
            broker_connect_attempts: 3,
            broker_connect_pause_ms: 1000,
            status_retention_secs: 7 * 24 * 60 * 60,
            telegram_bot_token: None,
            telegram_api_url: "https://api.telegram.org".to_string(),
            resend_api_key: None,
            resend_api_url: "https://api.resend.com".to_string(),
            email_from: "notifications@herald.local".to_string(),
            email_subject: "Notification".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            redis_url: string_var("REDIS_URL", defaults.redis_url),
            http_address: string_var("HTTP_ADDRESS", defaults.http_address),
            delayed_set_name: string_var("DELAYED_SET_NAME", defaults.delayed_set_name),
            queue_name: string_var("QUEUE_NAME", defaults.queue_name),
            poller_tick_ms: parsed_var("POLLER_TICK_MS", defaults.poller_tick_ms)?,
            poller_batch_size: parsed_var("POLLER_BATCH_SIZE", defaults.poller_batch_size)?,
            poller_publish_retry_delay_ms: parsed_var(
                "POLLER_PUBLISH_RETRY_DELAY_MS",
                defaults.poller_publish_retry_delay_ms,
            )?,
            poller_max_publish_attempts: parsed_var(
                "POLLER_MAX_PUBLISH_ATTEMPTS",
                defaults.poller_max_publish_attempts,
            )?,
            consumer_workers: parsed_var("CONSUMER_WORKERS", defaults.consumer_workers)?,
            consumer_buffer: parsed_var("CONSUMER_BUFFER", defaults.consumer_buffer)?,
            send_retry_attempts: parsed_var("SEND_RETRY_ATTEMPTS", defaults.send_retry_attempts)?,
            send_retry_delay_ms: parsed_var("SEND_RETRY_DELAY_MS", defaults.send_retry_delay_ms)?,
            send_retry_backoff: parsed_var("SEND_RETRY_BACKOFF", defaults.send_retry_backoff)?,
            broker_connect_attempts: parsed_var(
                "BROKER_CONNECT_ATTEMPTS",
                defaults.broker_connect_attempts,
            )?,
            broker_connect_pause_ms: parsed_var(
                "BROKER_CONNECT_PAUSE_MS",
                defaults.broker_connect_pause_ms,
            )?,
            status_retention_secs: parsed_var(
                "STATUS_RETENTION_SECS",
                defaults.status_retention_secs,
            )?,
            telegram_bot_token: optional_var("TELEGRAM_BOT_TOKEN"),
            telegram_api_url: string_var("TELEGRAM_API_URL", defaults.telegram_api_url),
            resend_api_key: optional_var("RESEND_API_KEY"),
            resend_api_url: string_var("RESEND_API_URL", defaults.resend_api_url),
            email_from: string_var("EMAIL_FROM", defaults.email_from),
            email_subject: string_var("EMAIL_SUBJECT", defaults.email_subject),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poller_tick_ms == 0 {
            anyhow::bail!("POLLER_TICK_MS must be greater than zero");
        }
        if self.poller_batch_size == 0 {
            anyhow::bail!("POLLER_BATCH_SIZE must be greater than zero");
        }
        if self.poller_max_publish_attempts == 0 {
            anyhow::bail!("POLLER_MAX_PUBLISH_ATTEMPTS must be greater than zero");
        }
        if self.consumer_workers == 0 || self.consumer_buffer == 0 {
            anyhow::bail!("CONSUMER_WORKERS and CONSUMER_BUFFER must be greater than zero");
        }
        if self.send_retry_attempts == 0 {
            anyhow::bail!("SEND_RETRY_ATTEMPTS must be greater than zero");
        }
        if !(self.send_retry_backoff.is_finite() && self.send_retry_backoff >= 1.0) {
            anyhow::bail!("SEND_RETRY_BACKOFF must be a finite number >= 1.0");
        }
        if self.broker_connect_attempts == 0 {
            anyhow::bail!("BROKER_CONNECT_ATTEMPTS must be greater than zero");
        }
        Ok(())
    }

    pub fn poller_tick(&self) -> Duration {
        Duration::from_millis(self.poller_tick_ms)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.poller_publish_retry_delay_ms)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn broker_connect_pause(&self) -> Duration {
        Duration::from_millis(self.broker_connect_pause_ms)
    }

    pub fn status_retention(&self) -> Duration {
        Duration::from_secs(self.status_retention_secs)
    }
}

fn string_var(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
