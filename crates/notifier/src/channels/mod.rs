//! Delivery transports, one per channel kind.

pub mod email;
pub mod telegram;

use std::sync::Arc;

use async_trait::async_trait;

use herald_common::config::AppConfig;
use herald_common::types::ChannelKind;

pub use email::ResendEmail;
pub use telegram::TelegramBot;

/// Delivers a message body to a single destination on one channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, destination: &str, body: &str) -> anyhow::Result<()>;
}

/// Stand-in for a channel without credentials. Every send fails.
pub struct Unconfigured {
    channel: ChannelKind,
}

impl Unconfigured {
    pub fn new(channel: ChannelKind) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Transport for Unconfigured {
    async fn send(&self, _destination: &str, _body: &str) -> anyhow::Result<()> {
        anyhow::bail!("{} transport is not configured", self.channel)
    }
}

/// Email transport for `config`, or [`Unconfigured`] without a Resend key.
pub fn email_from_config(config: &AppConfig, client: &reqwest::Client) -> Arc<dyn Transport> {
    match &config.resend_api_key {
        Some(key) => Arc::new(ResendEmail::new(
            client.clone(),
            config.resend_api_url.as_str(),
            key.as_str(),
            config.email_from.as_str(),
            config.email_subject.as_str(),
        )),
        None => {
            tracing::warn!("RESEND_API_KEY not set, email deliveries will fail");
            Arc::new(Unconfigured::new(ChannelKind::Email))
        }
    }
}

/// Telegram transport for `config`, or [`Unconfigured`] without a bot token.
pub fn telegram_from_config(config: &AppConfig, client: &reqwest::Client) -> Arc<dyn Transport> {
    match &config.telegram_bot_token {
        Some(token) => Arc::new(TelegramBot::new(
            client.clone(),
            config.telegram_api_url.as_str(),
            token.as_str(),
        )),
        None => {
            tracing::warn!("TELEGRAM_BOT_TOKEN not set, telegram deliveries will fail");
            Arc::new(Unconfigured::new(ChannelKind::Telegram))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_credentials_yield_unconfigured() {
        let config = AppConfig::default();
        let client = reqwest::Client::new();

        let email = email_from_config(&config, &client);
        let err = email.send("a@b.com", "hi").await.unwrap_err();
        assert_eq!(err.to_string(), "email transport is not configured");

        let telegram = telegram_from_config(&config, &client);
        assert!(telegram.send("42", "hi").await.is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_always_fails() {
        let transport = Unconfigured::new(ChannelKind::Telegram);
        let err = transport.send("42", "hi").await.unwrap_err();
        assert_eq!(err.to_string(), "telegram transport is not configured");
    }
}
