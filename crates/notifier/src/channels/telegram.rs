//! Telegram delivery through the Bot API `sendMessage` method.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Transport;

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramBot {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl TelegramBot {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Transport for TelegramBot {
    async fn send(&self, destination: &str, body: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}/bot{}/sendMessage", self.api_url, self.token))
            .json(&SendMessageRequest {
                chat_id: destination,
                text: body,
            })
            .send()
            .await?;

        let status = response.status();
        // The Bot API reports failures in the body, often with a 4xx status too.
        let reply: BotApiResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Telegram returned {} with unreadable body: {}", status, e))?;

        if !reply.ok {
            anyhow::bail!(
                "Telegram rejected message ({}): {}",
                status,
                reply.description.unwrap_or_else(|| "no description".to_string())
            );
        }

        tracing::debug!(chat_id = %destination, "Telegram message delivered");
        Ok(())
    }
}
