use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification lifecycle status.
///
/// Transitions only move forward: `Scheduled → Sending → {Sent, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Scheduled,
    Sending,
    Sent,
    Failed,
}

impl NotificationStatus {
    /// `Sent` and `Failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Scheduled => "scheduled",
            NotificationStatus::Sending => "sending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(NotificationStatus::Scheduled),
            "sending" => Ok(NotificationStatus::Sending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("unknown notification status '{}'", other)),
        }
    }
}

/// Delivery channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Telegram,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Telegram => write!(f, "telegram"),
        }
    }
}

/// Delivery targets of a notification. Either may be absent or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channels {
    /// Recipient email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Telegram chat id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<String>,
}

impl Channels {
    pub fn email(address: impl Into<String>) -> Self {
        Self {
            email: Some(address.into()),
            telegram: None,
        }
    }

    pub fn telegram(chat_id: impl Into<String>) -> Self {
        Self {
            email: None,
            telegram: Some(chat_id.into()),
        }
    }

    /// Channels with a non-empty destination, in a stable order.
    pub fn targets(&self) -> Vec<(ChannelKind, &str)> {
        let mut targets = Vec::with_capacity(2);
        if let Some(email) = self.email.as_deref().filter(|e| !e.trim().is_empty()) {
            targets.push((ChannelKind::Email, email));
        }
        if let Some(chat) = self.telegram.as_deref().filter(|c| !c.trim().is_empty()) {
            targets.push((ChannelKind::Telegram, chat));
        }
        targets
    }
}

/// A notification waiting for (or undergoing) delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedNotification {
    pub id: String,
    pub body: String,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub channels: Channels,
}
