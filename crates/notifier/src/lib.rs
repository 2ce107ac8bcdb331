//! Notification delivery: transports, retry with backoff, status tracking and
//! the consumer pool feeding them from the queue.

pub mod channels;
pub mod consumer;
pub mod retry;
pub mod sender;

#[cfg(test)]
mod testing;

pub use channels::{
    ResendEmail, TelegramBot, Transport, Unconfigured, email_from_config, telegram_from_config,
};
pub use consumer::{ConsumerPool, MessageOutcome};
pub use retry::{RetryError, RetryPolicy, retry};
pub use sender::{ChannelFailure, NotificationSender, SendError};
