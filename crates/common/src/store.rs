//! Key-value + sorted-set storage contract and its Redis implementation.
//!
//! The store holds three kinds of records per notification (payload, status,
//! publish-retry counter) plus the sorted set used as the due index. Every
//! operation is a single keyed command, so callers rely on per-key atomicity
//! only; multi-step sequences are not transactional.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::AppError;

/// Key holding the serialized notification.
pub fn payload_key(id: &str) -> String {
    format!("notification:{}", id)
}

/// Key holding the current status string.
pub fn status_key(id: &str) -> String {
    format!("notification.status:{}", id)
}

/// Key counting failed publish attempts of a due notification.
pub fn publish_attempts_key(id: &str) -> String {
    format!("notification.publish_attempts:{}", id)
}

/// Storage operations consumed by the scheduler, poller and sender.
#[async_trait]
pub trait Store: Send + Sync {
    /// Set `key` to `value`, optionally expiring after `ttl`.
    async fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError>;

    /// Fetch `key`. Returns [`AppError::NotFound`] when it does not exist.
    async fn get(&self, key: &str) -> Result<String, AppError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), AppError>;

    /// Insert or re-score `member` in the sorted set `set`.
    async fn sorted_set_add(&self, set: &str, member: &str, score: f64) -> Result<(), AppError>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<String>, AppError>;

    /// Remove `member` from `set`. Removing a missing member is not an error.
    async fn sorted_set_remove(&self, set: &str, member: &str) -> Result<(), AppError>;

    /// Round-trip to the backend. In-process stores are always reachable.
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Redis-backed store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Render a score bound the way `ZRANGEBYSCORE` expects infinities.
fn score_bound(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                // PX keeps sub-second retention exact; never pass 0, Redis rejects it.
                let millis = ttl.as_millis().max(1) as u64;
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis)
                    .query_async(&mut conn)
                    .await?;
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, AppError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        value.ok_or_else(|| AppError::NotFound(format!("key {} not found", key)))
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn sorted_set_add(&self, set: &str, member: &str, score: f64) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(set, member, score).await?;
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(set)
            .arg(score_bound(min))
            .arg(score_bound(max))
            .arg("LIMIT")
            .arg(offset)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn sorted_set_remove(&self, set: &str, member: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(set, member).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced_per_record() {
        assert_eq!(payload_key("abc"), "notification:abc");
        assert_eq!(status_key("abc"), "notification.status:abc");
        assert_eq!(
            publish_attempts_key("abc"),
            "notification.publish_attempts:abc"
        );
    }

    #[test]
    fn test_score_bound_infinities() {
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(1700000000000.0), "1700000000000");
    }
}
