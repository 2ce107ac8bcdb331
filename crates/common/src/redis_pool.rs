use std::time::Duration;

use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager for async operations.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}

/// Open a connection manager, retrying up to `attempts` times with a fixed pause.
pub async fn connect_with_retry(
    client: &Client,
    attempts: u32,
    pause: Duration,
) -> redis::RedisResult<ConnectionManager> {
    let mut attempt = 1;
    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(manager) => return Ok(manager),
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
