use anyhow::{anyhow, Result};
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::sync::Arc;

use crate::config::RedisConfig;

pub type RedisPool = Arc<Client>;
pub type RedisConnection = MultiplexedConnection;

/// Presence keys are written by whatever process holds the live session of
/// an interactive device and expire on their own when it stops heartbeating.
pub const DEVICE_ONLINE_PREFIX: &str = "DEVICE_ONLINE:";

pub async fn create_pool(config: &RedisConfig) -> Result<RedisPool> {
    tracing::info!("Connecting to Redis at {}", mask_redis_url(&config.url));

    let client = Client::open(config.url.as_str())
        .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Failed to connect to Redis: {}", e))?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| anyhow!("Failed to ping Redis: {}", e))?;

    tracing::info!("Redis connection established ({})", pong);

    Ok(Arc::new(client))
}

pub async fn get_connection(pool: &RedisPool) -> Result<RedisConnection> {
    pool.get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))
}

pub fn device_online_key(device_id: &str) -> String {
    format!("{}{}", DEVICE_ONLINE_PREFIX, device_id)
}

pub async fn is_device_online(pool: &RedisPool, device_id: &str) -> Result<bool> {
    let mut conn = get_connection(pool).await?;
    let exists: bool = redis::cmd("EXISTS")
        .arg(device_online_key(device_id))
        .query_async(&mut conn)
        .await?;
    Ok(exists)
}

fn mask_redis_url(url: &str) -> String {
    match url.find('@') {
        Some(at_pos) => format!("redis://****{}", &url[at_pos..]),
        None => url.to_string(),
    }
}
