use async_trait::async_trait;
use bb8_redis::bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::sleep;

use super::store::QueueStore;
use crate::runner::error::QueueError;

/// Configuration for Redis connection pool
#[derive(Debug, Clone, Copy)]
pub struct RedisConfig {
    pub max_size: u32,
    pub min_idle: u32,
    pub conn_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            min_idle: 2,
            conn_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Build a pool and verify it with a PING (with retry/backoff).
pub async fn create_redis_pool(redis_url: &str) -> Result<Pool<RedisConnectionManager>, QueueError> {
    create_redis_pool_with_config(redis_url, RedisConfig::default()).await
}

/// Build a pool with custom configuration and verify it with a PING (with retry/backoff).
pub async fn create_redis_pool_with_config(
    redis_url: &str,
    config: RedisConfig,
) -> Result<Pool<RedisConnectionManager>, QueueError> {
    if config.max_size == 0 {
        return Err(QueueError::Pool("max_size must be > 0".into()));
    }
    tracing::info!(
        url = %redacted(redis_url),
        max_size = config.max_size,
        min_idle = config.min_idle,
        "Creating Redis pool"
    );

    let manager = RedisConnectionManager::new(redis_url).map_err(|e| {
        QueueError::Pool(format!("invalid redis url: {} - {}", redacted(redis_url), e))
    })?;

    let min_idle = config.min_idle.max(1).min(config.max_size);
    let pool = Pool::builder()
        .max_size(config.max_size)
        .min_idle(Some(min_idle))
        .connection_timeout(config.conn_timeout)
        .idle_timeout(Some(config.idle_timeout))
        .max_lifetime(Some(config.max_lifetime))
        .build(manager)
        .await
        .map_err(|e| QueueError::Pool(format!("failed to build Redis pool: {}", e)))?;

    retry_async(3, Duration::from_millis(400), || async {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| QueueError::Pool(format!("get() from pool: {}", e)))?;
        redis_ping(&mut conn).await
    })
    .await
    .map_err(|e| QueueError::Pool(format!("unable to verify Redis connectivity after retries: {}", e)))?;

    Ok(pool)
}

async fn redis_ping(conn: &mut PooledConnection<'_, RedisConnectionManager>) -> Result<(), QueueError> {
    let _: String = redis::cmd("PING")
        .query_async(&mut **conn)
        .await
        .map_err(|e| QueueError::Pool(format!("Redis PING failed: {}", e)))?;
    Ok(())
}

/// Generic async retry with exponential backoff.
async fn retry_async<F, Fut, T>(max_retries: u32, base_delay: Duration, mut f: F) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, QueueError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                let delay = base_delay.mul_f32(2f32.powi((attempt - 1) as i32));
                tracing::warn!(attempt, max_retries, ?delay, error = %e, "Retrying Redis connection");
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Redact credentials in logs
fn redacted(url: &str) -> String {
    // redis://:password@host:6379/db
    if let Some(idx) = url.find('@') {
        let head = &url[..idx];
        if let Some(scheme_end) = head.find("://") {
            let scheme_end = scheme_end + 3;
            return format!("{}***:***{}", &url[..scheme_end], &url[idx..]);
        }
    }
    url.to_string()
}

/// Redis lists as the durable queue store (`RPUSH`/`LPUSH`/`LPOP`/`LLEN`).
#[derive(Clone)]
pub struct RedisStore {
    redis_pool: Pool<RedisConnectionManager>,
}

impl RedisStore {
    pub fn new(redis_pool: Pool<RedisConnectionManager>) -> Self {
        Self { redis_pool }
    }

    pub async fn connect(redis_url: &str, config: RedisConfig) -> Result<Self, QueueError> {
        Ok(Self::new(create_redis_pool_with_config(redis_url, config).await?))
    }

    async fn conn(&self) -> Result<PooledConnection<'_, RedisConnectionManager>, QueueError> {
        self.redis_pool
            .get()
            .await
            .map_err(|e| QueueError::Pool(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push_back(&self, key: &str, entry: String) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.rpush(key, entry).await?;
        Ok(())
    }

    async fn push_front(&self, key: &str, entry: String) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.lpush(key, entry).await?;
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn().await?;
        let entry: Option<String> = conn.lpop(key, None).await?;
        Ok(entry)
    }

    async fn len(&self, key: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }
}
