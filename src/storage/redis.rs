use crate::errors::{AdmitError, Result};
use crate::storage::{BucketSnapshot, BucketStore, SecurityStore};
use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

const TOKENS_FIELD: &str = "tokens";
const LAST_UPDATE_FIELD: &str = "lastUpdate";

/// Remote store shared by every process of a deployment.
///
/// A bucket is a hash `{tokens, lastUpdate}` where `lastUpdate` is nanoseconds
/// since the Unix epoch. Every call is bounded by `command_timeout`.
pub struct RedisStore {
    pool: Pool,
    command_timeout: Duration,
}

impl RedisStore {
    pub fn new(pool: Pool, command_timeout: Duration) -> Self {
        Self {
            pool,
            command_timeout,
        }
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            error!("Failed to get Redis connection: {}", e);
            AdmitError::RedisPool(e.to_string())
        })
    }

    async fn bounded<T, F>(&self, command: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdmitError::Timeout(format!(
                "{} exceeded {:?}",
                command, self.command_timeout
            ))),
        }
    }

    /// Check if Redis is reachable
    pub async fn health_check(&self) -> Result<()> {
        self.bounded("PING", async {
            let mut conn = self.connection().await?;
            let response: String = redis::cmd("PING").query_async(&mut conn).await?;
            if response != "PONG" {
                return Err(AdmitError::Serialization(format!(
                    "Unexpected PING response: {}",
                    response
                )));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_bucket(&self, key: &str) -> Result<BucketSnapshot> {
        self.bounded("HGETALL", async {
            let mut conn = self.connection().await?;
            let fields: HashMap<String, String> = conn.hgetall(key).await?;
            decode_bucket(&fields)
        })
        .await
    }

    async fn update_bucket(&self, key: &str, tokens: f64, ttl: Duration) -> Result<()> {
        let last_update = encode_timestamp(SystemTime::now())?;
        let ttl_ms = ttl_millis(ttl);

        debug!(key, tokens, ttl_ms, "Writing bucket to Redis");

        self.bounded("MULTI", async {
            let mut conn = self.connection().await?;
            redis::pipe()
                .atomic()
                .hset(key, TOKENS_FIELD, tokens)
                .ignore()
                .hset(key, LAST_UPDATE_FIELD, last_update)
                .ignore()
                .pexpire(key, ttl_ms)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SecurityStore for RedisStore {
    async fn record_failed_attempt(&self, key: &str, retention: Duration) -> Result<u64> {
        let retention_ms = ttl_millis(retention);
        self.bounded("INCR", async {
            let mut conn = self.connection().await?;
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .incr(key, 1)
                .pexpire(key, retention_ms)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn failed_attempts(&self, key: &str) -> Result<u64> {
        self.bounded("GET", async {
            let mut conn = self.connection().await?;
            let count: Option<u64> = conn.get(key).await?;
            Ok(count.unwrap_or(0))
        })
        .await
    }

    async fn set_block(&self, key: &str, duration: Duration) -> Result<()> {
        let duration_ms = ttl_millis(duration);
        self.bounded("SET", async {
            let mut conn = self.connection().await?;
            redis::cmd("SET")
                .arg(key)
                .arg(1)
                .arg("PX")
                .arg(duration_ms)
                .query_async::<()>(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn block_remaining(&self, key: &str) -> Result<Option<Duration>> {
        self.bounded("PTTL", async {
            let mut conn = self.connection().await?;
            // -2: missing, -1: no expiry (never written by us)
            let remaining_ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
            Ok((remaining_ms > 0).then(|| Duration::from_millis(remaining_ms as u64)))
        })
        .await
    }
}

/// Redis rejects a zero expiry, so anything below 1ms rounds up.
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn encode_timestamp(at: SystemTime) -> Result<i64> {
    let nanos = at
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AdmitError::Serialization(format!("Clock before Unix epoch: {}", e)))?
        .as_nanos();
    i64::try_from(nanos)
        .map_err(|_| AdmitError::Serialization(format!("Timestamp out of range: {}ns", nanos)))
}

fn decode_timestamp(nanos: i64) -> Result<SystemTime> {
    let nanos = u64::try_from(nanos)
        .map_err(|_| AdmitError::Serialization(format!("Negative lastUpdate: {}", nanos)))?;
    Ok(UNIX_EPOCH + Duration::from_nanos(nanos))
}

/// Missing or partially written hashes read as an uninitialized bucket.
fn decode_bucket(fields: &HashMap<String, String>) -> Result<BucketSnapshot> {
    let (tokens, last_update) = match (fields.get(TOKENS_FIELD), fields.get(LAST_UPDATE_FIELD)) {
        (Some(tokens), Some(last_update)) if !tokens.is_empty() && !last_update.is_empty() => {
            (tokens, last_update)
        }
        _ => return Ok(BucketSnapshot::EMPTY),
    };

    let tokens: f64 = tokens
        .parse()
        .map_err(|e| AdmitError::Serialization(format!("Invalid tokens '{}': {}", tokens, e)))?;
    let nanos: i64 = last_update.parse().map_err(|e| {
        AdmitError::Serialization(format!("Invalid lastUpdate '{}': {}", last_update, e))
    })?;

    Ok(BucketSnapshot {
        tokens,
        last_update: Some(decode_timestamp(nanos)?),
    })
}
