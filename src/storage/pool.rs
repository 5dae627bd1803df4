use crate::config::RedisConfig;
use crate::errors::{AdmitError, Result};
use deadpool::managed::{PoolConfig as DeadpoolPoolConfig, Timeouts};
use deadpool_redis::{Config as DeadpoolRedisConfig, Pool, Runtime};
use std::time::Duration;
use tracing::{debug, info};

/// Create a Redis connection pool from configuration and verify it with PING
pub async fn create_redis_pool(config: &RedisConfig) -> Result<Pool> {
    info!("Creating Redis connection pool...");

    let mut cfg = DeadpoolRedisConfig::from_url(config.url.clone());

    let connect_timeout = Duration::from_secs(config.connection_timeout_secs);
    let mut pool_config = DeadpoolPoolConfig::new(config.max_connections);
    pool_config.timeouts = Timeouts {
        wait: Some(connect_timeout),
        create: Some(connect_timeout),
        recycle: Some(connect_timeout),
    };
    cfg.pool = Some(pool_config);

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| AdmitError::RedisPool(format!("Pool creation failed: {}", e)))?;

    info!(
        "Redis connection pool created (max_connections: {})",
        config.max_connections
    );

    debug!("Testing Redis connection...");
    let mut conn = pool
        .get()
        .await
        .map_err(|e| AdmitError::RedisPool(format!("Failed to get connection: {}", e)))?;

    let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Redis connection test successful");

    Ok(pool)
}

/// Get pool statistics
pub fn get_pool_stats(pool: &Pool) -> PoolStats {
    let status = pool.status();
    PoolStats {
        size: status.size,
        available: status.available,
        max_size: status.max_size,
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
}
