pub mod local;
pub mod pool;
pub mod redis;

use crate::errors::Result;
use async_trait::async_trait;
use std::time::{Duration, SystemTime};

pub use local::LocalStore;
pub use self::redis::RedisStore;

/// Bucket state as read from a store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    /// Token balance at `last_update`
    pub tokens: f64,

    /// When the balance was last written. `None` means the key is missing or expired.
    pub last_update: Option<SystemTime>,
}

impl BucketSnapshot {
    /// Snapshot returned for a missing or expired key
    pub const EMPTY: BucketSnapshot = BucketSnapshot {
        tokens: 0.0,
        last_update: None,
    };

    pub fn is_uninitialized(&self) -> bool {
        self.last_update.is_none()
    }
}

/// Token bucket persistence.
///
/// Implementations must be safe for concurrent use. Absence of a key is never an
/// error: `get_bucket` returns [`BucketSnapshot::EMPTY`] instead.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Short label used in logs and metrics (e.g. "redis", "local")
    fn name(&self) -> &'static str;

    /// Read the bucket stored under `key`
    async fn get_bucket(&self, key: &str) -> Result<BucketSnapshot>;

    /// Store `tokens` under `key`, stamped with the current time, expiring after `ttl`.
    /// The value and the expiry are written as one unit.
    async fn update_bucket(&self, key: &str, tokens: f64, ttl: Duration) -> Result<()>;
}

/// Failed-attempt counters and IP blocks.
#[async_trait]
pub trait SecurityStore: Send + Sync {
    /// Increment the counter under `key`, (re)setting its expiry to `retention`.
    /// Returns the counter value after the increment.
    async fn record_failed_attempt(&self, key: &str, retention: Duration) -> Result<u64>;

    /// Current counter value, 0 when missing or expired
    async fn failed_attempts(&self, key: &str) -> Result<u64>;

    /// Mark `key` as blocked for `duration`
    async fn set_block(&self, key: &str, duration: Duration) -> Result<()>;

    /// Time left on an active block, `None` when not blocked
    async fn block_remaining(&self, key: &str) -> Result<Option<Duration>>;
}
