use crate::errors::Result;
use crate::policy::MAX_REFILL_TIME;
use crate::storage::{BucketSnapshot, BucketStore, SecurityStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Entry count above which a map's expired entries are swept on write
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 10_000;

/// Expiry instant for `ttl` from `now`. TTLs are capped at [`MAX_REFILL_TIME`];
/// if the clock still cannot represent the result the entry expires immediately.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_REFILL_TIME)).unwrap_or(now)
}

/// Drop expired entries from `map` once it holds more than `threshold` of them.
fn sweep<V>(map: &DashMap<String, V>, threshold: usize, name: &str, live: impl Fn(&V) -> bool) {
    if map.len() <= threshold {
        return;
    }
    let before = map.len();
    map.retain(|_, entry| live(entry));
    debug!(map = name, before, after = map.len(), "Compacted expired local entries");
}

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    tokens: f64,
    last_update: SystemTime,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

/// Process-local store.
///
/// Each map entry is guarded by its dashmap shard lock, so a single
/// read or write on a key is atomic. Expiry is checked on read by comparing
/// timestamps; nothing runs in the background. Once a map grows past the
/// compaction threshold, every write to it first sweeps its expired entries.
pub struct LocalStore {
    buckets: DashMap<String, BucketEntry>,
    failed: DashMap<String, CounterEntry>,
    blocks: DashMap<String, Instant>,
    compaction_threshold: usize,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_compaction_threshold(DEFAULT_COMPACTION_THRESHOLD)
    }

    pub fn with_compaction_threshold(compaction_threshold: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            failed: DashMap::new(),
            blocks: DashMap::new(),
            compaction_threshold,
        }
    }

    /// Number of bucket entries currently held, expired ones included
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get_bucket(&self, key: &str) -> Result<BucketSnapshot> {
        let snapshot = match self.buckets.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => BucketSnapshot {
                tokens: entry.tokens,
                last_update: Some(entry.last_update),
            },
            _ => BucketSnapshot::EMPTY,
        };
        Ok(snapshot)
    }

    async fn update_bucket(&self, key: &str, tokens: f64, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        sweep(&self.buckets, self.compaction_threshold, "buckets", |entry| {
            entry.expires_at > now
        });

        self.buckets.insert(
            key.to_string(),
            BucketEntry {
                tokens,
                last_update: SystemTime::now(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl SecurityStore for LocalStore {
    async fn record_failed_attempt(&self, key: &str, retention: Duration) -> Result<u64> {
        let now = Instant::now();
        // Before taking the entry: retain needs every shard lock
        sweep(&self.failed, self.compaction_threshold, "failed", |entry| {
            entry.expires_at > now
        });

        let mut entry = self.failed.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now,
        });
        if entry.expires_at <= now {
            entry.count = 0;
        }
        entry.count += 1;
        entry.expires_at = expiry(now, retention);
        Ok(entry.count)
    }

    async fn failed_attempts(&self, key: &str) -> Result<u64> {
        let count = match self.failed.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => entry.count,
            _ => 0,
        };
        Ok(count)
    }

    async fn set_block(&self, key: &str, duration: Duration) -> Result<()> {
        let now = Instant::now();
        sweep(&self.blocks, self.compaction_threshold, "blocks", |until| *until > now);
        self.blocks.insert(key.to_string(), expiry(now, duration));
        Ok(())
    }

    async fn block_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let remaining = self
            .blocks
            .get(key)
            .and_then(|until| until.checked_duration_since(now))
            .filter(|left| !left.is_zero());
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_is_uninitialized() {
        let store = LocalStore::new();
        let snapshot = store.get_bucket("rl:nobody:home").await.unwrap();
        assert!(snapshot.is_uninitialized());
        assert_eq!(snapshot.tokens, 0.0);
    }

    #[tokio::test]
    async fn test_update_then_get() {
        let store = LocalStore::new();
        store
            .update_bucket("rl:alice:orders", 3.5, Duration::from_secs(10))
            .await
            .unwrap();

        let snapshot = store.get_bucket("rl:alice:orders").await.unwrap();
        assert_eq!(snapshot.tokens, 3.5);
        assert!(snapshot.last_update.is_some());
    }

    #[tokio::test]
    async fn test_expired_bucket_reads_as_empty() {
        let store = LocalStore::new();
        store
            .update_bucket("rl:bob:orders", 1.0, Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let snapshot = store.get_bucket("rl:bob:orders").await.unwrap();
        assert_eq!(snapshot, BucketSnapshot::EMPTY);
    }

    #[tokio::test]
    async fn test_compaction_past_threshold() {
        let store = LocalStore::with_compaction_threshold(4);
        for i in 0..5 {
            store
                .update_bucket(&format!("rl:stale{i}:x"), 1.0, Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(store.bucket_count(), 5);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Map is over the threshold, so this write sweeps the stale entries first
        store
            .update_bucket("rl:fresh:x", 1.0, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_no_compaction_below_threshold() {
        let store = LocalStore::with_compaction_threshold(100);
        for i in 0..3 {
            store
                .update_bucket(&format!("rl:stale{i}:x"), 1.0, Duration::from_millis(5))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .update_bucket("rl:fresh:x", 1.0, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.bucket_count(), 4);
    }

    #[tokio::test]
    async fn test_oversized_ttl_does_not_overflow() {
        let store = LocalStore::new();
        store
            .update_bucket("rl:forever:x", 2.0, Duration::MAX)
            .await
            .unwrap();
        let snapshot = store.get_bucket("rl:forever:x").await.unwrap();
        assert_eq!(snapshot.tokens, 2.0);

        store.set_block("rl:blocked:9.9.9.9", Duration::MAX).await.unwrap();
        let remaining = store.block_remaining("rl:blocked:9.9.9.9").await.unwrap();
        assert!(remaining.is_some_and(|left| left <= MAX_REFILL_TIME));

        assert_eq!(
            store
                .record_failed_attempt("rl:failed:9.9.9.9", Duration::MAX)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_map_compacts_on_its_own_writes() {
        let store = LocalStore::with_compaction_threshold(4);
        for i in 0..5 {
            store
                .record_failed_attempt(&format!("rl:failed:10.0.0.{i}"), Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(store.failed.len(), 5);
        tokio::time::sleep(Duration::from_millis(30)).await;

        store
            .record_failed_attempt("rl:failed:10.0.0.99", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.failed.len(), 1);
        assert_eq!(store.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_block_map_compacts_on_its_own_writes() {
        let store = LocalStore::with_compaction_threshold(4);
        for i in 0..5 {
            store
                .set_block(&format!("rl:blocked:10.0.0.{i}"), Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(store.blocks.len(), 5);
        tokio::time::sleep(Duration::from_millis(30)).await;

        store
            .set_block("rl:blocked:10.0.0.99", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_attempts_count_and_expire() {
        let store = LocalStore::new();
        let retention = Duration::from_millis(30);
        assert_eq!(store.record_failed_attempt("rl:failed:1.2.3.4", retention).await.unwrap(), 1);
        assert_eq!(store.record_failed_attempt("rl:failed:1.2.3.4", retention).await.unwrap(), 2);
        assert_eq!(store.failed_attempts("rl:failed:1.2.3.4").await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.failed_attempts("rl:failed:1.2.3.4").await.unwrap(), 0);
        assert_eq!(store.record_failed_attempt("rl:failed:1.2.3.4", retention).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_block_lifecycle() {
        let store = LocalStore::new();
        assert_eq!(store.block_remaining("rl:blocked:1.2.3.4").await.unwrap(), None);

        store
            .set_block("rl:blocked:1.2.3.4", Duration::from_millis(40))
            .await
            .unwrap();
        let remaining = store.block_remaining("rl:blocked:1.2.3.4").await.unwrap();
        assert!(remaining.is_some_and(|left| left <= Duration::from_millis(40)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.block_remaining("rl:blocked:1.2.3.4").await.unwrap(), None);
    }
}
