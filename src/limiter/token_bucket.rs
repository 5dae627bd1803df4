use crate::errors::{AdmitError, Result};
use crate::limiter::{Decision, RateLimiter};
use crate::metrics;
use crate::policy::Policy;
use crate::storage::{BucketSnapshot, BucketStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Token bucket limiter over a primary store with a fallback.
///
/// Reads go to the primary and fall back to the secondary on error. Every check
/// writes the new balance to both stores so the fallback stays warm. Write
/// failures are logged and counted but never change the decision.
///
/// Read and write are separate store calls, so two concurrent checks on one key
/// can both act on the same balance. Each individual write is still atomic.
pub struct TokenBucketLimiter {
    primary: Arc<dyn BucketStore>,
    fallback: Arc<dyn BucketStore>,
}

impl TokenBucketLimiter {
    pub fn new(primary: Arc<dyn BucketStore>, fallback: Arc<dyn BucketStore>) -> Self {
        Self { primary, fallback }
    }

    /// Use one store for both roles
    pub fn single(store: Arc<dyn BucketStore>) -> Self {
        Self::new(store.clone(), store)
    }

    async fn read(&self, key: &str) -> Result<BucketSnapshot> {
        let primary_err = match self.primary.get_bucket(key).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) => e,
        };

        warn!(
            key,
            store = self.primary.name(),
            error = %primary_err,
            "Primary bucket read failed, using fallback"
        );
        metrics::record_fallback_read();

        self.fallback
            .get_bucket(key)
            .await
            .map_err(|fallback_err| AdmitError::StorageUnavailable {
                primary: primary_err.to_string(),
                fallback: fallback_err.to_string(),
            })
    }

    async fn write_both(&self, key: &str, tokens: f64, ttl: Duration) {
        let (primary, fallback) = tokio::join!(
            self.primary.update_bucket(key, tokens, ttl),
            self.fallback.update_bucket(key, tokens, ttl),
        );
        log_write("primary", self.primary.name(), key, primary);
        log_write("fallback", self.fallback.name(), key, fallback);
    }

    async fn check_inner(&self, key: &str, policy: &Policy) -> Result<Decision> {
        let snapshot = self.read(key).await?;
        let now = SystemTime::now();

        let tokens = match snapshot.last_update {
            None => policy.burst(),
            Some(last_update) => {
                // Clock skew between writers reads as no time passed
                let elapsed = now.duration_since(last_update).unwrap_or(Duration::ZERO);
                refill(snapshot.tokens, elapsed, policy)
            }
        };

        let ttl = policy.refill_time();

        if tokens < 1.0 {
            let retry_after_secs = retry_after_secs(tokens, policy);
            // Keep the partial balance so the next check refills from here
            self.write_both(key, tokens, ttl).await;
            debug!(key, tokens, retry_after_secs, "Bucket empty, request denied");
            return Ok(Decision::deny(retry_after_secs));
        }

        let tokens = tokens - 1.0;
        self.write_both(key, tokens, ttl).await;
        debug!(key, tokens, "Token consumed");
        Ok(Decision::allow(tokens.floor() as u32))
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn check(&self, key: &str, policy: &Policy) -> Result<Decision> {
        let started = Instant::now();
        let result = self.check_inner(key, policy).await;

        let label = match &result {
            Ok(decision) if decision.allowed => "allowed",
            Ok(_) => "denied",
            Err(_) => "error",
        };
        metrics::record_check(label, started.elapsed().as_secs_f64());
        result
    }
}

/// Continuous refill: `min(burst, tokens + elapsed * rate)`
pub fn refill(tokens: f64, elapsed: Duration, policy: &Policy) -> f64 {
    let refilled = elapsed.as_secs_f64() * policy.rate();
    (tokens + refilled).min(policy.burst())
}

/// Seconds until one whole token is available: `ceil((1 - tokens) / rate)`, at least 1
pub fn retry_after_secs(tokens: f64, policy: &Policy) -> u64 {
    let wait = ((1.0 - tokens) / policy.rate()).ceil();
    (wait as u64).max(1)
}

fn log_write(role: &str, store: &str, key: &str, outcome: Result<()>) {
    if let Err(e) = outcome {
        let err = AdmitError::StorageWriteFailed {
            store: store.to_string(),
            reason: e.to_string(),
        };
        warn!(key, role, error = %err, "Bucket write dropped");
        metrics::record_write_failure(role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MAX_REFILL_TIME;
    use crate::storage::LocalStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn scenario_policy() -> Policy {
        Policy::new(5, 2.0).unwrap()
    }

    fn local_pair() -> (Arc<LocalStore>, Arc<LocalStore>) {
        (Arc::new(LocalStore::new()), Arc::new(LocalStore::new()))
    }

    fn limiter(primary: Arc<LocalStore>, fallback: Arc<LocalStore>) -> TokenBucketLimiter {
        TokenBucketLimiter::new(primary, fallback)
    }

    /// Store whose reads and/or writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: LocalStore,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        writes: AtomicUsize,
    }

    impl FlakyStore {
        fn failing() -> Self {
            let store = Self::default();
            store.fail_reads.store(true, Ordering::SeqCst);
            store.fail_writes.store(true, Ordering::SeqCst);
            store
        }
    }

    #[async_trait]
    impl BucketStore for FlakyStore {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn get_bucket(&self, key: &str) -> Result<BucketSnapshot> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(AdmitError::Timeout("simulated read failure".to_string()));
            }
            self.inner.get_bucket(key).await
        }

        async fn update_bucket(&self, key: &str, tokens: f64, ttl: Duration) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(AdmitError::Timeout("simulated write failure".to_string()));
            }
            self.inner.update_bucket(key, tokens, ttl).await
        }
    }

    #[test]
    fn test_refill_is_capped() {
        let policy = scenario_policy();
        assert_eq!(refill(0.0, Duration::from_millis(500), &policy), 1.0);
        assert_eq!(refill(4.5, Duration::from_secs(60), &policy), 5.0);
        assert_eq!(refill(0.25, Duration::ZERO, &policy), 0.25);
    }

    #[test]
    fn test_retry_after() {
        let policy = scenario_policy();
        assert_eq!(retry_after_secs(0.0, &policy), 1); // ceil(0.5)
        assert_eq!(retry_after_secs(0.99, &policy), 1);

        let slow = Policy::new(5, 0.1).unwrap();
        assert_eq!(retry_after_secs(0.0, &slow), 10);
        assert_eq!(retry_after_secs(0.5, &slow), 5);
        assert_eq!(retry_after_secs(0.05, &slow), 10); // ceil(9.5)
    }

    #[tokio::test]
    async fn test_new_bucket_allows() {
        let (primary, fallback) = local_pair();
        let limiter = limiter(primary, fallback);

        let decision = limiter.check("test1", &scenario_policy()).await.unwrap();
        assert_eq!(decision, Decision::allow(4));
    }

    #[tokio::test]
    async fn test_burst_then_deny() {
        let (primary, fallback) = local_pair();
        let limiter = limiter(primary, fallback);
        let policy = scenario_policy();

        for i in 0..5 {
            let decision = limiter.check("k", &policy).await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", i + 1);
        }

        let decision = limiter.check("k", &policy).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs >= 1);
    }

    #[tokio::test]
    async fn test_burst_capacity_is_exact() {
        let (primary, fallback) = local_pair();
        let limiter = limiter(primary, fallback);

        for burst in [1u32, 3, 17] {
            let policy = Policy::new(burst, 0.01).unwrap();
            let key = format!("burst-{burst}");
            for _ in 0..burst {
                assert!(limiter.check(&key, &policy).await.unwrap().allowed);
            }
            let denied = limiter.check(&key, &policy).await.unwrap();
            assert!(!denied.allowed);
            assert_eq!(denied.retry_after_secs, 100);
        }
    }

    #[tokio::test]
    async fn test_refill_after_sleep() {
        let (primary, fallback) = local_pair();
        let limiter = limiter(primary, fallback);
        let policy = scenario_policy();

        for _ in 0..5 {
            limiter.check("test3", &policy).await.unwrap();
        }
        assert!(!limiter.check("test3", &policy).await.unwrap().allowed);

        // 2 tokens/s: one token back after 500ms
        tokio::time::sleep(Duration::from_millis(500)).await;

        let decision = limiter.check("test3", &policy).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.retry_after_secs, 0);

        // Only one token came back
        assert!(!limiter.check("test3", &policy).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_denial_keeps_partial_balance() {
        let (primary, fallback) = local_pair();
        let limiter = limiter(primary.clone(), fallback);
        let policy = scenario_policy();

        for _ in 0..5 {
            limiter.check("partial", &policy).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!limiter.check("partial", &policy).await.unwrap().allowed);

        // The denied check stored ~0.4 tokens, not zero
        let snapshot = primary.get_bucket("partial").await.unwrap();
        assert!(snapshot.tokens > 0.3 && snapshot.tokens < 1.0, "tokens = {}", snapshot.tokens);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (primary, fallback) = local_pair();
        let limiter = limiter(primary, fallback);
        let policy = scenario_policy();

        for _ in 0..5 {
            limiter.check("key1", &policy).await.unwrap();
        }
        assert!(!limiter.check("key1", &policy).await.unwrap().allowed);

        let decision = limiter.check("key2", &policy).await.unwrap();
        assert_eq!(decision, Decision::allow(4));
    }

    #[tokio::test]
    async fn test_failing_primary_uses_fallback() {
        let fallback = Arc::new(LocalStore::new());
        let limiter = TokenBucketLimiter::new(Arc::new(FlakyStore::failing()), fallback.clone());
        let policy = scenario_policy();

        for _ in 0..5 {
            assert!(limiter.check("test4", &policy).await.unwrap().allowed);
        }
        let denied = limiter.check("test4", &policy).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs >= 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(limiter.check("test4", &policy).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_fallback_stays_warm() {
        let primary = Arc::new(FlakyStore::default());
        let fallback = Arc::new(LocalStore::new());
        let limiter = TokenBucketLimiter::new(primary.clone(), fallback.clone());
        let policy = scenario_policy();

        for _ in 0..5 {
            limiter.check("warm", &policy).await.unwrap();
        }

        // Primary goes down after the bucket was drained through it
        primary.fail_reads.store(true, Ordering::SeqCst);
        primary.fail_writes.store(true, Ordering::SeqCst);

        let decision = limiter.check("warm", &policy).await.unwrap();
        assert!(!decision.allowed, "fallback must not reset the bucket to full");
    }

    #[tokio::test]
    async fn test_write_failures_do_not_change_decision() {
        let primary = Arc::new(FlakyStore::default());
        primary.fail_writes.store(true, Ordering::SeqCst);
        let limiter = TokenBucketLimiter::new(primary.clone(), Arc::new(LocalStore::new()));

        let decision = limiter.check("writes", &scenario_policy()).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(primary.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_both_reads_failing_is_unavailable() {
        let limiter = TokenBucketLimiter::new(
            Arc::new(FlakyStore::failing()),
            Arc::new(FlakyStore::failing()),
        );

        let result = limiter.check("down", &scenario_policy()).await;
        assert!(matches!(result, Err(AdmitError::StorageUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_single_store() {
        let limiter = TokenBucketLimiter::single(Arc::new(LocalStore::new()));
        let policy = Policy::new(2, 1.0).unwrap();

        assert!(limiter.check("solo", &policy).await.unwrap().allowed);
        assert!(limiter.check("solo", &policy).await.unwrap().allowed);
        assert!(!limiter.check("solo", &policy).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_expired_bucket_starts_full() {
        let (primary, fallback) = local_pair();
        let limiter = limiter(primary, fallback);
        // Refills fully in 50ms, which is also the TTL
        let policy = Policy::new(1, 20.0).unwrap();

        assert!(limiter.check("ttl", &policy).await.unwrap().allowed);
        assert!(!limiter.check("ttl", &policy).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.check("ttl", &policy).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_slowest_policies_check_cleanly() {
        let (primary, fallback) = local_pair();
        let limiter = limiter(primary.clone(), fallback);

        // Refills in just under the ceiling; the halved copy would exceed it
        let rate = f64::from(u32::MAX) / (MAX_REFILL_TIME.as_secs_f64() * 0.99);
        let slowest = Policy::new(u32::MAX, rate).unwrap();
        assert!(limiter.check("slow", &slowest).await.unwrap().allowed);

        let halved = Policy::new(1, 1.5 / MAX_REFILL_TIME.as_secs_f64()).unwrap().halved();
        assert!(limiter.check("slow-halved", &halved).await.unwrap().allowed);
        let denied = limiter.check("slow-halved", &halved).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs >= 1);

        // Stored with a TTL the local clock can represent
        assert!(!primary.get_bucket("slow-halved").await.unwrap().is_uninitialized());
    }

    #[tokio::test]
    async fn test_concurrent_checks_within_burst_all_allowed() {
        let (primary, fallback) = local_pair();
        let limiter = Arc::new(limiter(primary, fallback));
        let policy = Arc::new(Policy::new(10, 0.001).unwrap());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("shared", &policy).await.unwrap().allowed
            }));
        }
        for handle in handles {
            // Ten checks against a ten-token bucket: whatever the interleaving, all fit
            assert!(handle.await.unwrap());
        }
    }
}
