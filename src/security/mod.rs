//! Bypass tokens, IP allow-listing, failed-attempt tracking and progressive blocking.

pub mod bypass;
pub mod ip;

pub use bypass::BypassTokens;
pub use ip::{IpAllowList, IpRule};

use crate::errors::Result;
use crate::metrics;
use crate::policy::SecurityPolicy;
use crate::storage::SecurityStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a failed-attempt counter lives after its last increment
pub const FAILED_ATTEMPT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on any single block
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Added to the block for every failure past the threshold
pub const BLOCK_ESCALATION_STEP: Duration = Duration::from_secs(5 * 60);

/// Advisory slowdown per recorded failure, capped at [`MAX_SLOWDOWN`]
pub const SLOWDOWN_STEP: Duration = Duration::from_secs(5);
pub const MAX_SLOWDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Token,
    Whitelist,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Token => "token",
            BypassReason::Whitelist => "whitelist",
        }
    }
}

/// An active block on a source IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub remaining: Duration,
    pub failed_attempts: u64,
}

impl BlockInfo {
    /// Whole seconds until the block lifts, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.remaining).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Skip rate limiting altogether
    Bypass(BypassReason),

    /// Reject until the block lifts
    Blocked(BlockInfo),

    /// Go on to the bucket check. `slowdown` is advisory only.
    Proceed {
        failed_attempts: u64,
        slowdown: Option<Duration>,
    },
}

/// Advisory slowdown for an IP with `failed_attempts` recorded failures
pub fn slowdown_for(failed_attempts: u64) -> Option<Duration> {
    if failed_attempts == 0 {
        return None;
    }
    let steps = u32::try_from(failed_attempts).unwrap_or(u32::MAX);
    Some(SLOWDOWN_STEP.saturating_mul(steps).min(MAX_SLOWDOWN))
}

/// Block to apply once `failed_attempts` reaches the policy threshold.
///
/// `block_duration + (failed_attempts - max_failed_attempts) * 5min`, capped at 24h.
/// `None` below the threshold, when blocking is disabled, or when the block would be empty.
pub fn block_duration_for(failed_attempts: u64, policy: &SecurityPolicy) -> Option<Duration> {
    let threshold = u64::from(policy.max_failed_attempts);
    if threshold == 0 || failed_attempts < threshold {
        return None;
    }
    let extra = u32::try_from(failed_attempts - threshold).unwrap_or(u32::MAX);
    let duration = policy
        .block_duration
        .saturating_add(BLOCK_ESCALATION_STEP.saturating_mul(extra))
        .min(MAX_BLOCK_DURATION);
    (!duration.is_zero()).then_some(duration)
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}

/// Security checks in front of the token bucket.
///
/// Holds no state of its own: counters and blocks live in the [`SecurityStore`].
/// Store errors are returned as-is; whether to fail open or closed is the caller's call.
pub struct SecurityGate {
    store: Arc<dyn SecurityStore>,
    key_prefix: String,
}

impl SecurityGate {
    pub fn new(store: Arc<dyn SecurityStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn blocked_key(&self, source_ip: &str) -> String {
        format!("{}:blocked:{}", self.key_prefix, source_ip)
    }

    fn failed_key(&self, source_ip: &str) -> String {
        format!("{}:failed:{}", self.key_prefix, source_ip)
    }

    /// Decide whether `source_ip` skips, is blocked, or proceeds to rate limiting.
    pub async fn authorize(
        &self,
        source_ip: &str,
        bypass_token: Option<&str>,
        policy: &SecurityPolicy,
    ) -> Result<Authorization> {
        if let Some(reason) = policy.exemption(source_ip, bypass_token) {
            debug!(source_ip, reason = reason.as_str(), "Rate limit bypassed");
            metrics::record_bypass(reason.as_str());
            return Ok(Authorization::Bypass(reason));
        }

        let failed_key = self.failed_key(source_ip);
        if let Some(remaining) = self.store.block_remaining(&self.blocked_key(source_ip)).await? {
            let failed_attempts = self.store.failed_attempts(&failed_key).await?;
            debug!(source_ip, ?remaining, failed_attempts, "Source IP is blocked");
            return Ok(Authorization::Blocked(BlockInfo {
                remaining,
                failed_attempts,
            }));
        }

        let failed_attempts = self.store.failed_attempts(&failed_key).await?;
        Ok(Authorization::Proceed {
            failed_attempts,
            slowdown: slowdown_for(failed_attempts),
        })
    }

    /// Count a failure for `source_ip` and block it once the policy threshold is reached.
    /// Returns the block applied by this call, if any.
    pub async fn record_failure(
        &self,
        source_ip: &str,
        policy: &SecurityPolicy,
    ) -> Result<Option<Duration>> {
        let failed_attempts = self
            .store
            .record_failed_attempt(&self.failed_key(source_ip), FAILED_ATTEMPT_RETENTION)
            .await?;

        let Some(block) = block_duration_for(failed_attempts, policy) else {
            debug!(source_ip, failed_attempts, "Recorded failed attempt");
            return Ok(None);
        };

        self.store.set_block(&self.blocked_key(source_ip), block).await?;
        metrics::record_ip_block();
        warn!(
            source_ip,
            ?block,
            failed_attempts,
            "IP blocked due to repeated failed attempts"
        );
        Ok(Some(block))
    }
}
