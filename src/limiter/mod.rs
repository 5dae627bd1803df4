pub mod token_bucket;

pub use token_bucket::TokenBucketLimiter;

use crate::errors::Result;
use crate::policy::Policy;
use async_trait::async_trait;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is allowed
    pub allowed: bool,

    /// Seconds to wait before retrying; 0 when allowed, at least 1 when denied
    pub retry_after_secs: u64,

    /// Whole tokens left in the bucket after this check
    pub remaining: u32,
}

impl Decision {
    pub fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            remaining,
        }
    }

    pub fn deny(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs,
            remaining: 0,
        }
    }
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check if a request against `key` is allowed under `policy`, consuming a token if so.
    /// `key` is opaque to the limiter.
    async fn check(&self, key: &str, policy: &Policy) -> Result<Decision>;
}
