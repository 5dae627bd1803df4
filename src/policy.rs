//! Rate limiting and security parameters.
//!
//! Policies are plain values. A [`Policy`] can only be built with a positive
//! refill rate and a non-zero burst, so the bucket math never divides by zero.

use crate::errors::{AdmitError, Result};
use crate::security::{BypassReason, BypassTokens, IpAllowList};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;

/// Steady-state refill rate in tokens per second. Always finite and positive.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Deserialize)]
#[serde(try_from = "f64")]
pub struct TokensPerSecond(f64);

impl TokensPerSecond {
    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for TokensPerSecond {
    type Error = AdmitError;

    fn try_from(value: f64) -> Result<Self> {
        if !value.is_finite() || value <= 0.0 {
            return Err(AdmitError::ConfigurationInvalid(format!(
                "tokens_per_second must be positive (got {})",
                value
            )));
        }
        Ok(Self(value))
    }
}

/// Maximum bucket size. Always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u32")]
pub struct BurstCapacity(u32);

impl BurstCapacity {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for BurstCapacity {
    type Error = AdmitError;

    fn try_from(value: u32) -> Result<Self> {
        if value == 0 {
            return Err(AdmitError::ConfigurationInvalid(
                "burst_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(Self(value))
    }
}

/// Longest time an empty bucket may take to refill, and so the longest bucket TTL.
pub const MAX_REFILL_TIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Security settings, applied globally and optionally per tier.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Secrets that skip rate limiting entirely
    pub bypass_tokens: BypassTokens,

    /// Addresses and CIDR networks exempt from rate limiting
    pub whitelist_ips: IpAllowList,

    /// Halve the bucket for callers identified only by IP
    pub require_authentication: bool,

    /// Failed attempts before an IP gets blocked. 0 disables blocking.
    pub max_failed_attempts: u32,

    /// Block length at the threshold; each further failure adds five minutes
    #[serde(rename = "block_duration_secs", deserialize_with = "duration_from_secs")]
    pub block_duration: Duration,
}

impl SecurityPolicy {
    /// Stateless exemption check: bypass token first, then the whitelist.
    pub fn exemption(&self, source_ip: &str, bypass_token: Option<&str>) -> Option<BypassReason> {
        if bypass_token.is_some_and(|token| self.bypass_tokens.matches(token)) {
            return Some(BypassReason::Token);
        }
        if self.whitelist_ips.contains(source_ip) {
            return Some(BypassReason::Whitelist);
        }
        None
    }
}

/// Rate limiting parameters for one tier.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "PolicyFields")]
pub struct Policy {
    /// Advertised request limit; informational, the bucket does the limiting
    pub max_requests: u32,

    /// Window `max_requests` refers to
    pub window: Duration,

    pub burst_capacity: BurstCapacity,

    pub tokens_per_second: TokensPerSecond,

    pub web_socket_allowed: bool,

    pub security: SecurityPolicy,
}

/// Wire shape of a [`Policy`]; converted through the cross-field checks.
#[derive(Deserialize)]
struct PolicyFields {
    #[serde(default)]
    max_requests: u32,

    #[serde(rename = "window_secs", default, deserialize_with = "duration_from_secs")]
    window: Duration,

    burst_capacity: BurstCapacity,

    tokens_per_second: TokensPerSecond,

    #[serde(default)]
    web_socket_allowed: bool,

    #[serde(default)]
    security: SecurityPolicy,
}

impl TryFrom<PolicyFields> for Policy {
    type Error = AdmitError;

    fn try_from(fields: PolicyFields) -> Result<Self> {
        check_refill_time(fields.burst_capacity, fields.tokens_per_second)?;
        Ok(Self {
            max_requests: fields.max_requests,
            window: fields.window,
            burst_capacity: fields.burst_capacity,
            tokens_per_second: fields.tokens_per_second,
            web_socket_allowed: fields.web_socket_allowed,
            security: fields.security,
        })
    }
}

/// Rejects policies whose bucket would take longer than [`MAX_REFILL_TIME`] to fill.
fn check_refill_time(burst: BurstCapacity, rate: TokensPerSecond) -> Result<()> {
    let seconds = f64::from(burst.get()) / rate.get();
    if !(seconds <= MAX_REFILL_TIME.as_secs_f64()) {
        return Err(AdmitError::ConfigurationInvalid(format!(
            "burst_capacity {} at {} tokens/sec takes longer than {} days to refill",
            burst.get(),
            rate.get(),
            MAX_REFILL_TIME.as_secs() / 86_400
        )));
    }
    Ok(())
}

impl Policy {
    /// Build a policy, rejecting a zero burst, a non-positive rate, or a refill
    /// time beyond [`MAX_REFILL_TIME`].
    pub fn new(burst_capacity: u32, tokens_per_second: f64) -> Result<Self> {
        let burst_capacity = BurstCapacity::try_from(burst_capacity)?;
        let tokens_per_second = TokensPerSecond::try_from(tokens_per_second)?;
        check_refill_time(burst_capacity, tokens_per_second)?;
        Ok(Self {
            max_requests: burst_capacity.get(),
            window: Duration::ZERO,
            burst_capacity,
            tokens_per_second,
            web_socket_allowed: false,
            security: SecurityPolicy::default(),
        })
    }

    pub fn with_max_requests(mut self, max_requests: u32, window: Duration) -> Self {
        self.max_requests = max_requests;
        self.window = window;
        self
    }

    pub fn with_web_socket(mut self, allowed: bool) -> Self {
        self.web_socket_allowed = allowed;
        self
    }

    pub fn with_security(mut self, security: SecurityPolicy) -> Self {
        self.security = security;
        self
    }

    pub fn burst(&self) -> f64 {
        f64::from(self.burst_capacity.get())
    }

    pub fn rate(&self) -> f64 {
        self.tokens_per_second.get()
    }

    /// Time for an empty bucket to refill completely; used as the storage TTL.
    /// Never more than [`MAX_REFILL_TIME`].
    pub fn refill_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.burst() / self.rate())
            .map_or(MAX_REFILL_TIME, |refill| refill.min(MAX_REFILL_TIME))
    }

    /// Copy with rate and burst halved, for callers without an authenticated identity.
    /// Burst stays at least 1 and rate stays positive, so the copy is still usable;
    /// its refill time is clamped by [`Policy::refill_time`].
    pub fn halved(&self) -> Policy {
        let mut halved = self.clone();
        halved.tokens_per_second = TokensPerSecond((self.rate() * 0.5).max(f64::MIN_POSITIVE));
        halved.burst_capacity = BurstCapacity((self.burst_capacity.get() / 2).max(1));
        halved
    }
}

/// Pick the policy for `tier`, falling back to `default_policy`.
pub fn resolve<'a>(
    tier: &str,
    tier_policies: &'a HashMap<String, Policy>,
    default_policy: &'a Policy,
) -> &'a Policy {
    tier_policies.get(tier).unwrap_or(default_policy)
}

fn duration_from_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}
