pub mod loader;
pub mod validator;
pub mod watcher;

use crate::policy::{self, Policy, SecurityPolicy};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Redis configuration (environment only). `None` runs local-only.
    pub redis: Option<RedisConfig>,

    /// Limiter configuration (loaded from file, supports hot reload)
    pub limiter: LimiterConfig,
}

/// Redis connection configuration (loaded from environment variables)
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,
}

impl RedisConfig {
    /// Load Redis configuration from environment variables.
    /// Returns `None` when `REDIS_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("REDIS_URL").ok()?;

        Some(Self {
            url,

            max_connections: std::env::var("REDIS_MAX_CONN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),

            connection_timeout_secs: std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),

            command_timeout_secs: std::env::var("REDIS_COMMAND_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
            connection_timeout_secs: 5,
            command_timeout_secs: 2,
        }
    }
}

/// Limiter configuration (loaded from JSON file).
///
/// Handed to the core by value on every call; nothing below dispatch keeps a copy.
#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    /// Prefix for every storage key (e.g. "rl" gives "rl:alice:orders")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Tier assumed when the caller supplies none
    #[serde(default = "default_tier")]
    pub default_tier: String,

    /// Tier name -> policy
    #[serde(default)]
    pub tier_policies: HashMap<String, Policy>,

    /// Policy for tiers missing from `tier_policies`
    pub default_policy: Policy,

    /// Security settings applied to every request
    #[serde(default)]
    pub global_security: SecurityPolicy,

    /// Paths excluded from rate limiting (e.g. "/health")
    #[serde(default)]
    pub skip_paths: Vec<String>,
}

impl LimiterConfig {
    pub fn new(default_policy: Policy) -> Self {
        Self {
            key_prefix: default_key_prefix(),
            default_tier: default_tier(),
            tier_policies: HashMap::new(),
            default_policy,
            global_security: SecurityPolicy::default(),
            skip_paths: vec![],
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>, policy: Policy) -> Self {
        self.tier_policies.insert(tier.into(), policy);
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_global_security(mut self, security: SecurityPolicy) -> Self {
        self.global_security = security;
        self
    }

    pub fn with_skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Policy for `tier`, or the default policy
    pub fn policy_for(&self, tier: &str) -> &Policy {
        policy::resolve(tier, &self.tier_policies, &self.default_policy)
    }

    pub fn is_skipped(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|skip| skip == path)
    }
}

fn default_key_prefix() -> String {
    "rl".to_string()
}

fn default_tier() -> String {
    "free".to_string()
}
