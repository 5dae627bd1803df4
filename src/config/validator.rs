use crate::config::{AppConfig, LimiterConfig, RedisConfig};
use crate::errors::{AdmitError, Result};
use crate::policy::{Policy, SecurityPolicy};
use tracing::{debug, warn};

/// Validate the entire application configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    debug!("Validating configuration...");

    if let Some(redis) = &config.redis {
        validate_redis_config(redis)?;
    }

    validate_limiter_config(&config.limiter)?;

    debug!("Configuration validation successful");
    Ok(())
}

/// Validate Redis configuration
fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(AdmitError::ConfigurationInvalid(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(AdmitError::ConfigurationInvalid(format!(
            "Invalid Redis URL format: {}. Must start with redis:// or rediss://",
            config.url
        )));
    }

    if config.max_connections == 0 {
        return Err(AdmitError::ConfigurationInvalid(
            "max_connections must be greater than 0".to_string(),
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "max_connections is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connection_timeout_secs == 0 {
        return Err(AdmitError::ConfigurationInvalid(
            "connection_timeout_secs must be greater than 0".to_string(),
        ));
    }

    if config.command_timeout_secs == 0 {
        return Err(AdmitError::ConfigurationInvalid(
            "command_timeout_secs must be greater than 0".to_string(),
        ));
    }

    debug!("Redis configuration valid");
    Ok(())
}

/// Validate limiter configuration.
///
/// Rate and burst are already guaranteed positive by the policy types; this
/// covers the cross-field rules and the key layout.
pub fn validate_limiter_config(config: &LimiterConfig) -> Result<()> {
    if config.key_prefix.is_empty() {
        return Err(AdmitError::ConfigurationInvalid(
            "key_prefix cannot be empty".to_string(),
        ));
    }

    if config.key_prefix.chars().any(char::is_whitespace) {
        return Err(AdmitError::ConfigurationInvalid(format!(
            "key_prefix '{}' must not contain whitespace",
            config.key_prefix
        )));
    }

    if config.default_tier.is_empty() {
        return Err(AdmitError::ConfigurationInvalid(
            "default_tier cannot be empty".to_string(),
        ));
    }

    for (tier, policy) in &config.tier_policies {
        if tier.is_empty() || tier.contains(':') {
            return Err(AdmitError::ConfigurationInvalid(format!(
                "Tier name '{}' must be non-empty and must not contain ':'",
                tier
            )));
        }
        validate_policy(tier, policy);
    }

    validate_policy("default", &config.default_policy);
    validate_security("global", &config.global_security);

    for path in &config.skip_paths {
        if !path.starts_with('/') {
            return Err(AdmitError::ConfigurationInvalid(format!(
                "skip path '{}' must start with '/'",
                path
            )));
        }
    }

    debug!(
        "Limiter configuration valid ({} tiers)",
        config.tier_policies.len()
    );
    Ok(())
}

/// Warn about legal but suspicious policy values
fn validate_policy(tier: &str, policy: &Policy) {
    if policy.rate() > 1_000_000.0 {
        warn!(
            "Very high tokens_per_second ({}) for tier '{}'",
            policy.rate(),
            tier
        );
    }

    let seconds_to_fill = policy.refill_time().as_secs_f64();
    if seconds_to_fill > 86400.0 {
        warn!(
            "Burst capacity for tier '{}' is very large relative to refill rate (takes {:.2} hours to fill)",
            tier,
            seconds_to_fill / 3600.0
        );
    }

    if policy.security.require_authentication && policy.burst_capacity.get() == 1 {
        warn!(
            "Tier '{}' requires authentication with a burst of 1; unauthenticated callers keep a burst of 1",
            tier
        );
    }

    validate_security(tier, &policy.security);
}

fn validate_security(scope: &str, security: &SecurityPolicy) {
    if security.max_failed_attempts > 0 && security.block_duration.is_zero() {
        warn!(
            "Security policy '{}' blocks after {} failures but block_duration_secs is 0; the first block is empty",
            scope, security.max_failed_attempts
        );
    }
}
