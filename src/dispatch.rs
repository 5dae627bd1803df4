//! Per-request admission: identity and tier resolution, bucket keys, and the
//! ordering of security checks before the token bucket.
//!
//! Transport is not handled here. Callers extract a [`Request`] from whatever
//! protocol they speak and turn the [`Outcome`] into a status code and headers.

use crate::config::LimiterConfig;
use crate::errors::Result;
use crate::limiter::{Decision, RateLimiter};
use crate::metrics;
use crate::policy::Policy;
use crate::security::{Authorization, BlockInfo, BypassReason, SecurityGate};
use crate::storage::SecurityStore;
use arc_swap::ArcSwap;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// What the transport layer knows about an incoming request.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    /// Raw request path, matched against skip paths
    pub path: &'a str,
    /// Route pattern the request matched (e.g. "/api/orders/:id"), used for the bucket key
    pub route: &'a str,
    pub source_ip: &'a str,
    /// Authenticated identity, if any
    pub user_id: Option<&'a str>,
    pub tier: Option<&'a str>,
    pub bypass_token: Option<&'a str>,
    /// Upgrade to a WebSocket / streaming channel
    pub websocket: bool,
}

impl<'a> Request<'a> {
    pub fn new(path: &'a str, source_ip: &'a str) -> Self {
        Self {
            path,
            route: path,
            source_ip,
            user_id: None,
            tier: None,
            bypass_token: None,
            websocket: false,
        }
    }

    pub fn route(mut self, route: &'a str) -> Self {
        self.route = route;
        self
    }

    pub fn user(mut self, user_id: &'a str) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn tier(mut self, tier: &'a str) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn bypass_token(mut self, token: &'a str) -> Self {
        self.bypass_token = Some(token);
        self
    }

    pub fn websocket(mut self) -> Self {
        self.websocket = true;
        self
    }
}

/// Values for the `X-RateLimit-*` response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_secs: u64,
}

impl RateLimitHeaders {
    fn new(policy: &Policy, decision: &Decision) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            limit: if policy.max_requests > 0 {
                policy.max_requests
            } else {
                policy.burst_capacity.get()
            },
            remaining: decision.remaining,
            reset_epoch_secs: now + decision.retry_after_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Path excluded from rate limiting
    Skipped,

    /// Exempt via bypass token or whitelist
    Bypassed(BypassReason),

    /// Source IP is blocked after repeated failures
    Blocked(BlockInfo),

    /// Tier does not allow WebSocket connections
    WebSocketForbidden { tier: String },

    Allowed {
        tier: String,
        headers: RateLimitHeaders,
        /// Advisory delay for IPs with recorded failures
        slowdown: Option<Duration>,
    },

    Limited {
        tier: String,
        retry_after_secs: u64,
        headers: RateLimitHeaders,
    },
}

impl Outcome {
    /// Whether the request may go on to the handler
    pub fn is_admitted(&self) -> bool {
        matches!(
            self,
            Outcome::Skipped | Outcome::Bypassed(_) | Outcome::Allowed { .. }
        )
    }

    /// Seconds for a `Retry-After` header, when the request was turned away for a while
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Outcome::Blocked(info) => Some(info.retry_after_secs()),
            Outcome::Limited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Route to key segment: "/api/v1/orders/" becomes "api_v1_orders"
pub fn endpoint_slug(route: &str) -> String {
    route.trim_matches('/').replace('/', "_")
}

/// `{prefix}:{identifier}:{endpoint}`, with `:ws` appended for streaming channels
pub fn bucket_key(prefix: &str, identifier: &str, endpoint: &str, websocket: bool) -> String {
    if websocket {
        format!("{}:{}:{}:ws", prefix, identifier, endpoint)
    } else {
        format!("{}:{}:{}", prefix, identifier, endpoint)
    }
}

fn is_auth_endpoint(endpoint: &str) -> bool {
    endpoint.contains("auth") || endpoint.contains("login")
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Runs every request through the security gate and the rate limiter.
///
/// The limiter configuration sits behind an [`ArcSwap`] so it can be hot-reloaded;
/// each request works from one snapshot and passes it explicitly into the core.
pub struct Dispatcher<L: RateLimiter> {
    limiter: Arc<L>,
    security_store: Arc<dyn SecurityStore>,
    config: Arc<ArcSwap<LimiterConfig>>,
}

impl<L: RateLimiter> Dispatcher<L> {
    pub fn new(
        limiter: Arc<L>,
        security_store: Arc<dyn SecurityStore>,
        config: Arc<ArcSwap<LimiterConfig>>,
    ) -> Self {
        Self {
            limiter,
            security_store,
            config,
        }
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<LimiterConfig> {
        self.config.load_full()
    }

    /// Decide what happens to `request`.
    ///
    /// Storage errors from the security checks or from a failed bucket read are
    /// returned; the caller picks whether that means allow or deny.
    pub async fn evaluate(&self, request: &Request<'_>) -> Result<Outcome> {
        let config = self.config.load_full();

        if config.is_skipped(request.path) {
            return Ok(Outcome::Skipped);
        }

        let gate = SecurityGate::new(self.security_store.clone(), config.key_prefix.as_str());

        let slowdown = match gate
            .authorize(request.source_ip, request.bypass_token, &config.global_security)
            .await?
        {
            Authorization::Bypass(reason) => return Ok(Outcome::Bypassed(reason)),
            Authorization::Blocked(info) => return Ok(Outcome::Blocked(info)),
            Authorization::Proceed { slowdown, .. } => slowdown,
        };

        let tier = request
            .tier
            .filter(|tier| !tier.is_empty())
            .unwrap_or(config.default_tier.as_str());
        let policy = config.policy_for(tier);

        // Tier-level exemptions add to the global ones
        if let Some(reason) = policy
            .security
            .exemption(request.source_ip, request.bypass_token)
        {
            metrics::record_bypass(reason.as_str());
            return Ok(Outcome::Bypassed(reason));
        }

        if request.websocket && !policy.web_socket_allowed {
            debug!(tier, "WebSocket upgrade rejected for tier");
            return Ok(Outcome::WebSocketForbidden {
                tier: tier.to_string(),
            });
        }

        let (identifier, authenticated) = match request.user_id.filter(|id| !id.is_empty()) {
            Some(user_id) => (user_id, true),
            None => (request.source_ip, false),
        };

        let endpoint = endpoint_slug(request.route);
        let key = bucket_key(&config.key_prefix, identifier, &endpoint, request.websocket);

        // Copy-on-read: the shared policy is never modified
        let effective: Cow<'_, Policy> = if policy.security.require_authentication && !authenticated {
            Cow::Owned(policy.halved())
        } else {
            Cow::Borrowed(policy)
        };

        let decision = self.limiter.check(&key, &effective).await?;
        let headers = RateLimitHeaders::new(&effective, &decision);

        if decision.allowed {
            return Ok(Outcome::Allowed {
                tier: tier.to_string(),
                headers,
                slowdown,
            });
        }

        if is_auth_endpoint(&endpoint) {
            if let Err(e) = gate
                .record_failure(request.source_ip, &config.global_security)
                .await
            {
                warn!(source_ip = request.source_ip, error = %e, "Error recording failed attempt");
            }
        }

        let retry_after_secs = decision
            .retry_after_secs
            .max(slowdown.map(ceil_secs).unwrap_or(0));

        debug!(key = key.as_str(), tier, retry_after_secs, "Rate limit exceeded");
        Ok(Outcome::Limited {
            tier: tier.to_string(),
            retry_after_secs,
            headers,
        })
    }
}
