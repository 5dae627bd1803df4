pub mod config;
pub mod dispatch;
pub mod errors;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod security;
pub mod storage;

// Re-export commonly used types
pub use config::{AppConfig, LimiterConfig, RedisConfig};
pub use dispatch::{Dispatcher, Outcome, RateLimitHeaders, Request};
pub use errors::{AdmitError, Result};
pub use limiter::{Decision, RateLimiter, TokenBucketLimiter};
pub use policy::{Policy, SecurityPolicy};
pub use security::{Authorization, BlockInfo, BypassReason, SecurityGate};
pub use storage::{BucketStore, LocalStore, RedisStore, SecurityStore};
