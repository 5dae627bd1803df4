//! Preflight check: load and validate the configuration, then make sure the
//! configured stores answer before a service relies on them.

use admitr::config::loader::load_config;
use admitr::storage::pool::{create_redis_pool, get_pool_stats};
use admitr::{AdmitError, BucketStore, LocalStore, RedisStore};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "admitr=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match preflight().await {
        Ok(()) => {
            tracing::info!("Preflight passed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Preflight failed");
            ExitCode::FAILURE
        }
    }
}

async fn preflight() -> Result<(), AdmitError> {
    let config = load_config().await?;

    let local = Arc::new(LocalStore::new());
    let primary: Arc<dyn BucketStore> = match &config.redis {
        Some(redis_config) => {
            let pool = create_redis_pool(redis_config).await?;
            let stats = get_pool_stats(&pool);
            tracing::info!(
                size = stats.size,
                available = stats.available,
                max_size = stats.max_size,
                "Redis pool ready"
            );

            let store = RedisStore::new(pool, redis_config.command_timeout());
            store.health_check().await?;
            Arc::new(store)
        }
        None => local.clone(),
    };

    tracing::info!(
        primary = primary.name(),
        fallback = local.name(),
        tiers = config.limiter.tier_policies.len(),
        "Storage configured"
    );
    Ok(())
}
