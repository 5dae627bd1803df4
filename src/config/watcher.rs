//! Notify-based configuration hot-reload watcher.
//!
//! - Watches a single JSON file using notify::RecommendedWatcher.
//! - On create/modify events, reloads and validates the limiter config and
//!   atomically swaps it in. Requests already holding the old snapshot finish with it.

use crate::config::LimiterConfig;
use crate::config::loader::load_limiter_config_from_file;
use crate::errors::AdmitError;
use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watch the limiter configuration file and swap in each valid new version.
///
/// Runs until the watcher's event channel closes. An invalid file is logged and
/// the current configuration stays in place.
pub async fn watch_config_file(
    path: PathBuf,
    shared_config: Arc<ArcSwap<LimiterConfig>>,
) -> Result<(), notify::Error> {
    // Bridges the watcher's sync callback thread to this task
    let (tx, mut rx) = mpsc::channel(16);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                // Receiver dropped: the watching task has ended
                debug!("Failed to send config file event: {}", e);
            }
        },
        notify::Config::default(),
    )?;

    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!("Watching config file for changes: {}", path.display());

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                if should_reload(&event) {
                    info!(
                        "Config file change detected. Event: {:?}. Triggering reload.",
                        event.kind
                    );
                    reload_config(&path, &shared_config).await;
                } else {
                    debug!("Ignoring irrelevant filesystem event: {:?}", event.kind);
                }
            }
            Err(e) => {
                crate::metrics::record_config_reload(false);
                error!("Error watching config file: {}", e);
            }
        }
    }

    warn!("Configuration watcher task is shutting down.");
    Ok(())
}

fn should_reload(event: &Event) -> bool {
    matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    )
}

/// Reload the file and swap it in. Returns whether the swap happened.
pub(crate) async fn reload_config(path: &Path, shared_config: &Arc<ArcSwap<LimiterConfig>>) -> bool {
    let new_config = match load_limiter_config_from_file(path).await {
        Ok(config) => config,
        Err(e) => {
            crate::metrics::record_config_reload(false);
            match e {
                AdmitError::FileSystem(io_err) => error!(
                    "Failed to read config file '{}': {}. Keeping old config.",
                    path.display(),
                    io_err
                ),
                AdmitError::Json(json_err) => error!(
                    "Failed to parse JSON from '{}': {}. Keeping old config.",
                    path.display(),
                    json_err
                ),
                other => error!(
                    "New configuration in '{}' is invalid: {}. Keeping old config.",
                    path.display(),
                    other
                ),
            }
            return false;
        }
    };

    shared_config.store(Arc::new(new_config));
    crate::metrics::record_config_reload(true);
    info!("Configuration hot-reloaded successfully.");
    true
}
