//! Config hot-reload watcher.
//!
//! Watches the fleet TOML file and invokes a callback with the freshly
//! parsed and validated [`FleetConfig`] after a debounce window. Only the
//! analyzer thresholds and matching weights are applied live; everything
//! else takes effect on restart.

use fleet_core::{FleetConfig, FleetError, FleetResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// Dropping the watcher stops the background thread and releases the
/// file-system watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `on_reload` runs on a background thread each time the file changes
    /// and still parses and validates. Invalid files are logged and skipped,
    /// so the running configuration stays in place.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> FleetResult<Self>
    where
        F: Fn(FleetConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = tx.send(());
                    }
                }
            })
            .map_err(|e| FleetError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| FleetError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);
            while rx.recv().is_ok() {
                // Editors write in bursts; wait for the burst to settle.
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Config reload rejected"),
                }
            }
            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

/// Read, parse and validate a config file.
pub fn parse_config(path: &Path) -> FleetResult<FleetConfig> {
    FleetConfig::load(path)
}
