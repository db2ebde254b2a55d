//! Config hot-reload watcher.
//!
//! Watches `cadre.toml` and invokes a callback with the freshly parsed
//! [`CadreConfig`] after a debounce window. Only the `[[agents]]` section is
//! applied at runtime; engine settings need a restart.

use crate::config::{parse_config, CadreConfig};
use cadre_core::{CadreError, CadreResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

/// Watches a config file and calls back on every debounced change.
///
/// Dropping the watcher releases the file-system watch, which also ends the
/// background thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// The parent directory is watched so that editors that replace the file
    /// on save are still noticed. `on_reload` runs on a background thread;
    /// parse errors are logged and skip the callback.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> CadreResult<Self>
    where
        F: Fn(CadreConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();
        let file_name = config_path.file_name().map(ToOwned::to_owned);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == file_name.as_deref());
                    if relevant {
                        let _ = tx.send(());
                    }
                }
            })
            .map_err(|e| CadreError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(watch_root(&config_path), RecursiveMode::NonRecursive)
            .map_err(|e| CadreError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = Duration::from_millis(debounce_ms);
            let mut last_reload = Instant::now();

            while rx.recv().is_ok() {
                // one reload per burst of writes
                while rx.try_recv().is_ok() {}

                let since = last_reload.elapsed();
                if since < debounce {
                    std::thread::sleep(debounce - since);
                }
                last_reload = Instant::now();

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

fn watch_root(config_path: &Path) -> &Path {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
