//! Configuration hot reload
//!
//! Watches the config file and republishes a fresh [`ConfigSnapshot`] over a
//! watch channel whenever it parses and validates. A broken edit keeps the
//! previous snapshot in force. The proxy listener is never re-bound; only
//! routing, settings, and the idle scanner pick up changes.

use crate::config::{Config, ConfigSnapshot};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Editors fire bursts of events per save; coalesce them before reloading
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Spawn the watcher task. Returns its join handle; the task exits when the
/// shutdown channel flips or the filesystem watch dies.
pub fn spawn_config_watcher(
    path: PathBuf,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let watcher = build_watcher(&path, event_tx)?;

    let handle = tokio::spawn(async move {
        // The watcher stops when dropped; keep it alive for the task's life
        let _watcher = watcher;
        info!(path = %path.display(), "Config watcher started");

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    if event.is_none() {
                        warn!("Config watch channel closed");
                        break;
                    }
                    tokio::time::sleep(DEBOUNCE).await;
                    while event_rx.try_recv().is_ok() {}

                    match Config::load(&path) {
                        Ok(config) => {
                            let snapshot = Arc::new(ConfigSnapshot::from_config(config));
                            info!(
                                projects = snapshot.projects.len(),
                                labels = snapshot.routing.len(),
                                "Configuration reloaded"
                            );
                            let _ = tx.send(snapshot);
                        }
                        Err(e) => {
                            warn!(error = %e, "Config reload failed, keeping previous configuration");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        }
    });

    Ok(handle)
}

/// Watch the config file's parent directory.
///
/// Editors typically write-and-rename, which would orphan a watch on the
/// file itself; watching the directory and filtering by file name survives
/// replacement.
fn build_watcher(
    config_path: &Path,
    tx: mpsc::UnboundedSender<()>,
) -> anyhow::Result<RecommendedWatcher> {
    let parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let file_name = config_path.file_name().map(|n| n.to_os_string());

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            use notify::event::EventKind;
            let interested = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            );
            let ours = match &file_name {
                Some(name) => event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(name.as_os_str())),
                None => true,
            };
            if interested && ours {
                let _ = tx.send(());
            }
        }
    })?;
    watcher.watch(&parent, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
