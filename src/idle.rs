//! Idle management
//!
//! A periodic scanner stops running dev servers once they have been idle
//! past their effective timeout. The timeout is either a per-project
//! override, the global default, or computed dynamically: slow-to-start
//! servers get longer grace to avoid thrashing, dense recent traffic and
//! open WebSockets stretch it further, and the result is clamped to the
//! configured bounds.

use crate::config::{ConfigSnapshot, ProjectConfig, Settings};
use crate::store::{now_ms, ProjectMetrics, ProjectState, ProjectStatus, StateStore};
use crate::supervisor::Supervisor;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Baseline for the dynamic timeout: 5 minutes
const BASE_TIMEOUT_MS: f64 = 300_000.0;

/// Assumed cold-start cost when none has been measured yet
const DEFAULT_COLD_START_MS: f64 = 5_000.0;

/// `(window_ms, score)` pairs, walked densest-first; the first window
/// holding at least [`ACTIVITY_MIN_HITS`] request timestamps wins
const ACTIVITY_THRESHOLDS: [(i64, f64); 5] = [
    (30_000, 1.0),
    (60_000, 0.8),
    (120_000, 0.6),
    (300_000, 0.4),
    (600_000, 0.2),
];

const ACTIVITY_MIN_HITS: usize = 3;

/// Score recent request density in `{0, 0.2, 0.4, 0.6, 0.8, 1.0}`
pub fn activity_score(history: &[i64], now: i64) -> f64 {
    for (window, score) in ACTIVITY_THRESHOLDS {
        let hits = history.iter().filter(|&&t| t >= now - window).count();
        if hits >= ACTIVITY_MIN_HITS {
            return score;
        }
    }
    0.0
}

/// Dynamically computed idle timeout, clamped to the configured bounds
pub fn dynamic_timeout_ms(
    metrics: &ProjectMetrics,
    ws_connections: i64,
    now: i64,
    settings: &Settings,
) -> u64 {
    let cold = metrics
        .cold_start_time
        .map(|ms| ms as f64)
        .unwrap_or(DEFAULT_COLD_START_MS);
    let cold_factor = cold / DEFAULT_COLD_START_MS;
    let ws_mult = if ws_connections > 0 { 2.0 } else { 1.0 };
    let activity_mult = 0.5 + 0.5 * activity_score(&metrics.request_history, now);

    let raw = BASE_TIMEOUT_MS * cold_factor * ws_mult * activity_mult;
    (raw as u64).clamp(
        settings.min_timeout.as_millis(),
        settings.max_timeout.as_millis(),
    )
}

/// The idle threshold in force for a project right now.
///
/// `None` means the project never auto-stops (`idle_timeout: 0`). Projects
/// that were removed from the config keep getting the settings-derived
/// timeout so they still wind down eventually.
pub fn effective_timeout_ms(
    project: Option<&ProjectConfig>,
    settings: &Settings,
    state: &ProjectState,
    metrics: &ProjectMetrics,
    now: i64,
) -> Option<u64> {
    if let Some(override_ms) = project.and_then(|p| p.idle_timeout) {
        if override_ms.as_millis() == 0 {
            return None;
        }
        return Some(override_ms.as_millis());
    }
    if !settings.dynamic_timeout {
        return Some(settings.idle_timeout.as_millis());
    }
    Some(dynamic_timeout_ms(
        metrics,
        state.websocket_connections,
        now,
        settings,
    ))
}

/// Periodic scanner that winds down idle dev servers
pub struct IdleController {
    store: Arc<StateStore>,
    supervisor: Arc<Supervisor>,
    config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl IdleController {
    pub fn new(
        store: Arc<StateStore>,
        supervisor: Arc<Supervisor>,
        config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            supervisor,
            config_rx,
            shutdown_rx,
        }
    }

    /// Run until shutdown. The scan cadence follows the live config, so a
    /// hot reload of `scan_interval` takes effect on the next tick.
    pub async fn run(mut self) {
        info!("Idle scanner started");

        loop {
            let interval = self.config_rx.borrow().settings.scan_interval.to_duration();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.scan().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Idle scanner shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn scan(&self) {
        let snapshot = self.config_rx.borrow().clone();
        let states = match self.store.all_states() {
            Ok(states) => states,
            Err(e) => {
                warn!(error = %e, "Idle scan could not read states");
                return;
            }
        };
        let now = now_ms();
        let mut to_stop = Vec::new();

        for (name, state) in &states {
            if state.status != ProjectStatus::Running {
                continue;
            }
            let project = snapshot.project(name);
            if project.map(|p| p.disabled).unwrap_or(false) {
                continue;
            }

            // Live WebSockets count as activity; re-stamp instead of stopping.
            if state.websocket_connections > 0 {
                if let Err(e) = self.store.touch(name) {
                    warn!(name = name.as_str(), error = %e, "Failed to re-stamp activity");
                }
                continue;
            }

            // Just started, no traffic yet
            let Some(last_activity) = state.last_activity else {
                continue;
            };

            let metrics = self.store.get_metrics(name).unwrap_or_default();
            let Some(timeout) =
                effective_timeout_ms(project, &snapshot.settings, state, &metrics, now)
            else {
                continue;
            };

            let idle = now - last_activity;
            if idle >= timeout as i64 {
                info!(
                    name = name.as_str(),
                    idle_ms = idle,
                    timeout_ms = timeout,
                    "Idle timeout reached"
                );
                to_stop.push(name.clone());
            }
        }

        for name in to_stop {
            self.supervisor.stop(&name).await;
        }
    }
}
