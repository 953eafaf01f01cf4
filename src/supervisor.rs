//! Process supervision for dev servers
//!
//! Owns every child the daemon spawns plus the pids it adopted from a
//! previous generation. Children are started through a shell with the
//! allocated port in the environment, health-gated before traffic is
//! routed to them, and stopped with SIGTERM-then-SIGKILL escalation.

use crate::config::{ProjectConfig, Settings};
use crate::error::StartError;
use crate::ports::PortAllocator;
use crate::store::{now_ms, LogStream, ProjectStatus, StatePatch, StateStore};
use crate::upstream::UpstreamClient;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use libc::{SIGKILL, SIGTERM};
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Cadence of health probes during the startup gate
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Cadence of liveness polls while waiting for a signalled process to exit
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a process gets between SIGTERM and SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How long to wait after SIGKILL before giving up on the pid
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Result of a successful start
#[derive(Debug, Clone, Copy)]
pub struct StartOutcome {
    pub port: u16,
    /// Zero when the project was already running
    pub cold_start_ms: u64,
}

/// What startup reconciliation did with leftover state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live processes from a previous generation now tracked by pid
    pub adopted: usize,
    /// Stale rows reset to stopped (dead pids, interrupted starts)
    pub cleaned: usize,
}

/// A child this daemon spawned, with its log-pumping tasks
struct ManagedChild {
    child: Child,
    pumps: Vec<JoinHandle<()>>,
}

/// Manages dev-server processes for all projects
pub struct Supervisor {
    store: Arc<StateStore>,
    allocator: Arc<PortAllocator>,
    upstream: Arc<UpstreamClient>,
    /// Children spawned by this daemon generation, keyed by project name
    children: DashMap<String, ManagedChild>,
    /// Live pids adopted from a previous generation; no handle, no logs
    orphans: DashMap<String, u32>,
    /// Per-project locks making concurrent starts idempotent
    start_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Supervisor {
    pub fn new(
        store: Arc<StateStore>,
        allocator: Arc<PortAllocator>,
        upstream: Arc<UpstreamClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            allocator,
            upstream,
            children: DashMap::new(),
            orphans: DashMap::new(),
            start_locks: DashMap::new(),
        })
    }

    fn start_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.start_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Start a project's dev server and wait until it answers a health probe.
    ///
    /// Idempotent: if the project is already running with a live process the
    /// existing port is returned with `cold_start_ms == 0`. Concurrent calls
    /// for the same name serialize on a per-project lock, so exactly one
    /// child is spawned.
    pub async fn start(
        &self,
        name: &str,
        config: &ProjectConfig,
        settings: &Settings,
    ) -> Result<StartOutcome, StartError> {
        let lock = self.start_lock(name);
        let _guard = lock.lock().await;

        // Re-check under the lock: a concurrent start may have finished.
        if let Ok(Some(state)) = self.store.get_state(name) {
            if state.status == ProjectStatus::Running {
                if let (Some(port), Some(pid)) = (state.port, state.pid) {
                    if is_alive(pid) {
                        debug!(name, port, pid, "Dev server already running");
                        return Ok(StartOutcome {
                            port,
                            cold_start_ms: 0,
                        });
                    }
                }
            }
            if let Some(port) = state.port {
                self.allocator.release(port);
            }
        }
        self.orphans.remove(name);

        let cwd = config.working_dir();
        if !cwd.is_dir() {
            return Err(StartError::SpawnFailed(format!(
                "working directory {} does not exist",
                cwd.display()
            )));
        }

        let port = self.allocator.find_available(settings)?;
        if let Err(e) = self.store.set_state(
            name,
            StatePatch::new()
                .status(ProjectStatus::Starting)
                .port(Some(port))
                .pid(None)
                .started_at(now_ms()),
        ) {
            self.allocator.release(port);
            return Err(StartError::SpawnFailed(format!("state store: {}", e)));
        }

        info!(name, port, cmd = %config.start_cmd, "Starting dev server");
        let started = Instant::now();

        let mut child = match self.spawn_child(config, settings, port) {
            Ok(child) => child,
            Err(e) => {
                self.fail_start(name, port);
                return Err(StartError::SpawnFailed(e.to_string()));
            }
        };
        let pid = child.id();
        let pumps = self.spawn_log_pumps(name, &mut child);

        // Health gate: the child owns the port once it answers any response
        // below 500. A child that exits first fails fast.
        let timeout = settings.startup_timeout.to_duration();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.fail_start(name, port);
                    await_pumps(pumps).await;
                    return Err(StartError::SpawnFailed(format!(
                        "process exited during startup ({})",
                        status
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(name, error = %e, "Failed to poll child during startup");
                }
            }

            if self.upstream.probe(port).await {
                break;
            }

            if started.elapsed() >= timeout {
                warn!(name, port, timeout_ms = timeout.as_millis() as u64, "Startup timeout exceeded");
                let _ = child.start_kill();
                let _ = child.wait().await;
                self.fail_start(name, port);
                await_pumps(pumps).await;
                return Err(StartError::StartTimeout(timeout));
            }

            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }

        // A measured cold start is never zero; zero is reserved for the
        // already-running fast path
        let cold_start_ms = (started.elapsed().as_millis() as u64).max(1);
        self.children
            .insert(name.to_string(), ManagedChild { child, pumps });

        if let Err(e) = self.store.set_cold_start_time(name, cold_start_ms) {
            warn!(name, error = %e, "Failed to record cold start time");
        }
        if let Err(e) = self.store.set_state(
            name,
            StatePatch::new()
                .status(ProjectStatus::Running)
                .pid(pid)
                .last_activity(Some(now_ms())),
        ) {
            warn!(name, error = %e, "Failed to persist running state");
        }

        info!(name, port, pid, cold_start_ms, "Dev server is healthy");
        Ok(StartOutcome {
            port,
            cold_start_ms,
        })
    }

    /// Reset state after a failed start attempt
    fn fail_start(&self, name: &str, port: u16) {
        self.allocator.release(port);
        self.upstream.forget(port);
        if let Err(e) = self.store.set_state(
            name,
            StatePatch::new()
                .status(ProjectStatus::Stopped)
                .port(None)
                .pid(None)
                .last_activity(None),
        ) {
            warn!(name, error = %e, "Failed to persist stopped state");
        }
    }

    fn spawn_child(
        &self,
        config: &ProjectConfig,
        settings: &Settings,
        port: u16,
    ) -> std::io::Result<Child> {
        let mut cmd = Command::new(&settings.shell);
        cmd.arg("-c")
            .arg(&config.start_cmd)
            .current_dir(config.working_dir())
            .env("PORT", port.to_string())
            .env("HOST", "0.0.0.0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn()
    }

    fn spawn_log_pumps(&self, name: &str, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(
                Arc::clone(&self.store),
                name.to_string(),
                LogStream::Out,
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(
                Arc::clone(&self.store),
                name.to_string(),
                LogStream::Err,
                stderr,
            ));
        }
        pumps
    }

    /// Stop a project's dev server with graceful escalation.
    ///
    /// No-op unless the project is running. Managed children are reaped via
    /// `wait`; adopted orphans and recorded pids are signalled and polled.
    pub async fn stop(&self, name: &str) {
        let state = match self.store.get_state(name) {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                warn!(name, error = %e, "Failed to read state for stop");
                return;
            }
        };
        if state.status != ProjectStatus::Running {
            return;
        }

        let managed = self.children.remove(name).map(|(_, child)| child);
        let orphan_pid = self.orphans.remove(name).map(|(_, pid)| pid);

        if let Some(mut managed) = managed {
            if let Some(pid) = managed.child.id() {
                info!(name, pid, "Sending SIGTERM to dev server");
                send_signal(pid, SIGTERM);
            }
            match tokio::time::timeout(TERM_GRACE, managed.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(name, %status, "Dev server exited gracefully");
                }
                Ok(Err(e)) => {
                    warn!(name, error = %e, "Error waiting for dev server to exit");
                }
                Err(_) => {
                    warn!(
                        name,
                        grace_secs = TERM_GRACE.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    let _ = managed.child.kill().await;
                }
            }
            await_pumps(managed.pumps).await;
        } else if let Some(pid) = orphan_pid.or(state.pid) {
            terminate_pid(name, pid).await;
        }

        if let Some(port) = state.port {
            self.allocator.release(port);
            self.upstream.forget(port);
        }
        if let Err(e) = self.store.set_state(
            name,
            StatePatch::new()
                .status(ProjectStatus::Stopped)
                .port(None)
                .pid(None)
                .last_activity(None),
        ) {
            warn!(name, error = %e, "Failed to persist stopped state");
        }
        info!(name, "Project stopped");
    }

    /// Stop everything: managed children concurrently, then adopted orphans
    pub async fn stop_all(&self) {
        let managed: Vec<String> = self.children.iter().map(|e| e.key().clone()).collect();
        if !managed.is_empty() {
            info!(count = managed.len(), "Stopping managed dev servers");
            futures::future::join_all(managed.iter().map(|name| self.stop(name))).await;
        }

        let orphans: Vec<String> = self.orphans.iter().map(|e| e.key().clone()).collect();
        if !orphans.is_empty() {
            info!(count = orphans.len(), "Stopping adopted dev servers");
            futures::future::join_all(orphans.iter().map(|name| self.stop(name))).await;
        }
    }

    /// Reconcile persisted state against live processes after a restart.
    ///
    /// Interrupted starts are cleaned up; running processes with a usable
    /// port are adopted (their logs cannot be re-attached); everything else
    /// is reset to stopped.
    pub async fn reconcile_orphans_on_startup(&self) -> anyhow::Result<ReconcileReport> {
        let states = self.store.all_states()?;
        let mut report = ReconcileReport::default();

        for (name, state) in states {
            match state.status {
                ProjectStatus::Stopped => continue,
                ProjectStatus::Starting => {
                    if let Some(pid) = state.pid {
                        if is_alive(pid) {
                            terminate_pid(&name, pid).await;
                        }
                    }
                    if let Some(port) = state.port {
                        self.allocator.release(port);
                    }
                    self.mark_reconciled_stopped(&name);
                    report.cleaned += 1;
                    info!(name = name.as_str(), "Cleaned up interrupted start");
                }
                ProjectStatus::Running => {
                    let alive = state.pid.map(is_alive).unwrap_or(false);
                    match (alive, state.port) {
                        (true, Some(port)) => {
                            let pid = state.pid.expect("alive implies pid");
                            self.orphans.insert(name.clone(), pid);
                            self.allocator.mark_used(port);
                            // Connections from the previous generation died
                            // with it; only the process survives.
                            if let Err(e) = self.store.set_state(
                                &name,
                                StatePatch::new().websocket_connections(0),
                            ) {
                                warn!(name = name.as_str(), error = %e, "Failed to reset ws count");
                            }
                            report.adopted += 1;
                            info!(name = name.as_str(), pid, port, "Adopted orphaned dev server");
                        }
                        (true, None) => {
                            let pid = state.pid.expect("alive implies pid");
                            warn!(name = name.as_str(), pid, "Orphan has no usable port, killing");
                            terminate_pid(&name, pid).await;
                            self.mark_reconciled_stopped(&name);
                            report.cleaned += 1;
                        }
                        (false, _) => {
                            if let Some(port) = state.port {
                                self.allocator.release(port);
                            }
                            self.mark_reconciled_stopped(&name);
                            report.cleaned += 1;
                            debug!(name = name.as_str(), "Cleared state for dead process");
                        }
                    }
                }
            }
        }

        info!(
            adopted = report.adopted,
            cleaned = report.cleaned,
            "Orphan reconciliation complete"
        );
        Ok(report)
    }

    fn mark_reconciled_stopped(&self, name: &str) {
        if let Err(e) = self.store.set_state(
            name,
            StatePatch::new()
                .status(ProjectStatus::Stopped)
                .port(None)
                .pid(None)
                .last_activity(None)
                .websocket_connections(0),
        ) {
            warn!(name, error = %e, "Failed to persist reconciled state");
        }
    }

    /// Whether any project is currently tracked as an adopted orphan
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Number of live children this generation spawned
    pub fn managed_count(&self) -> usize {
        self.children.len()
    }
}

fn spawn_pump<R>(
    store: Arc<StateStore>,
    name: String,
    stream: LogStream,
    reader: R,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                // next_line strips the newline; a trailing \r remains on
                // CRLF output and is trimmed here. The final unterminated
                // line, if any, arrives before EOF.
                Ok(Some(line)) => {
                    let line = line.trim_end_matches('\r');
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = store.add_log(&name, stream, line) {
                        debug!(name = name.as_str(), error = %e, "Dropped log line");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(name = name.as_str(), error = %e, "Log pump read error");
                    break;
                }
            }
        }
    })
}

/// Wait briefly for log pumps to drain their final lines
async fn await_pumps(pumps: Vec<JoinHandle<()>>) {
    for pump in pumps {
        let _ = tokio::time::timeout(Duration::from_secs(1), pump).await;
    }
}

/// Signal-0 liveness probe
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) {}

/// SIGTERM, poll for exit, escalate to SIGKILL
async fn terminate_pid(name: &str, pid: u32) {
    info!(name, pid, "Sending SIGTERM to dev server");
    send_signal(pid, SIGTERM);
    if wait_for_exit(pid, TERM_GRACE).await {
        return;
    }

    warn!(name, pid, "Grace period exceeded, sending SIGKILL");
    send_signal(pid, SIGKILL);
    if !wait_for_exit(pid, KILL_GRACE).await {
        error!(name, pid, "Process survived SIGKILL");
    }
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    !is_alive(pid)
}
