//! Daemon lifecycle
//!
//! A single [`Daemon`] value owns the state store, port allocator,
//! supervisor, upstream client, and the config channel; every subsystem
//! receives shared references from here. Startup reconciles leftover state
//! from a previous generation before the proxy takes traffic, and shutdown
//! unwinds everything in order with a bounded deadline.

use crate::config::{state_dir, Config, ConfigSnapshot};
use crate::idle::IdleController;
use crate::ports::PortAllocator;
use crate::proxy::ProxyServer;
use crate::store::StateStore;
use crate::supervisor::Supervisor;
use crate::upstream::UpstreamClient;
use anyhow::Context;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Long-lived daemon context owning every subsystem
pub struct Daemon {
    store: Arc<StateStore>,
    allocator: Arc<PortAllocator>,
    supervisor: Arc<Supervisor>,
    upstream: Arc<UpstreamClient>,
    config_tx: watch::Sender<Arc<ConfigSnapshot>>,
    config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    config_path: PathBuf,
    state_dir: PathBuf,
}

impl Daemon {
    /// Build the daemon from a loaded configuration.
    ///
    /// Opens the state store (fatal on failure) and seeds the port
    /// allocator from persisted state.
    pub fn new(config: Config, config_path: PathBuf) -> anyhow::Result<Self> {
        let state_dir = state_dir();
        let store = Arc::new(
            StateStore::open(state_dir.join("state.db")).context("cannot open state store")?,
        );
        let upstream = Arc::new(UpstreamClient::new());
        let allocator = Arc::new(PortAllocator::new());
        allocator.initialize_from_state(&store)?;
        let supervisor = Supervisor::new(
            Arc::clone(&store),
            Arc::clone(&allocator),
            Arc::clone(&upstream),
        );

        let snapshot = Arc::new(ConfigSnapshot::from_config(config));
        let (config_tx, config_rx) = watch::channel(snapshot);

        Ok(Self {
            store,
            allocator,
            supervisor,
            upstream,
            config_tx,
            config_rx,
            config_path,
            state_dir,
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Run until the shutdown channel flips.
    ///
    /// Startup order: reconcile orphans, lock the pid file, bind the proxy,
    /// start the idle scanner and config watcher. Teardown reverses it.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.print_startup_banner();

        let report = self.supervisor.reconcile_orphans_on_startup().await?;
        info!(
            adopted = report.adopted,
            cleaned = report.cleaned,
            "Startup reconciliation done"
        );

        let pid_path = self.state_dir.join("daemon.pid");
        let _pid_file = PidFile::create(&pid_path)?;
        info!(path = %pid_path.display(), "PID file written and locked");

        let proxy_port = self.config_rx.borrow().settings.proxy_port;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), proxy_port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("cannot bind proxy port {}", bind_addr))?;

        let proxy = ProxyServer::new(
            bind_addr,
            Arc::clone(&self.store),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.upstream),
            self.config_rx.clone(),
            shutdown_rx.clone(),
        );
        let proxy_handle = tokio::spawn(async move {
            if let Err(e) = proxy.serve(listener).await {
                warn!(error = %e, "Proxy server error");
            }
        });

        let idle = IdleController::new(
            Arc::clone(&self.store),
            Arc::clone(&self.supervisor),
            self.config_rx.clone(),
            shutdown_rx.clone(),
        );
        let idle_handle = tokio::spawn(idle.run());

        let watcher_handle = crate::watcher::spawn_config_watcher(
            self.config_path.clone(),
            self.config_tx.clone(),
            shutdown_rx.clone(),
        )
        .map_err(|e| {
            warn!(error = %e, "Config watcher could not start; hot reload disabled");
            e
        })
        .ok();

        // Wait for a shutdown signal
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!("Shutting down");

        // Children get a SIGTERM-to-SIGKILL window each, run concurrently;
        // the outer budget scales with the number still alive
        let live = self.supervisor.managed_count() + self.supervisor.orphan_count();
        let budget = Duration::from_secs(5) + Duration::from_secs(1) * (live as u32 + 1);
        if tokio::time::timeout(budget, self.supervisor.stop_all())
            .await
            .is_err()
        {
            warn!(budget_secs = budget.as_secs(), "Shutdown budget exceeded, abandoning children");
        }

        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            let _ = proxy_handle.await;
            let _ = idle_handle.await;
            if let Some(handle) = watcher_handle {
                let _ = handle.await;
            }
        })
        .await;

        if let Err(e) = std::fs::remove_file(&pid_path) {
            warn!(path = %pid_path.display(), error = %e, "Failed to remove PID file");
        }

        info!("Shutdown complete");
        Ok(())
    }

    fn print_startup_banner(&self) {
        let snapshot = self.config_rx.borrow().clone();
        info!(
            name = env!("CARGO_PKG_NAME"),
            version = env!("CARGO_PKG_VERSION"),
            "Starting daemon"
        );
        info!(
            proxy_port = snapshot.settings.proxy_port,
            port_range = ?snapshot.settings.port_range,
            startup_timeout_ms = snapshot.settings.startup_timeout.as_millis(),
            "Proxy configuration"
        );
        info!(
            dynamic_timeout = snapshot.settings.dynamic_timeout,
            idle_timeout_ms = snapshot.settings.idle_timeout.as_millis(),
            min_timeout_ms = snapshot.settings.min_timeout.as_millis(),
            max_timeout_ms = snapshot.settings.max_timeout.as_millis(),
            scan_interval_ms = snapshot.settings.scan_interval.as_millis(),
            "Idle configuration"
        );
        info!(
            project_count = snapshot.projects.len(),
            projects = ?snapshot.projects.keys().collect::<Vec<_>>(),
            "Registered projects"
        );
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
#[derive(Debug)]
pub struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Exclusive non-blocking lock: a second daemon fails fast instead
        // of fighting over children and ports
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
#[derive(Debug)]
pub struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}
