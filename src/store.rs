//! SQLite-backed state store
//!
//! Durable runtime state for projects (status, port, pid, activity), their
//! metrics (cold start cost, recent request history), and a bounded log
//! buffer per project. The database is the source of truth across daemon
//! restarts; orphan reconciliation reads it before anything else runs.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Most recent request timestamps kept per project
const REQUEST_HISTORY_LEN: usize = 20;

/// Log rows kept per project
const LOG_RETENTION: usize = 1000;

/// How many inserts may pass between log-pruning sweeps. The prune keeps
/// `LOG_RETENTION - PRUNE_INTERVAL` rows so the count never exceeds
/// `LOG_RETENTION` in between.
const PRUNE_INTERVAL: u32 = 32;

/// Current time as epoch milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Lifecycle status of a project's dev server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectStatus {
    /// No process is running
    #[default]
    Stopped,
    /// A port is reserved and the child is being health-gated
    Starting,
    /// The child answered a health probe and is serving traffic
    Running,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "starting" => ProjectStatus::Starting,
            "running" => ProjectStatus::Running,
            _ => ProjectStatus::Stopped,
        }
    }
}

/// Persisted runtime state of one project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectState {
    pub status: ProjectStatus,
    /// Child's listen port while starting or running
    pub port: Option<u16>,
    /// OS process id while running
    pub pid: Option<u32>,
    /// Epoch-ms of the last proxied request, None when never active
    pub last_activity: Option<i64>,
    /// Epoch-ms of the most recent spawn attempt
    pub started_at: Option<i64>,
    /// Count of client-facing upgraded WebSocket connections
    pub websocket_connections: i64,
}

/// Persisted metrics for one project
#[derive(Debug, Clone, Default)]
pub struct ProjectMetrics {
    /// Duration of the most recent successful cold start, in ms
    pub cold_start_time: Option<u64>,
    /// Up to 20 most recent request timestamps, epoch-ms ascending
    pub request_history: Vec<i64>,
}

/// Which output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Out,
    Err,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Out => "out",
            LogStream::Err => "err",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "err" {
            LogStream::Err
        } else {
            LogStream::Out
        }
    }
}

/// One captured log line
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub name: String,
    pub stream: LogStream,
    pub timestamp: i64,
    pub message: String,
}

/// Partial update for a project's state row; unset fields keep their value
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    status: Option<ProjectStatus>,
    port: Option<Option<u16>>,
    pid: Option<Option<u32>>,
    last_activity: Option<Option<i64>>,
    started_at: Option<Option<i64>>,
    websocket_connections: Option<i64>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ProjectStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn last_activity(mut self, at: Option<i64>) -> Self {
        self.last_activity = Some(at);
        self
    }

    pub fn started_at(mut self, at: i64) -> Self {
        self.started_at = Some(Some(at));
        self
    }

    pub fn websocket_connections(mut self, count: i64) -> Self {
        self.websocket_connections = Some(count);
        self
    }

    fn apply(self, mut state: ProjectState) -> ProjectState {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(port) = self.port {
            state.port = port;
        }
        if let Some(pid) = self.pid {
            state.pid = pid;
        }
        if let Some(at) = self.last_activity {
            state.last_activity = at;
        }
        if let Some(at) = self.started_at {
            state.started_at = at;
        }
        if let Some(count) = self.websocket_connections {
            state.websocket_connections = count;
        }
        state
    }
}

/// State store handle with thread-safe access
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    /// Per-project insert counters driving the periodic log prune
    log_counts: Mutex<HashMap<String, u32>>,
}

impl StateStore {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open state database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            log_counts: Mutex::new(HashMap::new()),
        };
        store.run_migrations()?;

        info!("State store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            log_counts: Mutex::new(HashMap::new()),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );
            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                name TEXT PRIMARY KEY,
                port INTEGER,
                pid INTEGER,
                status TEXT NOT NULL DEFAULT 'stopped',
                last_activity INTEGER,
                started_at INTEGER,
                websocket_connections INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS metrics (
                name TEXT PRIMARY KEY,
                cold_start_time INTEGER,
                request_history TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                stream TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_logs_name ON logs(name);
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    // ==================== Project state ====================

    fn read_state(conn: &Connection, name: &str) -> Result<Option<ProjectState>> {
        conn.query_row(
            "SELECT status, port, pid, last_activity, started_at, websocket_connections
             FROM projects WHERE name = ?1",
            params![name],
            |row| {
                let status: String = row.get(0)?;
                Ok(ProjectState {
                    status: ProjectStatus::parse(&status),
                    port: row.get::<_, Option<u16>>(1)?,
                    pid: row.get::<_, Option<u32>>(2)?,
                    last_activity: row.get(3)?,
                    started_at: row.get(4)?,
                    websocket_connections: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to read project state")
    }

    /// Get the persisted state for a project
    pub fn get_state(&self, name: &str) -> Result<Option<ProjectState>> {
        let conn = self.conn.lock().unwrap();
        Self::read_state(&conn, name)
    }

    /// Upsert the state row; fields absent from the patch are preserved
    pub fn set_state(&self, name: &str, patch: StatePatch) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let merged = patch.apply(Self::read_state(&conn, name)?.unwrap_or_default());
        conn.execute(
            "INSERT OR REPLACE INTO projects
                (name, port, pid, status, last_activity, started_at, websocket_connections)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                merged.port,
                merged.pid,
                merged.status.as_str(),
                merged.last_activity,
                merged.started_at,
                merged.websocket_connections,
            ],
        )?;
        Ok(())
    }

    /// All persisted project states
    pub fn all_states(&self) -> Result<HashMap<String, ProjectState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, status, port, pid, last_activity, started_at, websocket_connections
             FROM projects",
        )?;

        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let status: String = row.get(1)?;
            Ok((
                name,
                ProjectState {
                    status: ProjectStatus::parse(&status),
                    port: row.get(2)?,
                    pid: row.get(3)?,
                    last_activity: row.get(4)?,
                    started_at: row.get(5)?,
                    websocket_connections: row.get(6)?,
                },
            ))
        })?;

        let mut states = HashMap::new();
        for row in rows {
            let (name, state) = row?;
            states.insert(name, state);
        }
        Ok(states)
    }

    /// Stamp `last_activity` and append to the request history, trimming the
    /// history to the most recent 20 entries. History persistence is
    /// unconditional. Retried once on failure.
    pub fn update_activity(&self, name: &str) -> Result<()> {
        self.retry_once(|| self.update_activity_inner(name))
    }

    fn update_activity_inner(&self, name: &str) -> Result<()> {
        let now = now_ms();
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO projects (name, status, last_activity) VALUES (?1, 'stopped', ?2)
             ON CONFLICT(name) DO UPDATE SET last_activity = ?2",
            params![name, now],
        )?;

        let history: Option<String> = conn
            .query_row(
                "SELECT request_history FROM metrics WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        let mut history: Vec<i64> = history
            .as_deref()
            .map(|raw| serde_json::from_str(raw).unwrap_or_default())
            .unwrap_or_default();
        history.push(now);
        if history.len() > REQUEST_HISTORY_LEN {
            history.drain(..history.len() - REQUEST_HISTORY_LEN);
        }
        let encoded = serde_json::to_string(&history)?;

        conn.execute(
            "INSERT INTO metrics (name, request_history) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET request_history = ?2",
            params![name, encoded],
        )?;
        Ok(())
    }

    /// Stamp `last_activity` without touching the request history; used by
    /// the idle scanner to keep WebSocket-holding projects alive.
    pub fn touch(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE projects SET last_activity = ?2 WHERE name = ?1",
            params![name, now_ms()],
        )?;
        Ok(())
    }

    /// Atomically increment the WebSocket connection count and stamp activity
    pub fn inc_ws(&self, name: &str) -> Result<()> {
        self.bump_ws(name, 1)
    }

    /// Atomically decrement the WebSocket connection count (floored at zero)
    /// and stamp activity
    pub fn dec_ws(&self, name: &str) -> Result<()> {
        self.bump_ws(name, -1)
    }

    fn bump_ws(&self, name: &str, delta: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO projects (name, status) VALUES (?1, 'stopped')
             ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        conn.execute(
            "UPDATE projects
             SET websocket_connections = MAX(0, websocket_connections + ?2),
                 last_activity = ?3
             WHERE name = ?1",
            params![name, delta, now_ms()],
        )?;
        Ok(())
    }

    // ==================== Metrics ====================

    /// Metrics for a project; defaults when no row exists
    pub fn get_metrics(&self, name: &str) -> Result<ProjectMetrics> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT cold_start_time, request_history FROM metrics WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, Option<u64>>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                },
            )
            .optional()?;

        Ok(match row {
            Some((cold_start_time, raw)) => ProjectMetrics {
                cold_start_time,
                request_history: serde_json::from_str(&raw).unwrap_or_default(),
            },
            None => ProjectMetrics::default(),
        })
    }

    /// Record the duration of a successful cold start
    pub fn set_cold_start_time(&self, name: &str, ms: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metrics (name, cold_start_time) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET cold_start_time = ?2",
            params![name, ms],
        )?;
        Ok(())
    }

    // ==================== Logs ====================

    /// Insert one log line. Pruning runs periodically rather than per write;
    /// the retained window never exceeds 1,000 rows per project. Retried
    /// once on failure.
    pub fn add_log(&self, name: &str, stream: LogStream, message: &str) -> Result<()> {
        self.retry_once(|| self.add_log_inner(name, stream, message))
    }

    fn add_log_inner(&self, name: &str, stream: LogStream, message: &str) -> Result<()> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO logs (name, stream, timestamp, message) VALUES (?1, ?2, ?3, ?4)",
                params![name, stream.as_str(), now_ms(), message],
            )?;
        }

        let due = {
            let mut counts = self.log_counts.lock().unwrap();
            // Counters start at the threshold so the first write after open
            // prunes whatever a previous daemon generation left behind.
            let count = counts.entry(name.to_string()).or_insert(PRUNE_INTERVAL);
            *count += 1;
            if *count >= PRUNE_INTERVAL {
                *count = 0;
                true
            } else {
                false
            }
        };

        if due {
            self.prune_logs(name)?;
        }
        Ok(())
    }

    /// Delete everything but the newest rows for a project, leaving headroom
    /// so the count stays under the retention limit until the next sweep.
    fn prune_logs(&self, name: &str) -> Result<()> {
        let keep = LOG_RETENTION - PRUNE_INTERVAL as usize;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM logs WHERE name = ?1 AND id <= COALESCE(
                (SELECT id FROM logs WHERE name = ?1
                 ORDER BY id DESC LIMIT 1 OFFSET ?2), 0)",
            params![name, keep],
        )?;
        Ok(())
    }

    /// Last `limit` log lines in chronological order
    pub fn recent_logs(&self, name: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, stream, timestamp, message FROM logs
             WHERE name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let mut entries = stmt
            .query_map(params![name, limit], Self::map_log_row)?
            .collect::<Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    /// All log lines newer than `since` (epoch-ms), chronological
    pub fn logs_since(&self, name: &str, since: i64) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, stream, timestamp, message FROM logs
             WHERE name = ?1 AND timestamp > ?2 ORDER BY id ASC",
        )?;

        let entries = stmt
            .query_map(params![name, since], Self::map_log_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn map_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
        let stream: String = row.get(2)?;
        Ok(LogEntry {
            id: row.get(0)?,
            name: row.get(1)?,
            stream: LogStream::parse(&stream),
            timestamp: row.get(3)?,
            message: row.get(4)?,
        })
    }

    // ==================== Cleanup ====================

    /// Remove the state and metrics rows for a project
    pub fn delete_project(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM projects WHERE name = ?1", params![name])?;
        conn.execute("DELETE FROM metrics WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn retry_once<T>(&self, op: impl Fn() -> Result<T>) -> Result<T> {
        match op() {
            Ok(value) => Ok(value),
            Err(first) => {
                debug!(error = %first, "Store write failed, retrying once");
                op()
            }
        }
    }
}
