//! Integration tests for lazydev
//!
//! The proxy is exercised over raw TCP against an ephemeral listener, with
//! mock upstreams running inside the test process. Where a real child
//! process is needed, `sleep` stands in for a dev server.

use lazydev::config::{Config, ConfigSnapshot};
use lazydev::idle::IdleController;
use lazydev::ports::PortAllocator;
use lazydev::proxy::ProxyServer;
use lazydev::store::{now_ms, ProjectStatus, StatePatch, StateStore};
use lazydev::supervisor::Supervisor;
use lazydev::upstream::UpstreamClient;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// A daemon wired together by hand on an ephemeral proxy port
struct TestDaemon {
    store: Arc<StateStore>,
    allocator: Arc<PortAllocator>,
    supervisor: Arc<Supervisor>,
    proxy_port: u16,
    _config_tx: watch::Sender<Arc<ConfigSnapshot>>,
    shutdown_tx: watch::Sender<bool>,
}

async fn start_test_daemon(yaml: &str) -> TestDaemon {
    let config: Config = serde_yaml::from_str(yaml).expect("test config parses");
    config.validate().expect("test config is valid");

    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let allocator = Arc::new(PortAllocator::new());
    let upstream = Arc::new(UpstreamClient::new());
    let supervisor = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&allocator),
        Arc::clone(&upstream),
    );

    let (config_tx, config_rx) = watch::channel(Arc::new(ConfigSnapshot::from_config(config)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let proxy = ProxyServer::new(
        addr,
        Arc::clone(&store),
        Arc::clone(&supervisor),
        Arc::clone(&upstream),
        config_rx,
        shutdown_rx,
    );
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });

    TestDaemon {
        store,
        allocator,
        supervisor,
        proxy_port: addr.port(),
        _config_tx: config_tx,
        shutdown_tx,
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Send a GET with a custom Host header and collect the whole response
async fn http_get_with_host(port: u16, path: &str, host: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

/// Minimal HTTP upstream answering 200 to everything; captures raw requests
async fn spawn_mock_upstream() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let captured = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let captured = Arc::clone(&captured);
            tokio::spawn(async move {
                let mut data = Vec::new();
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            data.extend_from_slice(&buf[..n]);
                            if data.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                captured
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&data).to_string());

                let body = b"hello from upstream";
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(body).await;
            });
        }
    });

    (port, requests)
}

/// Upstream that accepts a WebSocket-style upgrade and echoes raw bytes
async fn spawn_mock_ws_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                // Read the upgrade request head
                let mut data = Vec::new();
                let mut buf = vec![0u8; 8192];
                let mut head_end = None;
                while head_end.is_none() {
                    match stream.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => {
                            data.extend_from_slice(&buf[..n]);
                            head_end = data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
                        }
                        Err(_) => return,
                    }
                }

                let response = "HTTP/1.1 101 Switching Protocols\r\n\
                                Upgrade: websocket\r\n\
                                Connection: Upgrade\r\n\r\n";
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }

                // Echo anything that arrived with the head, then the stream
                let leftover = data[head_end.unwrap()..].to_vec();
                if !leftover.is_empty() && stream.write_all(&leftover).await.is_err() {
                    return;
                }
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

/// Spawn a long-lived process and reap it in the background so liveness
/// probes observe its death
fn spawn_disowned_sleep() -> u32 {
    let mut child = std::process::Command::new("sleep").arg("60").spawn().unwrap();
    let pid = child.id();
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    pid
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

const BASIC_CONFIG: &str = r#"
settings:
  port_range: [44000, 44010]
  startup_timeout: 3s
projects:
  alpha:
    name: alpha
    cwd: /tmp
    start_cmd: sleep 60
    aliases: [a]
"#;

#[tokio::test]
async fn test_unknown_subdomain_returns_404() {
    let daemon = start_test_daemon(BASIC_CONFIG).await;

    let response = http_get_with_host(daemon.proxy_port, "/", "ghost.localhost").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("X-Proxy-Error: PROJECT_UNKNOWN") || response.contains("x-proxy-error: PROJECT_UNKNOWN"));
    assert!(response.ends_with("Project not found"));

    // No state row appears for an unknown project
    assert!(daemon.store.get_state("ghost").unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_host_returns_400() {
    let daemon = start_test_daemon(BASIC_CONFIG).await;

    let response = http_get_with_host(daemon.proxy_port, "/", "bad_host!").await;
    assert!(response.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn test_failing_start_command_returns_503() {
    let config = r#"
settings:
  port_range: [44020, 44030]
  startup_timeout: 3s
projects:
  alpha:
    name: alpha
    cwd: /tmp
    start_cmd: exit 7
"#;
    let daemon = start_test_daemon(config).await;

    let response = http_get_with_host(daemon.proxy_port, "/", "alpha.localhost").await;
    assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);

    // The failed start leaves nothing behind
    let state = daemon.store.get_state("alpha").unwrap().unwrap();
    assert_eq!(state.status, ProjectStatus::Stopped);
    assert_eq!(state.port, None);
    for port in 44020..=44030 {
        assert!(!daemon.allocator.is_reserved(port));
    }
}

#[tokio::test]
async fn test_request_is_proxied_to_running_project() {
    let daemon = start_test_daemon(BASIC_CONFIG).await;
    let (upstream_port, requests) = spawn_mock_upstream().await;

    // A dev server this test owns, presented as already running
    daemon.allocator.mark_used(upstream_port);
    daemon
        .store
        .set_state(
            "alpha",
            StatePatch::new()
                .status(ProjectStatus::Running)
                .port(Some(upstream_port))
                .pid(Some(std::process::id())),
        )
        .unwrap();

    let response = http_get_with_host(daemon.proxy_port, "/some/path?x=1", "alpha.localhost").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.ends_with("hello from upstream"));

    // The upstream saw the rewritten Host plus forwarding headers
    let captured = requests.lock().unwrap().join("\n").to_lowercase();
    assert!(captured.contains("get /some/path?x=1 http/1.1"));
    assert!(captured.contains(&format!("host: localhost:{}", upstream_port)));
    assert!(captured.contains("x-forwarded-host: alpha.localhost"));
    assert!(captured.contains("x-forwarded-proto: http"));
    assert!(captured.contains("x-request-id:"));

    // Activity was stamped and recorded in the request history
    let state = daemon.store.get_state("alpha").unwrap().unwrap();
    assert!(state.last_activity.is_some());
    let metrics = daemon.store.get_metrics("alpha").unwrap();
    assert_eq!(metrics.request_history.len(), 1);
}

#[tokio::test]
async fn test_alias_routes_to_same_project() {
    let daemon = start_test_daemon(BASIC_CONFIG).await;
    let (upstream_port, _requests) = spawn_mock_upstream().await;

    daemon.allocator.mark_used(upstream_port);
    daemon
        .store
        .set_state(
            "alpha",
            StatePatch::new()
                .status(ProjectStatus::Running)
                .port(Some(upstream_port))
                .pid(Some(std::process::id())),
        )
        .unwrap();

    let response = http_get_with_host(daemon.proxy_port, "/", "a.localhost").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // Alias traffic lands on the canonical project's state
    let metrics = daemon.store.get_metrics("alpha").unwrap();
    assert_eq!(metrics.request_history.len(), 1);
    assert!(daemon.store.get_state("a").unwrap().is_none());
}

#[tokio::test]
async fn test_websocket_upgrade_counts_connections() {
    let daemon = start_test_daemon(BASIC_CONFIG).await;
    let ws_port = spawn_mock_ws_upstream().await;

    daemon.allocator.mark_used(ws_port);
    daemon
        .store
        .set_state(
            "alpha",
            StatePatch::new()
                .status(ProjectStatus::Running)
                .port(Some(ws_port))
                .pid(Some(std::process::id())),
        )
        .unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", daemon.proxy_port))
        .await
        .unwrap();
    let upgrade = "GET /ws HTTP/1.1\r\n\
                   Host: alpha.localhost\r\n\
                   Connection: Upgrade\r\n\
                   Upgrade: websocket\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(upgrade.as_bytes()).await.unwrap();

    // Read the 101 response head
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before upgrade response");
        head.extend_from_slice(&buf[..n]);
    }
    let head_text = String::from_utf8_lossy(&head);
    assert!(head_text.starts_with("HTTP/1.1 101"), "got: {}", head_text);

    // The open socket is tracked against the project
    let store = Arc::clone(&daemon.store);
    assert!(
        wait_until(Duration::from_secs(2), || {
            store
                .get_state("alpha")
                .ok()
                .flatten()
                .map(|s| s.websocket_connections == 1)
                .unwrap_or(false)
        })
        .await
    );

    // Bytes pass through both ways
    stream.write_all(b"ping-over-bridge").await.unwrap();
    let mut echo = [0u8; 16];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping-over-bridge");

    // Closing the client releases the count
    drop(stream);
    let store = Arc::clone(&daemon.store);
    assert!(
        wait_until(Duration::from_secs(2), || {
            store
                .get_state("alpha")
                .ok()
                .flatten()
                .map(|s| s.websocket_connections == 0)
                .unwrap_or(false)
        })
        .await
    );
}

#[tokio::test]
async fn test_idle_scanner_stops_idle_project() {
    let config = r#"
settings:
  port_range: [44040, 44050]
  dynamic_timeout: false
  idle_timeout: 1s
  scan_interval: 300ms
projects:
  alpha:
    name: alpha
    cwd: /tmp
    start_cmd: sleep 60
"#;
    let parsed: Config = serde_yaml::from_str(config).unwrap();
    parsed.validate().unwrap();

    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let allocator = Arc::new(PortAllocator::new());
    let upstream = Arc::new(UpstreamClient::new());
    let supervisor = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&allocator),
        Arc::clone(&upstream),
    );

    // A project that went quiet two seconds ago
    let pid = spawn_disowned_sleep();
    allocator.mark_used(44044);
    store
        .set_state(
            "alpha",
            StatePatch::new()
                .status(ProjectStatus::Running)
                .port(Some(44044))
                .pid(Some(pid))
                .last_activity(Some(now_ms() - 2_000)),
        )
        .unwrap();

    let (_config_tx, config_rx) = watch::channel(Arc::new(ConfigSnapshot::from_config(parsed)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = IdleController::new(
        Arc::clone(&store),
        Arc::clone(&supervisor),
        config_rx,
        shutdown_rx,
    );
    tokio::spawn(controller.run());

    let check_store = Arc::clone(&store);
    assert!(
        wait_until(Duration::from_secs(5), || {
            check_store
                .get_state("alpha")
                .ok()
                .flatten()
                .map(|s| s.status == ProjectStatus::Stopped)
                .unwrap_or(false)
        })
        .await,
        "idle project was never stopped"
    );
    assert!(!allocator.is_reserved(44044));

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_disabled_project_is_never_stopped() {
    let config = r#"
settings:
  port_range: [44060, 44070]
  dynamic_timeout: false
  idle_timeout: 500ms
  scan_interval: 200ms
projects:
  alpha:
    name: alpha
    cwd: /tmp
    start_cmd: sleep 60
    disabled: true
"#;
    let parsed: Config = serde_yaml::from_str(config).unwrap();

    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let allocator = Arc::new(PortAllocator::new());
    let upstream = Arc::new(UpstreamClient::new());
    let supervisor = Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&allocator),
        Arc::clone(&upstream),
    );

    let pid = spawn_disowned_sleep();
    store
        .set_state(
            "alpha",
            StatePatch::new()
                .status(ProjectStatus::Running)
                .port(Some(44064))
                .pid(Some(pid))
                .last_activity(Some(now_ms() - 60_000)),
        )
        .unwrap();

    let (_config_tx, config_rx) = watch::channel(Arc::new(ConfigSnapshot::from_config(parsed)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = IdleController::new(
        Arc::clone(&store),
        Arc::clone(&supervisor),
        config_rx,
        shutdown_rx,
    );
    tokio::spawn(controller.run());

    // Several scan cycles pass without touching it
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let state = store.get_state("alpha").unwrap().unwrap();
    assert_eq!(state.status, ProjectStatus::Running);

    let _ = shutdown_tx.send(true);
    supervisor.stop("alpha").await;
}

#[tokio::test]
async fn test_orphan_adoption_end_to_end() {
    let daemon = start_test_daemon(BASIC_CONFIG).await;
    let (upstream_port, _requests) = spawn_mock_upstream().await;

    // State left behind by a "previous generation": a live pid serving a port
    daemon
        .store
        .set_state(
            "alpha",
            StatePatch::new()
                .status(ProjectStatus::Running)
                .port(Some(upstream_port))
                .pid(Some(std::process::id())),
        )
        .unwrap();

    let report = daemon.supervisor.reconcile_orphans_on_startup().await.unwrap();
    assert_eq!(report.adopted, 1);
    assert_eq!(report.cleaned, 0);
    assert!(daemon.allocator.is_reserved(upstream_port));

    // Requests are proxied straight to the adopted server
    let response = http_get_with_host(daemon.proxy_port, "/", "alpha.localhost").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
}

#[tokio::test]
async fn test_removed_project_keeps_running_but_routes_404() {
    let daemon = start_test_daemon(BASIC_CONFIG).await;
    let (upstream_port, _requests) = spawn_mock_upstream().await;

    let pid = spawn_disowned_sleep();
    daemon.allocator.mark_used(upstream_port);
    daemon
        .store
        .set_state(
            "alpha",
            StatePatch::new()
                .status(ProjectStatus::Running)
                .port(Some(upstream_port))
                .pid(Some(pid)),
        )
        .unwrap();

    // Hot reload drops the project entirely
    let empty: Config = serde_yaml::from_str("projects: {}\n").unwrap();
    daemon
        ._config_tx
        .send(Arc::new(ConfigSnapshot::from_config(empty)))
        .unwrap();

    let response = http_get_with_host(daemon.proxy_port, "/", "alpha.localhost").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);

    // The instance itself was not stopped by the reload
    let state = daemon.store.get_state("alpha").unwrap().unwrap();
    assert_eq!(state.status, ProjectStatus::Running);
    assert!(lazydev::supervisor::is_alive(pid));

    daemon.supervisor.stop("alpha").await;
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let store = StateStore::open(&path).unwrap();
        store
            .set_state(
                "alpha",
                StatePatch::new()
                    .status(ProjectStatus::Running)
                    .port(Some(4123))
                    .pid(Some(4242)),
            )
            .unwrap();
        store.set_cold_start_time("alpha", 1800).unwrap();
    }

    let store = StateStore::open(&path).unwrap();
    let state = store.get_state("alpha").unwrap().unwrap();
    assert_eq!(state.status, ProjectStatus::Running);
    assert_eq!(state.port, Some(4123));
    assert_eq!(state.pid, Some(4242));
    assert_eq!(store.get_metrics("alpha").unwrap().cold_start_time, Some(1800));
}

#[test]
fn test_allocator_seeds_from_reopened_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");

    {
        let store = StateStore::open(&path).unwrap();
        store
            .set_state(
                "alpha",
                StatePatch::new().status(ProjectStatus::Running).port(Some(44090)),
            )
            .unwrap();
    }

    let store = StateStore::open(&path).unwrap();
    let allocator = PortAllocator::new();
    allocator.initialize_from_state(&store).unwrap();
    assert!(allocator.is_reserved(44090));
}
