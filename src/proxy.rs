//! Reverse proxy for `*.localhost` traffic
//!
//! Routes by the subdomain in the Host header, cold-starts the target
//! project on demand, and bridges WebSocket upgrades to the dev server.
//! Runs plain HTTP on loopback; there is no TLS in this picture.

use crate::config::ConfigSnapshot;
use crate::error::{text_error_response, ProxyErrorCode};
use crate::store::{ProjectStatus, StateStore};
use crate::supervisor::Supervisor;
use crate::upstream::UpstreamClient;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// How long to keep re-probing a running-but-unresponsive upstream before
/// declaring it unreachable and cold-restarting
const UNREACHABLE_PROBE_BUDGET: Duration = Duration::from_secs(5);

/// Everything a request handler needs, cloned per connection
#[derive(Clone)]
struct RequestContext {
    store: Arc<StateStore>,
    supervisor: Arc<Supervisor>,
    upstream: Arc<UpstreamClient>,
    config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
}

/// The proxy listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: RequestContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        store: Arc<StateStore>,
        supervisor: Arc<Supervisor>,
        upstream: Arc<UpstreamClient>,
        config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            ctx: RequestContext {
                store,
                supervisor,
                upstream,
                config_rx,
            },
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on a listener the caller already bound; lets the
    /// daemon treat a bind failure as fatal before anything else starts
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %self.bind_addr, "Proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: RequestContext,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { handle_request(req, ctx, addr).await }
    });

    // auto::Builder supports both HTTP/1.1 and h2c; HTTP/1.1 connections
    // can still carry WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: RequestContext,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(host) = extract_hostname(&req) else {
        return Ok(text_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };
    let label = subdomain_label(&host);

    let snapshot = ctx.config_rx.borrow().clone();
    let Some(name) = snapshot.routing.resolve(label).map(String::from) else {
        debug!(host = host.as_str(), label, "No project for subdomain");
        return Ok(text_error_response(
            ProxyErrorCode::ProjectUnknown,
            "Project not found",
        ));
    };

    // Forwarded headers are overwritten rather than appended: this proxy is
    // the first trusted hop and clients must not spoof them.
    let original_host = req.headers().get(hyper::header::HOST).cloned();
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Some(host_value) = original_host {
        headers.insert(X_FORWARDED_HOST, host_value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(
        name = name.as_str(),
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
        request_id,
        "Incoming request"
    );

    if is_upgrade_request(&req) {
        return handle_upgrade(req, ctx, snapshot, name, request_id).await;
    }

    // A running project is probed before use; one that stopped answering
    // gets a cold restart rather than an error page.
    let mut port = None;
    if let Ok(Some(state)) = ctx.store.get_state(&name) {
        if state.status == ProjectStatus::Running {
            if let Some(p) = state.port {
                if ctx.upstream.probe_cached(p).await {
                    port = Some(p);
                } else if ctx
                    .upstream
                    .probe_with_backoff(p, UNREACHABLE_PROBE_BUDGET)
                    .await
                {
                    port = Some(p);
                } else {
                    warn!(name = name.as_str(), port = p, "Upstream unreachable, cold restarting");
                    ctx.supervisor.stop(&name).await;
                }
            }
        }
    }

    let port = match port {
        Some(p) => p,
        None => {
            let Some(project) = snapshot.project(&name) else {
                // Removed from config between routing and here
                return Ok(text_error_response(
                    ProxyErrorCode::ProjectUnknown,
                    "Project not found",
                ));
            };
            match ctx
                .supervisor
                .start(&name, project, &snapshot.settings)
                .await
            {
                Ok(outcome) => {
                    debug!(
                        name = name.as_str(),
                        port = outcome.port,
                        cold_start_ms = outcome.cold_start_ms,
                        "Cold start complete"
                    );
                    outcome.port
                }
                Err(e) => {
                    error!(name = name.as_str(), error = %e, "Cold start failed");
                    return Ok(text_error_response(
                        ProxyErrorCode::ProjectStartFailed,
                        e.to_string(),
                    ));
                }
            }
        }
    };

    if let Err(e) = ctx.store.update_activity(&name) {
        warn!(name = name.as_str(), error = %e, "Failed to stamp activity");
    }

    let request_timeout = snapshot.settings.request_timeout.to_duration();
    match tokio::time::timeout(request_timeout, ctx.upstream.send_request(req, port)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            error!(name = name.as_str(), port, error = %e, "Failed to forward request");
            Ok(text_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to dev server",
            ))
        }
        Err(_) => {
            warn!(
                name = name.as_str(),
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(text_error_response(
                ProxyErrorCode::RequestTimeout,
                "Dev server did not respond in time",
            ))
        }
    }
}

fn extract_hostname(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Alphanumeric, hyphen, and dot only; anything else invites log
            // injection through the Host header
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

/// The routing label for a hostname: whatever precedes `.localhost`, or ""
/// for bare `localhost`
fn subdomain_label(host: &str) -> &str {
    if host == "localhost" {
        return "";
    }
    host.strip_suffix(".localhost").unwrap_or(host)
}

/// Check if a request is a WebSocket/HTTP upgrade request
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Build the raw HTTP upgrade request to replay against the dev server
fn build_upgrade_request(req: &Request<Incoming>, port: u16) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: localhost:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the dev server's upgrade response head. Returns the status, the
/// headers, and the offset just past the blank line, so any bytes the
/// server sent eagerly can be replayed to the client.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>, usize)> {
    let header_end = data.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&data[..header_end]).ok()?;
    let mut lines = head.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers, header_end))
}

/// Forward bytes bidirectionally between the upgraded client connection and
/// the dev server
async fn forward_bidirectional(client: Upgraded, mut server: TcpStream, name: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);

    match tokio::io::copy_bidirectional(&mut client_io, &mut server).await {
        Ok((client_to_server, server_to_client)) => {
            debug!(
                name,
                request_id,
                client_to_server,
                server_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(name, request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Handle a WebSocket upgrade: cold-start if needed, replay the handshake
/// against the dev server, and bridge the byte streams.
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: RequestContext,
    snapshot: Arc<ConfigSnapshot>,
    name: String,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    debug!(name = name.as_str(), request_id, "Handling upgrade request");

    // Resolve a port, cold-starting when the project is down
    let running_port = match ctx.store.get_state(&name) {
        Ok(Some(state)) if state.status == ProjectStatus::Running => state.port,
        _ => None,
    };
    let port = match running_port {
        Some(port) => port,
        None => {
            let Some(project) = snapshot.project(&name) else {
                return Ok(text_error_response(
                    ProxyErrorCode::ProjectUnknown,
                    "Project not found",
                ));
            };
            match ctx
                .supervisor
                .start(&name, project, &snapshot.settings)
                .await
            {
                Ok(outcome) => outcome.port,
                Err(e) => {
                    error!(name = name.as_str(), error = %e, "Cold start for upgrade failed");
                    return Ok(text_error_response(
                        ProxyErrorCode::ProjectStartFailed,
                        e.to_string(),
                    ));
                }
            }
        }
    };

    let raw_request = build_upgrade_request(&req, port);

    let mut server_stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(name = name.as_str(), port, error = %e, "Failed to connect for upgrade");
            return Ok(text_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to dev server",
            ));
        }
    };

    if let Err(e) = server_stream.write_all(&raw_request).await {
        error!(name = name.as_str(), error = %e, "Failed to send upgrade request");
        return Ok(text_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to send upgrade request",
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match server_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(name = name.as_str(), "Dev server closed connection before upgrade response");
            return Ok(text_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Dev server closed connection",
            ));
        }
        Err(e) => {
            error!(name = name.as_str(), error = %e, "Failed to read upgrade response");
            return Ok(text_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to read upgrade response",
            ));
        }
    };

    let Some((status, response_headers, header_end)) = parse_upgrade_response(&response_buf[..n])
    else {
        error!(name = name.as_str(), "Invalid upgrade response from dev server");
        return Ok(text_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Invalid upgrade response from dev server",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(name = name.as_str(), status = %status, "Dev server declined upgrade");
        let mut response = Response::builder().status(status);
        for (header, value) in &response_headers {
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(header.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"));
    }

    info!(name = name.as_str(), request_id, port, "WebSocket upgrade successful");

    // The target accepted: this connection now counts against the project
    if let Err(e) = ctx.store.inc_ws(&name) {
        warn!(name = name.as_str(), error = %e, "Failed to count WebSocket connection");
    }

    // 101 back to the client, minus hop-by-hop headers hyper manages
    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (header, value) in &response_headers {
        let lower = header.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(header.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    // Any bytes past the response head were sent eagerly by the server and
    // must reach the client once its side of the upgrade completes
    let leftover = response_buf[header_end..n].to_vec();

    let store = Arc::clone(&ctx.store);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if leftover.is_empty() {
                    forward_bidirectional(upgraded, server_stream, &name, &request_id).await;
                } else {
                    let mut client_io = TokioIo::new(upgraded);
                    if client_io.write_all(&leftover).await.is_ok() {
                        let client = client_io.into_inner();
                        forward_bidirectional(client, server_stream, &name, &request_id).await;
                    }
                }
            }
            Err(e) => {
                error!(name = name.as_str(), error = %e, "Failed to upgrade client connection");
            }
        }
        // Decrement exactly once, whether the bridge ran or the client
        // upgrade failed after the server had already accepted
        if let Err(e) = store.dec_ws(&name) {
            warn!(name = name.as_str(), error = %e, "Failed to release WebSocket count");
        }
        debug!(name = name.as_str(), "WebSocket connection closed");
    });

    Ok(response)
}
