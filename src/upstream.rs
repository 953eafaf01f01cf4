//! Pooled HTTP client for talking to dev servers
//!
//! One client forwards proxied requests, a second `Empty`-bodied client
//! performs health probes so probe traffic shares pooled connections
//! without mixing body types. Probe results are cached briefly per port:
//! bursty asset loads would otherwise trigger probe storms that make some
//! frameworks reset connections.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a probe verdict stays valid for a given port
const PROBE_CACHE_TTL: Duration = Duration::from_secs(2);

/// Per-attempt probe timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Error type for upstream requests
#[derive(Debug)]
pub enum UpstreamError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building the rewritten request
    RequestBuild(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "upstream error: {}", e),
            UpstreamError::RequestBuild(s) => write!(f, "request build error: {}", s),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<hyper_util::client::legacy::Error> for UpstreamError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        UpstreamError::Client(err)
    }
}

struct ProbeVerdict {
    healthy: bool,
    at: Instant,
}

/// Shared client for proxy forwarding and health probes
pub struct UpstreamClient {
    client: Client<HttpConnector, Incoming>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    probe_cache: Mutex<HashMap<u16, ProbeVerdict>>,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self {
            client,
            probe_client,
            probe_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Forward a request to the dev server on `port`.
    ///
    /// The URI is rewritten to `http://localhost:<port><path?query>` and the
    /// Host header replaced to match; everything else passes through. The
    /// client never follows redirects, so 3xx responses reach the browser
    /// untouched.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://localhost:{}{}", port, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }
        let host = HeaderValue::from_str(&format!("localhost:{}", port))
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;
        builder = builder.header(hyper::header::HOST, host);

        let upstream_req = builder
            .body(body)
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Probe `http://localhost:<port>/` once.
    ///
    /// Healthy means the transport succeeded and the status is below 500;
    /// a 404 from a dev server that lacks a root route still counts.
    pub async fn probe(&self, port: u16) -> bool {
        let uri = format!("http://localhost:{}/", port);
        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        let healthy = match tokio::time::timeout(PROBE_TIMEOUT, self.probe_client.request(req)).await
        {
            Ok(Ok(response)) => response.status().as_u16() < 500,
            Ok(Err(_)) | Err(_) => false,
        };

        self.probe_cache.lock().insert(
            port,
            ProbeVerdict {
                healthy,
                at: Instant::now(),
            },
        );
        healthy
    }

    /// Probe with a short-lived per-port cache
    pub async fn probe_cached(&self, port: u16) -> bool {
        if let Some(verdict) = self.probe_cache.lock().get(&port) {
            if verdict.at.elapsed() < PROBE_CACHE_TTL {
                return verdict.healthy;
            }
        }
        self.probe(port).await
    }

    /// Retry the probe with exponential backoff until `budget` elapses.
    ///
    /// Delays start at 100 ms and grow by 1.5x up to 1 s.
    pub async fn probe_with_backoff(&self, port: u16, budget: Duration) -> bool {
        let start = Instant::now();
        let mut delay = Duration::from_millis(100);

        loop {
            if self.probe(port).await {
                return true;
            }
            if start.elapsed() + delay > budget {
                debug!(port, "Upstream still unreachable after backoff");
                return false;
            }
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay.mul_f64(1.5), Duration::from_secs(1));
        }
    }

    /// Drop the cached verdict for a port, e.g. after stopping its project
    pub fn forget(&self, port: u16) {
        self.probe_cache.lock().remove(&port);
    }
}
