//! Pooled HTTP client for talking to the gateway
//!
//! Forwarded traffic and readiness probes go through separate hyper clients.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// Whether the gateway actively refused the TCP connection
    pub fn is_connection_refused(&self) -> bool {
        match self {
            PoolError::Client(e) => is_connection_refused(e),
            PoolError::RequestBuild(_) => false,
        }
    }
}

/// Walk an error's source chain looking for `ECONNREFUSED`
pub fn is_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Result of a single liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The gateway answered with some status (any status counts as alive)
    Responded(StatusCode),
    /// Nothing is listening yet
    Refused,
    /// Any other transport failure, including a timed out probe
    Failed(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Total number of probe requests
    pub health_checks: AtomicU64,
}

impl PoolStats {
    /// Record a regular request
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a probe request
    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// HTTP client bound to the gateway's private address
pub struct GatewayClient {
    /// Base URL, e.g. `http://127.0.0.1:18789`
    target: String,
    /// Main client for proxying requests
    client: Client<HttpConnector, Incoming>,
    /// Dedicated client for probes (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
}

impl GatewayClient {
    pub fn new(target: impl Into<String>, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        // Probes always open a fresh connection
        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        let target = target.into();
        debug!(
            %target,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Gateway client initialized"
        );

        Self {
            target,
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send an already-rewritten request to the gateway
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}{}", self.target, path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let gateway_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(gateway_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `path` once and classify the outcome
    pub async fn probe(&self, path: &str, timeout: Duration) -> ProbeOutcome {
        let uri = format!("{}{}", self.target, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(e) => return ProbeOutcome::Failed(e.to_string()),
        };

        self.stats.record_health_check();

        match tokio::time::timeout(timeout, self.health_client.request(req)).await {
            Ok(Ok(response)) => ProbeOutcome::Responded(response.status()),
            Ok(Err(e)) if is_connection_refused(&e) => ProbeOutcome::Refused,
            Ok(Err(e)) => ProbeOutcome::Failed(error_chain(&e)),
            Err(_) => ProbeOutcome::Failed(format!("timed out after {}ms", timeout.as_millis())),
        }
    }
}

/// Flatten an error and its sources into one line
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        out.push_str(": ");
        out.push_str(&e.to_string());
        current = e.source();
    }
    out
}
