use crate::config::{GatewayConfig, ServerConfig};
use crate::error::{fallback_response, json_error_response, GatewayError, ProxyErrorCode};
use crate::origins::{infer_request_origin, OnChange};
use crate::pool::ProbeOutcome;
use crate::process::Supervisor;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Budget for the reachability check behind the setup diagnostics
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(3);
/// Upper bound on the gateway's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;
/// Upper bound on a forwarded upgrade rejection body
const MAX_REJECTION_BODY: usize = 64 * 1024;

const SETUP_TEXT: &str = "Gateway setup is not complete. Run the setup wizard to create a configuration.";

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// What each connection needs to route a request
struct RouteContext {
    supervisor: Arc<Supervisor>,
    gateway_authority: String,
    setup_path: String,
    fallback_page: Option<PathBuf>,
    setup_page: Option<PathBuf>,
    request_timeout: Duration,
}

/// The public listener in front of the gateway
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<RouteContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        server: &ServerConfig,
        gateway: &GatewayConfig,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let ctx = RouteContext {
            supervisor,
            gateway_authority: gateway.authority(),
            setup_path: server.setup_path.trim_end_matches('/').to_string(),
            fallback_page: server.fallback_page.clone(),
            setup_page: server.setup_page.clone(),
            request_timeout: server.request_timeout(),
        };
        Self {
            bind_addr,
            ctx: Arc::new(ctx),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
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
    ctx: Arc<RouteContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, ctx, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: Arc<RouteContext>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();
    let supervisor = Arc::clone(&ctx.supervisor);
    let upgrade = is_upgrade_request(&req);

    if path == "/healthz" {
        return Ok(json_response(
            StatusCode::OK,
            json!({ "ok": true, "gateway": supervisor.status() }),
        ));
    }

    if path == format!("{}/healthz", ctx.setup_path) {
        return Ok(setup_health(&ctx).await);
    }

    let configured = supervisor.is_configured();
    let under_setup = is_setup_path(&path, &ctx.setup_path);

    if !configured && !under_setup {
        if upgrade {
            debug!(request_id, "Rejecting upgrade while unconfigured");
            return Ok(close_upgrade(ctx.fallback_page.as_deref()));
        }
        return Ok(redirect(&ctx.setup_path));
    }

    if under_setup {
        return Ok(setup_response(ctx.setup_page.as_deref()));
    }

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let origin = infer_request_origin(req.headers(), "http");
    let report = supervisor
        .origins()
        .maybe_ensure(origin.as_deref(), OnChange::RestartIfReady(&supervisor))
        .await;
    if !report.ok {
        warn!(request_id, "Syncing allowed origins failed, forwarding anyway");
    }

    if !supervisor.is_ready() {
        if let Err(e) = supervisor.ensure_running().await {
            warn!(request_id, error = %e, "Gateway not ready");
            return Ok(unavailable(&ctx, upgrade));
        }
    }

    if let Err(e) = rewrite_headers(&mut req, &ctx, client_addr, &request_id) {
        error!(request_id, error = %e, "Could not build gateway auth header");
        return Ok(json_error_response(
            ProxyErrorCode::InternalError,
            "Internal proxy error",
        ));
    }

    if upgrade {
        return handle_upgrade(req, ctx, request_id).await;
    }

    let result = tokio::time::timeout(
        ctx.request_timeout,
        supervisor.client().send_request(req),
    )
    .await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) if e.is_connection_refused() => {
            let reason = GatewayError::ConnectionRefused.to_string();
            warn!(request_id, reason, "Forwarding failed");
            supervisor.mark_unhealthy();
            supervisor.request_recovery(&reason);
            Ok(fallback_response(ctx.fallback_page.as_deref()))
        }
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            error!(request_id, error = %e, "Failed to forward request to gateway");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to reach gateway",
            ))
        }
        Err(_) => {
            warn!(
                request_id,
                timeout_secs = ctx.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    ctx.request_timeout.as_secs()
                ),
            ))
        }
    }
}

fn is_setup_path(path: &str, setup_path: &str) -> bool {
    match path.strip_prefix(setup_path) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Inject the gateway token and the forwarding headers
fn rewrite_headers(
    req: &mut Request<Incoming>,
    ctx: &RouteContext,
    client_addr: SocketAddr,
    request_id: &str,
) -> Result<(), hyper::header::InvalidHeaderValue> {
    let bearer = format!("Bearer {}", ctx.supervisor.token().get_or_create());
    let mut auth = HeaderValue::from_str(&bearer)?;
    auth.set_sensitive(true);

    let headers = req.headers_mut();
    headers.insert(hyper::header::AUTHORIZATION, auth);

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    Ok(())
}

fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(full_body(value.to_string()))
        .expect("valid response builder")
}

fn redirect(location: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(format!("Redirecting to {}", location)))
        .expect("valid response builder")
}

fn setup_response(page: Option<&std::path::Path>) -> Response<ProxyBody> {
    let (content_type, body) = match page.map(std::fs::read) {
        Some(Ok(html)) => ("text/html; charset=utf-8", Bytes::from(html)),
        _ => ("text/plain; charset=utf-8", Bytes::from_static(SETUP_TEXT.as_bytes())),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .header(hyper::header::CACHE_CONTROL, "no-store")
        .body(full_body(body))
        .expect("valid response builder")
}

/// Wrapper-level diagnostics for the setup UI
async fn setup_health(ctx: &RouteContext) -> Response<ProxyBody> {
    let supervisor = &ctx.supervisor;
    let configured = supervisor.is_configured();
    let running = supervisor.is_ready();
    let reachable = running
        && matches!(
            supervisor.client().probe("/", REACHABILITY_TIMEOUT).await,
            ProbeOutcome::Responded(_)
        );

    json_response(
        StatusCode::OK,
        json!({
            "ok": true,
            "wrapper": true,
            "configured": configured,
            "gatewayRunning": running,
            "gatewayStarting": supervisor.is_starting(),
            "gatewayReachable": reachable,
        }),
    )
}

/// Answer an upgrade that cannot be served, tearing the client connection down
fn close_upgrade(page: Option<&std::path::Path>) -> Response<ProxyBody> {
    let mut response = fallback_response(page);
    response
        .headers_mut()
        .insert(hyper::header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn unavailable(ctx: &RouteContext, upgrade: bool) -> Response<ProxyBody> {
    if upgrade {
        close_upgrade(ctx.fallback_page.as_deref())
    } else {
        fallback_response(ctx.fallback_page.as_deref())
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    // Check for Connection: Upgrade header (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Forward bytes bidirectionally between client and gateway connections.
///
/// `leftover` is whatever the gateway sent after its 101 head.
async fn forward_bidirectional(
    client: Upgraded,
    mut gateway: TcpStream,
    leftover: Vec<u8>,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(request_id, error = %e, "Client went away during upgrade");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut gateway).await {
        Ok((client_to_gateway, gateway_to_client)) => {
            debug!(
                request_id,
                client_to_gateway,
                gateway_to_client,
                "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the gateway.
///
/// Headers have already been rewritten, so this carries the bearer token.
fn build_upgrade_request<B>(req: &Request<B>, gateway_authority: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(gateway_authority);
    request.push_str(&format!("Host: {}\r\n", host));

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str("\r\n");
    request.into_bytes()
}

/// Parse the status line and headers of the gateway's upgrade response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Parse status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Body of a refused upgrade: whatever followed the head, topped up to
/// `Content-Length` (capped). Without a length only the bytes already read are
/// kept, since the gateway may hold the connection open.
async fn read_rejection_body(
    stream: &mut TcpStream,
    mut body: Vec<u8>,
    headers: &[(String, String)],
) -> std::io::Result<Vec<u8>> {
    let declared = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok());
    let Some(len) = declared else {
        return Ok(body);
    };

    let len = len.min(MAX_REJECTION_BODY);
    if body.len() < len {
        let start = body.len();
        body.resize(len, 0);
        stream.read_exact(&mut body[start..]).await?;
    }
    body.truncate(len);
    Ok(body)
}

fn valid_header(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
    let value = HeaderValue::from_str(value).ok()?;
    Some((name, value))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read the gateway's response head; returns the head and any bytes after it
async fn read_upgrade_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "gateway closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Handle a WebSocket upgrade request
async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: Arc<RouteContext>,
    request_id: String,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let supervisor = &ctx.supervisor;
    debug!(request_id, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &ctx.gateway_authority);

    let mut gateway_stream = match TcpStream::connect(&ctx.gateway_authority).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            let reason = GatewayError::ConnectionRefused.to_string();
            warn!(request_id, reason, "WebSocket upgrade failed");
            supervisor.mark_unhealthy();
            supervisor.request_recovery(&reason);
            return Ok(close_upgrade(ctx.fallback_page.as_deref()));
        }
        Err(e) => {
            error!(request_id, error = %e, "Failed to connect to gateway for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to reach gateway",
            ));
        }
    };

    if let Err(e) = gateway_stream.write_all(&raw_request).await {
        error!(request_id, error = %e, "Failed to send upgrade request to gateway");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Failed to reach gateway",
        ));
    }

    let (head, leftover) = match read_upgrade_head(&mut gateway_stream).await {
        Ok(parts) => parts,
        Err(e) => {
            error!(request_id, error = %e, "Failed to read upgrade response from gateway");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from gateway",
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(request_id, "Failed to parse gateway upgrade response");
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Invalid upgrade response from gateway",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(request_id, status = %status, "Gateway rejected upgrade request");
        let body = match tokio::time::timeout(
            ctx.request_timeout,
            read_rejection_body(&mut gateway_stream, leftover, &response_headers),
        )
        .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                error!(request_id, error = %e, "Failed to read gateway rejection body");
                return Ok(json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Invalid upgrade response from gateway",
                ));
            }
            Err(_) => {
                warn!(request_id, "Timed out reading gateway rejection body");
                return Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    "Timed out reading gateway response",
                ));
            }
        };

        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            // The body is re-framed and the gateway connection is not reused
            let name_lower = name.to_lowercase();
            if matches!(
                name_lower.as_str(),
                "content-length" | "transfer-encoding" | "connection" | "upgrade"
            ) {
                continue;
            }
            if let Some((name, value)) = valid_header(name, value) {
                response = response.header(name, value);
            }
        }
        return Ok(response
            .body(full_body(body))
            .expect("valid response builder"));
    }

    info!(request_id, "WebSocket upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        // Skip hop-by-hop headers that hyper handles
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Some((name, value)) = valid_header(name, value) {
            response = response.header(name, value);
        }
    }

    let response = response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, gateway_stream, leftover, &request_id).await;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}
