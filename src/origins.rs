//! Control UI CORS allow-list maintenance
//!
//! The allow-list the gateway enforces is the union of what is already
//! persisted, what the deployment configures statically, and the origin the
//! current request came from. Pushing a new list costs a CLI subprocess, so the
//! push is single-flighted and the per-request entry point is debounced.

use crate::cli::{truncate_output, GatewayCli};
use crate::clock::{self, SharedClock};
use crate::config::{split_list, OriginConfig};
use crate::error::GatewayError;
use crate::process::Supervisor;
use futures::future::{BoxFuture, FutureExt, Shared};
use hyper::header::{HeaderMap, HOST, ORIGIN};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::{Origin, Url};

/// Config key holding the control UI allow-list
pub const ALLOWED_ORIGINS_KEY: &str = "gateway.controlUi.allowedOrigins";

const ALLOWED_ORIGINS_POINTER: &str = "/gateway/controlUi/allowedOrigins";

/// Reduce a URL-ish string to `scheme://host[:port]`, or `None` if it has no
/// tuple origin.
pub fn normalize_origin(value: &str) -> Option<String> {
    let raw = value.trim();
    if raw.is_empty() {
        return None;
    }
    let url = Url::parse(raw).ok()?;
    match url.origin() {
        origin @ Origin::Tuple(..) => Some(origin.ascii_serialization()),
        Origin::Opaque(_) => None,
    }
}

/// Parse a comma/whitespace separated list of origins, dropping invalid ones
pub fn parse_origin_list(value: &str) -> Vec<String> {
    let set: BTreeSet<String> = split_list(value)
        .iter()
        .filter_map(|item| normalize_origin(item))
        .collect();
    set.into_iter().collect()
}

/// Strip scheme and path from a bare domain setting
pub fn normalize_domain_host(value: &str) -> Option<String> {
    let raw = value.trim();
    let lower = raw.to_ascii_lowercase();
    let rest = if lower.starts_with("https://") {
        &raw[8..]
    } else if lower.starts_with("http://") {
        &raw[7..]
    } else {
        raw
    };
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Origins that come from deployment configuration rather than traffic
pub fn static_origins(config: &OriginConfig) -> BTreeSet<String> {
    let mut origins: BTreeSet<String> = config
        .allowed
        .iter()
        .flat_map(|item| parse_origin_list(item))
        .collect();

    if let Some(origin) = config.public_url.as_deref().and_then(normalize_origin) {
        origins.insert(origin);
    }

    if let Some(host) = config.platform_domain.as_deref().and_then(normalize_domain_host) {
        origins.extend(normalize_origin(&format!("https://{}", host)));
        origins.extend(normalize_origin(&format!("http://{}", host)));
    }

    origins
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
}

fn first_csv(value: &str) -> &str {
    value.split(',').next().unwrap_or("").trim()
}

/// Work out which origin a request was made from.
///
/// Prefers the `Origin` header, then the forwarded proto/host pair (falling
/// back to `Host` and the transport protocol).
pub fn infer_request_origin(headers: &HeaderMap, transport_proto: &str) -> Option<String> {
    if let Some(origin) = normalize_origin(header_str(headers, ORIGIN.as_str())) {
        return Some(origin);
    }

    let forwarded_proto = first_csv(header_str(headers, "x-forwarded-proto"));
    let forwarded_host = first_csv(header_str(headers, "x-forwarded-host"));
    let host = if forwarded_host.is_empty() {
        header_str(headers, HOST.as_str())
    } else {
        forwarded_host
    };
    if host.is_empty() {
        return None;
    }

    let proto = if forwarded_proto.is_empty() {
        transport_proto
    } else {
        forwarded_proto
    };
    normalize_origin(&format!("{}://{}", proto, host))
}

/// Origins already present in the gateway's persisted config file
pub fn read_persisted_origins(config_path: &std::path::Path) -> Vec<String> {
    let Ok(raw) = std::fs::read_to_string(config_path) else {
        return Vec::new();
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return Vec::new();
    };
    parsed
        .pointer(ALLOWED_ORIGINS_POINTER)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .filter_map(normalize_origin)
                .collect()
        })
        .unwrap_or_default()
}

/// What to do once a changed list has been pushed
#[derive(Clone, Copy)]
pub enum OnChange<'a> {
    Keep,
    /// Restart the gateway if it is currently ready, so the new list applies
    RestartIfReady(&'a Arc<Supervisor>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub ok: bool,
    /// No mutation was issued by this call
    pub skipped: bool,
    pub updated: bool,
    pub origins: Vec<String>,
}

impl SyncReport {
    fn skipped(ok: bool, origins: Vec<String>) -> Self {
        Self {
            ok,
            skipped: true,
            updated: false,
            origins,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PushOutcome {
    ok: bool,
    updated: bool,
}

type PendingPush = Shared<BoxFuture<'static, PushOutcome>>;

pub struct OriginSync {
    cli: Arc<GatewayCli>,
    config_path: PathBuf,
    static_origins: BTreeSet<String>,
    interval: Duration,
    clock: SharedClock,
    synced: Mutex<BTreeSet<String>>,
    in_flight: Mutex<Option<PendingPush>>,
    last_debounced_at: Mutex<Option<Instant>>,
    mutations: AtomicU64,
}

impl OriginSync {
    pub fn new(cli: Arc<GatewayCli>, config_path: PathBuf, config: &OriginConfig) -> Arc<Self> {
        Self::with_clock(cli, config_path, config, clock::system())
    }

    pub fn with_clock(
        cli: Arc<GatewayCli>,
        config_path: PathBuf,
        config: &OriginConfig,
        clock: SharedClock,
    ) -> Arc<Self> {
        let static_origins = static_origins(config);
        debug!(count = static_origins.len(), "Static control UI origins loaded");
        Arc::new(Self {
            cli,
            config_path,
            static_origins,
            interval: config.sync_interval(),
            clock,
            synced: Mutex::new(BTreeSet::new()),
            in_flight: Mutex::new(None),
            last_debounced_at: Mutex::new(None),
            mutations: AtomicU64::new(0),
        })
    }

    /// Number of allow-list mutations issued
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// The last list successfully pushed to the gateway
    pub fn synced(&self) -> Vec<String> {
        self.synced.lock().iter().cloned().collect()
    }

    /// Sorted union of persisted, static and request-derived origins
    pub fn desired(&self, request_origin: Option<&str>) -> Vec<String> {
        let mut origins: BTreeSet<String> =
            read_persisted_origins(&self.config_path).into_iter().collect();
        origins.extend(self.static_origins.iter().cloned());
        if let Some(origin) = request_origin.and_then(normalize_origin) {
            origins.insert(origin);
        }
        origins.into_iter().collect()
    }

    /// Push the desired list if it differs from what was last synced.
    pub async fn ensure(
        self: &Arc<Self>,
        request_origin: Option<&str>,
        on_change: OnChange<'_>,
    ) -> SyncReport {
        if !self.config_path.exists() {
            return SyncReport::skipped(false, Vec::new());
        }

        let desired = self.desired(request_origin);
        if desired.is_empty() {
            return SyncReport::skipped(true, desired);
        }

        {
            let mut synced = self.synced.lock();
            if synced.is_empty() {
                synced.extend(read_persisted_origins(&self.config_path));
            }
            if synced.iter().eq(desired.iter()) {
                return SyncReport::skipped(true, desired);
            }
        }

        let (pending, leader) = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(pending) => (pending.clone(), false),
                None => {
                    let this = Arc::clone(self);
                    let list = desired.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = this.push(list).await;
                        *this.in_flight.lock() = None;
                        outcome
                    });
                    let pending = async move {
                        handle.await.unwrap_or(PushOutcome {
                            ok: false,
                            updated: false,
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    (pending, true)
                }
            }
        };

        let outcome = pending.await;
        if !leader {
            return SyncReport::skipped(outcome.ok, desired);
        }

        if outcome.ok && outcome.updated {
            if let OnChange::RestartIfReady(supervisor) = on_change {
                if supervisor.is_ready() {
                    info!("Restarting gateway to apply new control UI origins");
                    if let Err(e) = supervisor.restart().await {
                        warn!(error = %e, "Gateway restart after origin change failed");
                    }
                }
            }
        }

        SyncReport {
            ok: outcome.ok,
            skipped: false,
            updated: outcome.updated,
            origins: desired,
        }
    }

    /// [`ensure`](Self::ensure), at most once per sync interval.
    ///
    /// Calls inside the window report `skipped` without doing any work, so an
    /// origin first seen inside the window waits for the next one.
    pub async fn maybe_ensure(
        self: &Arc<Self>,
        request_origin: Option<&str>,
        on_change: OnChange<'_>,
    ) -> SyncReport {
        {
            let mut last = self.last_debounced_at.lock();
            let now = self.clock.now();
            if clock::within(*last, now, self.interval) {
                return SyncReport::skipped(true, Vec::new());
            }
            *last = Some(now);
        }
        self.ensure(request_origin, on_change).await
    }

    async fn push(&self, origins: Vec<String>) -> PushOutcome {
        let json = match serde_json::to_string(&origins) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Could not encode control UI origins");
                return PushOutcome {
                    ok: false,
                    updated: false,
                };
            }
        };

        self.mutations.fetch_add(1, Ordering::Relaxed);
        let result = self.cli.config_set_json(ALLOWED_ORIGINS_KEY, &json).await;
        if !result.success() {
            let output = truncate_output(&result.output, 500);
            let err = GatewayError::ConfigSync {
                code: result.code,
                output: output.clone(),
            };
            warn!(key = ALLOWED_ORIGINS_KEY, output = %output, "{}", err);
            return PushOutcome {
                ok: false,
                updated: false,
            };
        }

        *self.synced.lock() = origins.into_iter().collect();
        info!(origins = %json, "Control UI origins updated");
        PushOutcome {
            ok: true,
            updated: true,
        }
    }
}
