use crate::cli::{CriticalSettings, GatewayCli};
use crate::clock::{self, SharedClock};
use crate::config::{Config, GatewayConfig, SupervisorTiming};
use crate::error::GatewayError;
use crate::health::HealthProbe;
use crate::origins::{OnChange, OriginSync};
use crate::pool::GatewayClient;
use crate::token::TokenStore;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Externally visible gateway state, as reported by `/healthz`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    /// No persisted gateway config yet
    Unconfigured,
    /// Configured, but not (yet) answering
    Starting,
    /// Running and answering probes
    Ready,
}

/// Signals the exit watcher can deliver to its child
#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// The one gateway child, if any.
///
/// The `Child` itself lives in the exit-watcher task; this is the supervisor's
/// view of it.
struct GatewayProcess {
    id: u64,
    pid: Option<u32>,
    started_at: Instant,
    healthy: bool,
    /// Set before any deliberate kill so the exit is not treated as a crash
    manual_restart: bool,
    signals: mpsc::UnboundedSender<Signal>,
    exited: watch::Receiver<Option<String>>,
}

type PendingStart = Shared<BoxFuture<'static, Result<(), GatewayError>>>;

#[derive(Default)]
struct SupervisorState {
    process: Option<GatewayProcess>,
    starting: Option<PendingStart>,
    next_id: u64,
}

#[derive(Default)]
struct RecoveryState {
    in_flight: Option<JoinHandle<()>>,
    last_attempt_at: Option<Instant>,
}

/// Counters for diagnostics and tests
#[derive(Debug, Default)]
pub struct SupervisorStats {
    pub spawns: AtomicU64,
    pub recoveries: AtomicU64,
    pub crash_restarts_scheduled: AtomicU64,
}

impl SupervisorStats {
    pub fn get_spawns(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    pub fn get_recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub fn get_crash_restarts_scheduled(&self) -> u64 {
        self.crash_restarts_scheduled.load(Ordering::Relaxed)
    }
}

/// Arguments after the entry script for a long-running gateway
pub fn gateway_run_args(port: u16, token: &str) -> Vec<String> {
    [
        "gateway",
        "run",
        "--bind",
        "loopback",
        "--port",
        &port.to_string(),
        "--auth",
        "token",
        "--token",
        token,
        "--allow-unconfigured",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Copy of `args` safe to log: the value after `--token` is masked
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            redacted.push("[REDACTED]".to_string());
        } else {
            redacted.push(arg.clone());
        }
        mask_next = arg == "--token";
    }
    redacted
}

/// Owns the gateway child process and every transition of its lifecycle.
///
/// Like the rest of the coordinators, `Supervisor` lives behind an `Arc`;
/// [`new`](Supervisor::new) returns one directly. Methods that spawn
/// background work take `self: &Arc<Self>`.
///
/// Lifecycle: `Stopped -> Starting -> Healthy`. A refused connection or a
/// failed probe drops `Healthy`; an explicit restart or recovery goes back to
/// `Starting`, while a crash goes to `Stopped` with one delayed restart
/// scheduled. Once [`shutdown`](Supervisor::shutdown) begins nothing new is
/// scheduled.
pub struct Supervisor {
    gateway: GatewayConfig,
    timing: SupervisorTiming,
    token: Arc<TokenStore>,
    cli: Arc<GatewayCli>,
    origins: Arc<OriginSync>,
    client: Arc<GatewayClient>,
    probe: HealthProbe,
    clock: SharedClock,
    state: Mutex<SupervisorState>,
    recovery: Mutex<RecoveryState>,
    shutting_down: AtomicBool,
    /// Consecutive crash restarts since the gateway was last healthy
    crash_streak: AtomicU32,
    stats: SupervisorStats,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        token: Arc<TokenStore>,
        cli: Arc<GatewayCli>,
        origins: Arc<OriginSync>,
        client: Arc<GatewayClient>,
    ) -> Arc<Self> {
        Self::with_clock(config, token, cli, origins, client, clock::system())
    }

    pub fn with_clock(
        config: &Config,
        token: Arc<TokenStore>,
        cli: Arc<GatewayCli>,
        origins: Arc<OriginSync>,
        client: Arc<GatewayClient>,
        clock: SharedClock,
    ) -> Arc<Self> {
        let timing = config.timing.clone();
        let probe = HealthProbe::new(
            Arc::clone(&client),
            config.gateway.probe_paths.clone(),
            timing.health_check_interval(),
            timing.probe_timeout(),
        );

        Arc::new(Self {
            gateway: config.gateway.clone(),
            timing,
            token,
            cli,
            origins,
            client,
            probe,
            clock,
            state: Mutex::new(SupervisorState::default()),
            recovery: Mutex::new(RecoveryState::default()),
            shutting_down: AtomicBool::new(false),
            crash_streak: AtomicU32::new(0),
            stats: SupervisorStats::default(),
        })
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    pub fn client(&self) -> &Arc<GatewayClient> {
        &self.client
    }

    pub fn token(&self) -> &Arc<TokenStore> {
        &self.token
    }

    pub fn origins(&self) -> &Arc<OriginSync> {
        &self.origins
    }

    /// Base URL of the gateway's private listener
    pub fn target(&self) -> &str {
        self.client.target()
    }

    pub fn is_configured(&self) -> bool {
        self.gateway.is_configured()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// A process exists, is healthy, and no start is in flight
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.starting.is_none() && state.process.as_ref().is_some_and(|p| p.healthy)
    }

    pub fn is_starting(&self) -> bool {
        self.state.lock().starting.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().process.as_ref().and_then(|p| p.pid)
    }

    pub fn status(&self) -> GatewayStatus {
        if !self.is_configured() {
            GatewayStatus::Unconfigured
        } else if self.is_ready() {
            GatewayStatus::Ready
        } else {
            GatewayStatus::Starting
        }
    }

    /// Drop the health flag after a failed connection
    pub fn mark_unhealthy(&self) {
        if let Some(process) = self.state.lock().process.as_mut() {
            if process.healthy {
                debug!(pid = process.pid, "Gateway marked unhealthy");
            }
            process.healthy = false;
        }
    }

    /// Make sure a healthy gateway is running.
    ///
    /// Returns immediately when one is. Otherwise every concurrent caller
    /// joins a single start attempt and sees its outcome.
    pub fn ensure_running(self: &Arc<Self>) -> BoxFuture<'static, Result<(), GatewayError>> {
        let this = Arc::clone(self);
        async move {
            if this.is_shutting_down() {
                return Err(GatewayError::ShuttingDown);
            }
            if !this.is_configured() {
                return Err(GatewayError::NotConfigured);
            }

            let pending = {
                let mut state = this.state.lock();
                if state.starting.is_none() && state.process.as_ref().is_some_and(|p| p.healthy) {
                    return Ok(());
                }
                match &state.starting {
                    Some(pending) => pending.clone(),
                    None => {
                        let task_self = Arc::clone(&this);
                        let handle = tokio::spawn(async move {
                            let result = task_self.start_and_wait().await;
                            task_self.state.lock().starting = None;
                            result
                        });
                        let pending = async move {
                            handle
                                .await
                                .unwrap_or_else(|e| Err(GatewayError::Internal(e.to_string())))
                        }
                        .boxed()
                        .shared();
                        state.starting = Some(pending.clone());
                        pending
                    }
                }
            };

            pending.await
        }
        .boxed()
    }

    /// Deliberately stop the current gateway and start a fresh one.
    ///
    /// The exit this causes never schedules a crash restart.
    pub fn restart(self: &Arc<Self>) -> BoxFuture<'static, Result<(), GatewayError>> {
        let this = Arc::clone(self);
        async move {
            if let Some(id) = this.current_id() {
                info!("Restarting gateway");
                this.terminate(id, this.timing.restart_grace()).await;
            }
            this.ensure_running().await
        }
        .boxed()
    }

    /// Ask for the gateway to be brought back after a refused connection.
    ///
    /// Rate limited by the recovery cooldown and single-flighted. Returns
    /// whether a recovery was actually started.
    pub fn request_recovery(self: &Arc<Self>, reason: &str) -> bool {
        if self.is_shutting_down() || !self.is_configured() {
            return false;
        }

        let mut recovery = self.recovery.lock();
        if recovery.in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(reason, "Gateway recovery already in flight");
            return false;
        }

        let now = self.clock.now();
        if clock::within(recovery.last_attempt_at, now, self.timing.recovery_cooldown()) {
            debug!(reason, "Gateway recovery cooling down");
            return false;
        }
        recovery.last_attempt_at = Some(now);
        self.stats.recoveries.fetch_add(1, Ordering::Relaxed);

        let this = Arc::clone(self);
        let reason = reason.to_string();
        recovery.in_flight = Some(tokio::spawn(async move {
            warn!(reason = %reason, "Gateway recovery requested");
            this.mark_unhealthy();
            if let Some(id) = this.current_id() {
                this.terminate(id, this.timing.restart_grace()).await;
            }
            match this.ensure_running().await {
                Ok(()) => info!("Gateway recovery completed"),
                Err(e) => error!(error = %e, "Gateway recovery failed"),
            }
            this.recovery.lock().in_flight = None;
        }));

        true
    }

    /// Stop supervising: no further restarts, then terminate the gateway
    /// (SIGTERM, bounded wait, SIGKILL).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(id) = self.current_id() {
            info!("Stopping gateway");
            self.terminate(id, self.timing.shutdown_grace()).await;
        }
        info!("Gateway supervisor stopped");
    }

    fn current_id(&self) -> Option<u64> {
        self.state.lock().process.as_ref().map(|p| p.id)
    }

    async fn start_and_wait(self: &Arc<Self>) -> Result<(), GatewayError> {
        let stale = {
            let state = self.state.lock();
            state.process.as_ref().filter(|p| !p.healthy).map(|p| p.id)
        };
        if let Some(id) = stale {
            warn!("Gateway process exists but is marked unhealthy, restarting it");
            self.terminate(id, self.timing.restart_grace()).await;
        }

        self.start().await?;

        let watched = {
            let state = self.state.lock();
            state.process.as_ref().map(|p| (p.id, p.exited.clone()))
        };
        let Some((id, mut exited)) = watched else {
            return Err(GatewayError::ExitedDuringStartup(
                "exited before it could be probed".to_string(),
            ));
        };

        let budget = self.timing.startup_timeout();
        let ready = tokio::select! {
            ready = self.probe.wait_for_ready(budget) => ready,
            status = wait_exited(&mut exited) => {
                return Err(GatewayError::ExitedDuringStartup(status));
            }
        };
        if !ready {
            return Err(GatewayError::StartupTimeout(budget));
        }

        let mut state = self.state.lock();
        match state.process.as_mut() {
            Some(process) if process.id == id => {
                process.healthy = true;
                self.crash_streak.store(0, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(GatewayError::ExitedDuringStartup(
                "exited right after becoming ready".to_string(),
            )),
        }
    }

    /// Spawn the gateway if none is running. Requires persisted configuration.
    async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.state.lock().process.is_some() {
            return Ok(());
        }
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        let state_dir = self.gateway.state_dir();
        let workspace_dir = self.gateway.workspace_dir();
        for dir in [&state_dir, &workspace_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                GatewayError::Spawn(format!("creating {}: {}", dir.display(), e))
            })?;
        }

        let token = self.token.get_or_create().to_string();
        self.cli
            .enforce_settings(&CriticalSettings {
                token: &token,
                trusted_proxies: &self.gateway.trusted_proxies,
                disable_device_auth: self.gateway.disable_device_auth,
            })
            .await;
        self.origins.ensure(None, OnChange::Keep).await;

        self.clear_lock_files();

        if self.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }

        let args = gateway_run_args(self.gateway.port, &token);
        let mut cmd = self.cli.command(&args);
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        info!(
            command = %format!("{} {}", self.cli.program(), redact_args(&args).join(" ")),
            state_dir = %state_dir.display(),
            workspace_dir = %workspace_dir.display(),
            config_path = %self.gateway.config_path().display(),
            "Starting gateway"
        );

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Gateway spawn error");
                self.schedule_crash_restart("spawn error");
                return Err(GatewayError::Spawn(e.to_string()));
            }
        };

        let pid = child.id();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.process = Some(GatewayProcess {
                id,
                pid,
                started_at: Instant::now(),
                healthy: false,
                manual_restart: false,
                signals: signal_tx,
                exited: exit_rx,
            });
            id
        };
        self.stats.spawns.fetch_add(1, Ordering::Relaxed);
        info!(pid, port = self.gateway.port, "Gateway process spawned");

        tokio::spawn(Arc::clone(self).watch_exit(id, child, signal_rx, exit_tx));
        Ok(())
    }

    fn clear_lock_files(&self) {
        for path in self.gateway.stale_lock_files() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed stale lock file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Could not remove lock file"),
            }
        }
    }

    /// Owns the child until it exits, relaying signals to it
    async fn watch_exit(
        self: Arc<Self>,
        id: u64,
        mut child: Child,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        exit_tx: watch::Sender<Option<String>>,
    ) {
        let pid = child.id();
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = signals.recv() => send_signal(&mut child, pid, signal),
            }
        };

        let description = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        };
        self.on_exit(id, &description);
        let _ = exit_tx.send(Some(description));
    }

    fn on_exit(self: &Arc<Self>, id: u64, status: &str) {
        let (manual, uptime) = {
            let mut state = self.state.lock();
            match state.process.as_ref() {
                Some(process) if process.id == id => {
                    let exited = (process.manual_restart, Some(process.started_at.elapsed()));
                    state.process = None;
                    exited
                }
                // Already cleared by a deliberate stop
                _ => (true, None),
            }
        };
        let uptime_ms = uptime.map(|d| d.as_millis() as u64);

        if manual {
            info!(status, uptime_ms, "Gateway exited");
            return;
        }

        error!(status, uptime_ms, "Gateway exited unexpectedly");
        if self.is_shutting_down() || !self.is_configured() {
            return;
        }
        self.schedule_crash_restart(status);
    }

    fn schedule_crash_restart(self: &Arc<Self>, reason: &str) {
        if self.is_shutting_down() {
            return;
        }

        let limit = self.timing.crash_restart_limit;
        let attempt = self.crash_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if limit > 0 && attempt > limit {
            error!(attempt, limit, reason, "Gateway keeps crashing, giving up on auto-restart");
            return;
        }

        let delay = self.timing.crash_restart_delay();
        self.stats
            .crash_restarts_scheduled
            .fetch_add(1, Ordering::Relaxed);
        info!(delay_ms = delay.as_millis() as u64, attempt, "Scheduling gateway auto-restart");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.is_shutting_down() || !this.is_configured() {
                return;
            }
            {
                let state = this.state.lock();
                if state.process.is_some() || state.starting.is_some() {
                    debug!("Gateway already running or starting, skipping auto-restart");
                    return;
                }
            }
            if let Err(e) = this.ensure_running().await {
                error!(error = %e, "Gateway auto-restart failed");
            }
        });
    }

    /// Deliberately stop process `id`: SIGTERM, wait up to `grace`, SIGKILL
    async fn terminate(&self, id: u64, grace: Duration) {
        let target = {
            let mut state = self.state.lock();
            match state.process.as_mut() {
                Some(process) if process.id == id => {
                    process.manual_restart = true;
                    process.healthy = false;
                    Some((process.pid, process.signals.clone(), process.exited.clone()))
                }
                _ => None,
            }
        };
        let Some((pid, signals, mut exited)) = target else {
            return;
        };

        info!(pid, "Sending SIGTERM to gateway");
        let _ = signals.send(Signal::Terminate);

        match tokio::time::timeout(grace, wait_exited(&mut exited)).await {
            Ok(status) => info!(pid, status = %status, "Gateway stopped"),
            Err(_) => {
                warn!(
                    pid,
                    grace_ms = grace.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = signals.send(Signal::Kill);
                if tokio::time::timeout(grace, wait_exited(&mut exited))
                    .await
                    .is_err()
                {
                    error!(pid, "Gateway did not exit after SIGKILL");
                }
            }
        }

        let mut state = self.state.lock();
        if state.process.as_ref().is_some_and(|p| p.id == id) {
            state.process = None;
        }
    }
}

fn send_signal(child: &mut Child, pid: Option<u32>, signal: Signal) {
    match signal {
        Signal::Terminate => {
            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = pid;
                let _ = child.start_kill();
            }
        }
        Signal::Kill => {
            let _ = child.start_kill();
        }
    }
}

async fn wait_exited(exited: &mut watch::Receiver<Option<String>>) -> String {
    match exited.wait_for(|status| status.is_some()).await {
        Ok(status) => (*status).clone().unwrap_or_default(),
        Err(_) => "exit watcher stopped".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::OriginConfig;
    use crate::pool::PoolConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_timing() -> SupervisorTiming {
        SupervisorTiming {
            startup_timeout_secs: 3,
            health_check_interval_ms: 50,
            probe_timeout_ms: 500,
            recovery_cooldown_ms: 5000,
            restart_grace_ms: 300,
            crash_restart_delay_ms: 300,
            crash_restart_limit: 10,
            shutdown_grace_ms: 500,
        }
    }

    /// Accepts connections and answers every request with 200
    async fn mock_gateway() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                });
            }
        });
        port
    }

    struct Harness {
        dir: tempfile::TempDir,
        supervisor: Arc<Supervisor>,
    }

    /// `gateway_script` runs for `gateway run ...`; every CLI call exits 0
    fn harness(port: u16, gateway_script: &str, clock: SharedClock) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        std::fs::write(state_dir.join("openclaw.json"), "{}").unwrap();

        let script = format!(
            "case \"$1\" in gateway) {} ;; *) exit 0 ;; esac",
            gateway_script
        );
        let mut config = Config::default();
        config.gateway = GatewayConfig {
            port,
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script, "gateway".to_string()],
            state_dir: Some(state_dir.clone()),
            lock_files: Vec::new(),
            ..GatewayConfig::default()
        };
        config.timing = test_timing();

        let token = Arc::new(TokenStore::new(state_dir.join("gateway.token"), Some("secret".into())));
        let cli = Arc::new(GatewayCli::from_config(&config.gateway));
        let origins = OriginSync::new(
            Arc::clone(&cli),
            config.gateway.config_path(),
            &OriginConfig::default(),
        );
        let client = Arc::new(GatewayClient::new(config.gateway.target(), PoolConfig::default()));
        let supervisor = Supervisor::with_clock(&config, token, cli, origins, client, clock);

        Harness { dir, supervisor }
    }

    #[test]
    fn test_redact_args_masks_token() {
        let args = gateway_run_args(18789, "super-secret");
        let redacted = redact_args(&args).join(" ");
        assert_eq!(
            redacted,
            "gateway run --bind loopback --port 18789 --auth token --token [REDACTED] --allow-unconfigured"
        );
        assert!(args.contains(&"super-secret".to_string()));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&GatewayStatus::Ready).unwrap(), "\"ready\"");
        assert_eq!(
            serde_json::to_string(&GatewayStatus::Unconfigured).unwrap(),
            "\"unconfigured\""
        );
    }

    #[tokio::test]
    async fn test_unconfigured_start_is_rejected() {
        let h = harness(mock_gateway().await, "exec sleep 60", clock::system());
        std::fs::remove_file(h.dir.path().join("state").join("openclaw.json")).unwrap();

        let result = h.supervisor.ensure_running().await;
        assert!(matches!(result, Err(GatewayError::NotConfigured)));
        assert_eq!(h.supervisor.status(), GatewayStatus::Unconfigured);
        assert_eq!(h.supervisor.stats().get_spawns(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_running_spawns_once() {
        let h = harness(mock_gateway().await, "exec sleep 60", clock::system());

        let calls: Vec<_> = (0..8).map(|_| h.supervisor.ensure_running()).collect();
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(h.supervisor.stats().get_spawns(), 1);
        assert!(h.supervisor.is_ready());
        assert_eq!(h.supervisor.status(), GatewayStatus::Ready);

        // Already healthy: no new spawn
        h.supervisor.ensure_running().await.unwrap();
        assert_eq!(h.supervisor.stats().get_spawns(), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_startup_timeout_when_gateway_never_listens() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let h = harness(port, "exec sleep 60", clock::system());

        let result = h.supervisor.ensure_running().await;
        assert!(matches!(result, Err(GatewayError::StartupTimeout(_))));
        assert!(!h.supervisor.is_ready());
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_during_startup_fails_fast() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let h = harness(port, "exit 1", clock::system());

        let start = Instant::now();
        let result = h.supervisor.ensure_running().await;
        assert!(matches!(result, Err(GatewayError::ExitedDuringStartup(_))));
        assert!(start.elapsed() < Duration::from_secs(3));
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_does_not_schedule_crash_restart() {
        let h = harness(mock_gateway().await, "exec sleep 60", clock::system());
        h.supervisor.ensure_running().await.unwrap();
        let first_pid = h.supervisor.pid();

        h.supervisor.restart().await.unwrap();
        assert_eq!(h.supervisor.stats().get_spawns(), 2);
        assert_ne!(h.supervisor.pid(), first_pid);

        // Let any (wrongly) scheduled crash restart fire
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.supervisor.stats().get_crash_restarts_scheduled(), 0);
        assert_eq!(h.supervisor.stats().get_spawns(), 2);
        h.supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_schedules_exactly_one_restart() {
        let h = harness(mock_gateway().await, "exec sleep 60", clock::system());
        h.supervisor.ensure_running().await.unwrap();
        let pid = h.supervisor.pid().unwrap();

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.supervisor.stats().get_crash_restarts_scheduled(), 1);
        assert_eq!(h.supervisor.stats().get_spawns(), 1);
        assert!(!h.supervisor.is_running());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.supervisor.stats().get_spawns(), 2);
        assert_eq!(h.supervisor.stats().get_crash_restarts_scheduled(), 1);
        assert!(h.supervisor.is_ready());
        h.supervisor.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_timer_skips_when_gateway_already_back() {
        let h = harness(mock_gateway().await, "exec sleep 60", clock::system());
        h.supervisor.ensure_running().await.unwrap();
        let pid = h.supervisor.pid().unwrap();

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        for _ in 0..40 {
            if !h.supervisor.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!h.supervisor.is_running());
        assert_eq!(h.supervisor.stats().get_crash_restarts_scheduled(), 1);

        // Someone brings the gateway back before the delayed restart fires
        h.supervisor.ensure_running().await.unwrap();
        assert_eq!(h.supervisor.stats().get_spawns(), 2);
        let replacement = h.supervisor.pid();

        // An unhealthy process would be replaced by a start, the timer must not do that
        h.supervisor.mark_unhealthy();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(h.supervisor.stats().get_spawns(), 2);
        assert_eq!(h.supervisor.stats().get_crash_restarts_scheduled(), 1);
        assert!(h.supervisor.is_running());
        assert_eq!(h.supervisor.pid(), replacement);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_is_cooled_down_and_single_flight() {
        let clock = ManualClock::new();
        let h = harness(mock_gateway().await, "exec sleep 60", clock.clone());
        h.supervisor.ensure_running().await.unwrap();

        assert!(h.supervisor.request_recovery("connection refused"));
        assert!(!h.supervisor.request_recovery("connection refused"));
        assert_eq!(h.supervisor.stats().get_recoveries(), 1);

        // Wait for the recovery to finish, then stay inside the cooldown
        for _ in 0..60 {
            if h.supervisor.is_ready() && h.supervisor.stats().get_spawns() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.supervisor.stats().get_spawns(), 2);
        assert!(!h.supervisor.request_recovery("connection refused"));

        clock.advance(Duration::from_secs(5));
        assert!(h.supervisor.request_recovery("connection refused"));
        assert_eq!(h.supervisor.stats().get_recoveries(), 2);
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_gateway_and_blocks_new_starts() {
        let h = harness(mock_gateway().await, "exec sleep 60", clock::system());
        h.supervisor.ensure_running().await.unwrap();

        h.supervisor.shutdown().await;
        assert!(!h.supervisor.is_running());
        assert!(matches!(
            h.supervisor.ensure_running().await,
            Err(GatewayError::ShuttingDown)
        ));
        assert!(!h.supervisor.request_recovery("late"));
        assert_eq!(h.supervisor.stats().get_crash_restarts_scheduled(), 0);
    }

    #[tokio::test]
    async fn test_stale_lock_files_removed_before_spawn() {
        let h = harness(mock_gateway().await, "exec sleep 60", clock::system());
        let lock = h.dir.path().join("state").join("gateway.lock");
        std::fs::write(&lock, "123").unwrap();

        h.supervisor.ensure_running().await.unwrap();
        assert!(!lock.exists());
        h.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_gateway_receives_fixed_arguments_and_env() {
        let port = mock_gateway().await;
        let h = harness(
            port,
            "echo \"$@|$OPENCLAW_STATE_DIR\" > \"$OPENCLAW_STATE_DIR/args.txt\"; exec sleep 60",
            clock::system(),
        );
        h.supervisor.ensure_running().await.unwrap();

        let state_dir = h.dir.path().join("state");
        let args_file = state_dir.join("args.txt");
        for _ in 0..40 {
            if std::fs::read_to_string(&args_file).is_ok_and(|s| s.ends_with('\n')) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let written = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            written.trim(),
            format!(
                "gateway run --bind loopback --port {} --auth token --token secret --allow-unconfigured|{}",
                port,
                state_dir.display()
            )
        );
        h.supervisor.shutdown().await;
    }
}
