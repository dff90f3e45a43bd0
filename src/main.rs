use gatewarden::cli::{truncate_output, GatewayCli};
use gatewarden::config::Config;
use gatewarden::origins::OriginSync;
use gatewarden::pool::{GatewayClient, PoolConfig};
use gatewarden::process::Supervisor;
use gatewarden::proxy::ProxyServer;
use gatewarden::token::TokenStore;
use gatewarden::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatewarden=debug".parse().expect("valid log directive")),
        )
        .init();

    // Optional TOML file; deployment env vars win over it
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let mut config = match &config_path {
        Some(path) => Config::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("No configuration file given, using defaults and environment"),
    }

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let token = Arc::new(TokenStore::new(
        config.gateway.token_path(),
        config.gateway.token.clone(),
    ));
    info!(source = ?token.source(), path = %token.path().display(), "Gateway token resolved");

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    };
    let client = Arc::new(GatewayClient::new(config.gateway.target(), pool_config));

    let cli = Arc::new(GatewayCli::from_config(&config.gateway));
    let origins = OriginSync::new(
        Arc::clone(&cli),
        config.gateway.config_path(),
        &config.origins,
    );

    let supervisor = Supervisor::new(
        &config,
        Arc::clone(&token),
        Arc::clone(&cli),
        origins,
        client,
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(
        bind_addr,
        &config.server,
        &config.gateway,
        Arc::clone(&supervisor),
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    if supervisor.is_configured() {
        let boot_supervisor = Arc::clone(&supervisor);
        let boot_cli = Arc::clone(&cli);
        tokio::spawn(async move {
            let doctor = boot_cli.doctor_fix().await;
            info!(
                code = doctor.code,
                output = %truncate_output(&doctor.output, 2000),
                "Gateway doctor finished"
            );
            if let Err(e) = boot_supervisor.ensure_running().await {
                warn!(error = %e, "Gateway did not start at boot; will retry on first request");
            }
        });
    } else {
        info!(
            setup_path = %config.server.setup_path,
            "Gateway is not configured yet; waiting for setup"
        );
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    info!("Stopping gateway...");
    supervisor.shutdown().await;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway wrapper");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        setup_path = %config.server.setup_path,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        target = %config.gateway.target(),
        command = %config.gateway.command,
        state_dir = %config.gateway.state_dir().display(),
        config_path = %config.gateway.config_path().display(),
        configured = config.gateway.is_configured(),
        "Gateway settings"
    );
    info!(
        startup_timeout_secs = config.timing.startup_timeout_secs,
        health_check_interval_ms = config.timing.health_check_interval_ms,
        recovery_cooldown_ms = config.timing.recovery_cooldown_ms,
        crash_restart_limit = config.timing.crash_restart_limit,
        shutdown_grace_ms = config.timing.shutdown_grace_ms,
        "Supervision settings"
    );
}
