use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the wrapper
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised gateway process
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Static CORS origins and sync cadence
    #[serde(default)]
    pub origins: OriginConfig,

    /// Supervision budgets and delays
    #[serde(default)]
    pub timing: SupervisorTiming,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Setup entry point; unconfigured requests are redirected here
    #[serde(default = "default_setup_path")]
    pub setup_path: String,

    /// HTML served with 503 while the gateway is unavailable
    pub fallback_page: Option<PathBuf>,

    /// Page served under the setup path
    pub setup_page: Option<PathBuf>,

    /// Max time to wait for the gateway to answer a forwarded request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections kept to the gateway (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            setup_path: default_setup_path(),
            fallback_page: None,
            setup_page: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

/// Configuration for the gateway child process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the wrapper's permissions.
/// Protect the configuration file and environment accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Loopback host the gateway listens on
    #[serde(default = "default_gateway_host")]
    pub host: String,

    /// Fixed internal port handed to the gateway
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Program used for both the gateway and its `config set` calls
    #[serde(default = "default_gateway_command")]
    pub command: String,

    /// Arguments placed before every subcommand (usually the entry script)
    #[serde(default = "default_gateway_args")]
    pub args: Vec<String>,

    /// State directory (default: ~/.openclaw)
    pub state_dir: Option<PathBuf>,

    /// Workspace directory (default: <state_dir>/workspace)
    pub workspace_dir: Option<PathBuf>,

    /// Persisted gateway config; its presence means "configured"
    pub config_path: Option<PathBuf>,

    /// Token override; when unset the token file in the state dir is used
    pub token: Option<String>,

    /// Disable device auth for the control UI
    #[serde(default)]
    pub disable_device_auth: bool,

    /// Proxies the gateway should trust for forwarded headers
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,

    /// Paths swept, in order, by the readiness probe
    #[serde(default = "default_probe_paths")]
    pub probe_paths: Vec<String>,

    /// Extra stale lock files removed before each spawn
    #[serde(default = "default_lock_files")]
    pub lock_files: Vec<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            command: default_gateway_command(),
            args: default_gateway_args(),
            state_dir: None,
            workspace_dir: None,
            config_path: None,
            token: None,
            disable_device_auth: false,
            trusted_proxies: default_trusted_proxies(),
            probe_paths: default_probe_paths(),
            lock_files: default_lock_files(),
        }
    }
}

impl GatewayConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs_next::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".openclaw")
        })
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("workspace"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("openclaw.json"))
    }

    pub fn token_path(&self) -> PathBuf {
        self.state_dir().join("gateway.token")
    }

    /// Lock files cleared before spawning: the state dir lock plus any extras
    pub fn stale_lock_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.state_dir().join("gateway.lock")];
        files.extend(self.lock_files.iter().cloned());
        files
    }

    /// Base URL of the gateway's private listener
    pub fn target(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// `host:port` form used for raw socket connections
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_configured(&self) -> bool {
        self.config_path().exists()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OriginConfig {
    /// Statically allowed origins (comma or whitespace separated in env form)
    #[serde(default)]
    pub allowed: Vec<String>,

    /// Public URL of this deployment
    pub public_url: Option<String>,

    /// Domain assigned by the hosting platform; allowed over http and https
    pub platform_domain: Option<String>,

    /// Minimum seconds between request-driven origin syncs
    #[serde(default = "default_origin_sync_interval")]
    pub sync_interval_secs: u64,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            allowed: Vec::new(),
            public_url: None,
            platform_domain: None,
            sync_interval_secs: default_origin_sync_interval(),
        }
    }
}

impl OriginConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorTiming {
    /// Budget for a spawned gateway to start answering
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Delay between readiness sweeps in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Per-request timeout for a single probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Minimum time between two recoveries
    #[serde(default = "default_recovery_cooldown")]
    pub recovery_cooldown_ms: u64,

    /// Wait after SIGTERM during restart before forcing a kill
    #[serde(default = "default_restart_grace")]
    pub restart_grace_ms: u64,

    /// Delay before restarting after an unexpected exit
    #[serde(default = "default_crash_restart_delay")]
    pub crash_restart_delay_ms: u64,

    /// Consecutive crash restarts allowed before giving up (0 = unlimited)
    #[serde(default = "default_crash_restart_limit")]
    pub crash_restart_limit: u32,

    /// Wait after SIGTERM during shutdown before SIGKILL
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for SupervisorTiming {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
            probe_timeout_ms: default_probe_timeout(),
            recovery_cooldown_ms: default_recovery_cooldown(),
            restart_grace_ms: default_restart_grace(),
            crash_restart_delay_ms: default_crash_restart_delay(),
            crash_restart_limit: default_crash_restart_limit(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl SupervisorTiming {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_millis(self.recovery_cooldown_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn crash_restart_delay(&self) -> Duration {
        Duration::from_millis(self.crash_restart_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_setup_path() -> String {
    "/setup".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_gateway_command() -> String {
    "node".to_string()
}

fn default_gateway_args() -> Vec<String> {
    vec!["/openclaw/dist/entry.js".to_string()]
}

fn default_trusted_proxies() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

fn default_probe_paths() -> Vec<String> {
    vec!["/openclaw".to_string(), "/".to_string(), "/health".to_string()]
}

fn default_lock_files() -> Vec<PathBuf> {
    vec![PathBuf::from("/tmp/openclaw-gateway.lock")]
}

fn default_origin_sync_interval() -> u64 {
    60
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    250
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_recovery_cooldown() -> u64 {
    5000
}

fn default_restart_grace() -> u64 {
    750
}

fn default_crash_restart_delay() -> u64 {
    2000
}

fn default_crash_restart_limit() -> u32 {
    10
}

fn default_shutdown_grace() -> u64 {
    2000
}

/// Split an env-style list on commas and whitespace
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay deployment environment variables on top of file/default values.
    ///
    /// `lookup` is normally `|k| std::env::var(k).ok()`; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));

        if let Some(port) = get("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid PORT: {}", port))?;
        }
        if let Some(path) = get("SETUP_PATH") {
            self.server.setup_path = path;
        }

        if let Some(host) = get("INTERNAL_GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("INTERNAL_GATEWAY_PORT") {
            self.gateway.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid INTERNAL_GATEWAY_PORT: {}", port))?;
        }
        if let Some(dir) = get("OPENCLAW_STATE_DIR") {
            self.gateway.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = get("OPENCLAW_WORKSPACE_DIR") {
            self.gateway.workspace_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = get("OPENCLAW_CONFIG_PATH") {
            self.gateway.config_path = Some(PathBuf::from(path));
        }
        if let Some(token) = get("OPENCLAW_GATEWAY_TOKEN") {
            self.gateway.token = Some(token);
        }
        if let Some(node) = get("OPENCLAW_NODE") {
            self.gateway.command = node;
        }
        if let Some(entry) = get("OPENCLAW_ENTRY") {
            self.gateway.args = vec![entry];
        }
        if let Some(flag) = get("OPENCLAW_DISABLE_DEVICE_AUTH") {
            self.gateway.disable_device_auth = flag.eq_ignore_ascii_case("true");
        }

        if let Some(list) = get("OPENCLAW_CONTROL_UI_ALLOWED_ORIGINS") {
            self.origins.allowed = split_list(&list);
        }
        if let Some(url) = get("OPENCLAW_PUBLIC_URL").or_else(|| get("PUBLIC_URL")) {
            self.origins.public_url = Some(url);
        }
        if let Some(domain) = get("RAILWAY_PUBLIC_DOMAIN") {
            self.origins.platform_domain = Some(domain);
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.gateway.port == 0 {
            errors.push("gateway 'port' must be greater than 0".to_string());
        }
        if self.gateway.command.trim().is_empty() {
            errors.push("gateway 'command' must not be empty".to_string());
        }
        if !self.server.setup_path.starts_with('/') {
            errors.push(format!(
                "server 'setup_path' must start with '/': {}",
                self.server.setup_path
            ));
        }
        if self.gateway.probe_paths.is_empty() {
            errors.push("gateway 'probe_paths' must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 3000
bind = "127.0.0.1"
setup_path = "/install"

[gateway]
port = 19000
command = "node"
args = ["/srv/gateway/entry.js"]
state_dir = "/data/state"
probe_paths = ["/health"]

[origins]
allowed = ["https://a.example.com"]
sync_interval_secs = 30

[timing]
startup_timeout_secs = 20
recovery_cooldown_ms = 1000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.setup_path, "/install");
        assert_eq!(config.gateway.port, 19000);
        assert_eq!(config.gateway.args, vec!["/srv/gateway/entry.js"]);
        assert_eq!(config.gateway.state_dir(), PathBuf::from("/data/state"));
        assert_eq!(config.origins.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.timing.startup_timeout(), Duration::from_secs(20));
        assert_eq!(config.timing.recovery_cooldown(), Duration::from_secs(1));
        // Untouched fields keep their defaults
        assert_eq!(config.timing.restart_grace(), Duration::from_millis(750));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.setup_path, "/setup");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.gateway.probe_paths, vec!["/openclaw", "/", "/health"]);
        assert_eq!(config.origins.sync_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_timing() {
        let timing = SupervisorTiming::default();
        assert_eq!(timing.startup_timeout(), Duration::from_secs(60));
        assert_eq!(timing.health_check_interval(), Duration::from_millis(250));
        assert_eq!(timing.recovery_cooldown(), Duration::from_secs(5));
        assert_eq!(timing.restart_grace(), Duration::from_millis(750));
        assert_eq!(timing.crash_restart_delay(), Duration::from_secs(2));
        assert_eq!(timing.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_derived_paths() {
        let gateway = GatewayConfig {
            state_dir: Some(PathBuf::from("/var/lib/gw")),
            ..GatewayConfig::default()
        };
        assert_eq!(gateway.workspace_dir(), PathBuf::from("/var/lib/gw/workspace"));
        assert_eq!(gateway.config_path(), PathBuf::from("/var/lib/gw/openclaw.json"));
        assert_eq!(gateway.token_path(), PathBuf::from("/var/lib/gw/gateway.token"));
        assert_eq!(
            gateway.stale_lock_files(),
            vec![
                PathBuf::from("/var/lib/gw/gateway.lock"),
                PathBuf::from("/tmp/openclaw-gateway.lock"),
            ]
        );
        assert_eq!(gateway.target(), "http://127.0.0.1:18789");
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("PORT", "9090"),
                ("INTERNAL_GATEWAY_PORT", "19999"),
                ("OPENCLAW_STATE_DIR", "/tmp/state"),
                ("OPENCLAW_GATEWAY_TOKEN", "  secret  "),
                ("OPENCLAW_ENTRY", "/opt/entry.js"),
                ("OPENCLAW_DISABLE_DEVICE_AUTH", "TRUE"),
                ("OPENCLAW_CONTROL_UI_ALLOWED_ORIGINS", "https://a.com, https://b.com  https://c.com"),
                ("PUBLIC_URL", "https://public.example.com"),
                ("RAILWAY_PUBLIC_DOMAIN", "app.up.railway.app"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.gateway.port, 19999);
        assert_eq!(config.gateway.state_dir(), PathBuf::from("/tmp/state"));
        assert_eq!(config.gateway.token.as_deref(), Some("secret"));
        assert_eq!(config.gateway.args, vec!["/opt/entry.js"]);
        assert!(config.gateway.disable_device_auth);
        assert_eq!(
            config.origins.allowed,
            vec!["https://a.com", "https://b.com", "https://c.com"]
        );
        assert_eq!(config.origins.public_url.as_deref(), Some("https://public.example.com"));
        assert_eq!(config.origins.platform_domain.as_deref(), Some("app.up.railway.app"));
    }

    #[test]
    fn test_apply_env_blank_values_ignored() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("OPENCLAW_GATEWAY_TOKEN", "   "), ("PORT", "")]))
            .unwrap();
        assert!(config.gateway.token.is_none());
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_apply_env_prefers_openclaw_public_url() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("OPENCLAW_PUBLIC_URL", "https://primary.example.com"),
                ("PUBLIC_URL", "https://secondary.example.com"),
            ]))
            .unwrap();
        assert_eq!(config.origins.public_url.as_deref(), Some("https://primary.example.com"));
    }

    #[test]
    fn test_apply_env_rejects_bad_port() {
        let mut config = Config::default();
        let result = config.apply_env(env(&[("PORT", "eighty")]));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid PORT"));
    }

    #[test]
    fn test_validate_rejects_zero_gateway_port() {
        let mut config = Config::default();
        config.gateway.port = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'port' must be greater than 0"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.gateway.command = " ".to_string();
        config.server.setup_path = "setup".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'command' must not be empty"));
        assert!(err.contains("'setup_path' must start with '/'"));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a,b c\n,d"), vec!["a", "b", "c", "d"]);
        assert!(split_list(" , ").is_empty());
    }

    #[test]
    fn test_is_configured_follows_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = GatewayConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..GatewayConfig::default()
        };
        assert!(!gateway.is_configured());
        std::fs::write(gateway.config_path(), "{}").unwrap();
        assert!(gateway.is_configured());
    }
}
