//! Subprocess client for the gateway's own command line
//!
//! Every invocation is `<program> <base args...> <subcommand...>` with the state
//! and workspace directories exported, so configuration writes land in the same
//! place the supervised gateway reads from.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Env var telling the gateway where its state lives
pub const STATE_DIR_ENV: &str = "OPENCLAW_STATE_DIR";
/// Env var telling the gateway where its workspace lives
pub const WORKSPACE_DIR_ENV: &str = "OPENCLAW_WORKSPACE_DIR";

/// Exit code reported when the subprocess could not be started
pub const SPAWN_FAILED_CODE: i32 = 127;
/// Exit code reported when the subprocess exceeded its budget
pub const TIMED_OUT_CODE: i32 = 124;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Exit code plus combined stdout/stderr of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Settings enforced before every gateway start
#[derive(Debug, Clone)]
pub struct CriticalSettings<'a> {
    pub token: &'a str,
    pub trusted_proxies: &'a [String],
    pub disable_device_auth: bool,
}

pub struct GatewayCli {
    program: String,
    base_args: Vec<String>,
    state_dir: PathBuf,
    workspace_dir: PathBuf,
    timeout: Duration,
    invocations: AtomicU64,
}

impl GatewayCli {
    pub fn new(
        program: impl Into<String>,
        base_args: Vec<String>,
        state_dir: PathBuf,
        workspace_dir: PathBuf,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            state_dir,
            workspace_dir,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &crate::config::GatewayConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.args.clone(),
            config.state_dir(),
            config.workspace_dir(),
        )
    }

    /// Override the per-invocation budget (builder pattern)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Number of subprocesses started through [`run`](Self::run)
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Build a command for `subcommand` with the gateway environment applied
    pub fn command<S: AsRef<str>>(&self, subcommand: &[S]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args);
        cmd.args(subcommand.iter().map(|s| s.as_ref()));
        cmd.env(STATE_DIR_ENV, &self.state_dir);
        cmd.env(WORKSPACE_DIR_ENV, &self.workspace_dir);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a subcommand to completion, capturing combined output.
    ///
    /// Never fails: spawn errors map to exit 127 and timeouts to exit 124,
    /// with a note appended to the output.
    pub async fn run<S: AsRef<str>>(&self, subcommand: &[S]) -> CommandOutput {
        let mut cmd = self.command(subcommand);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        self.invocations.fetch_add(1, Ordering::Relaxed);
        let first = subcommand.first().map(|s| s.as_ref()).unwrap_or("");
        debug!(program = %self.program, subcommand = first, "Running gateway command");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program, error = %e, "Failed to spawn gateway command");
                return CommandOutput {
                    code: SPAWN_FAILED_CODE,
                    output: format!("\n[spawn error] {}\n", e),
                };
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => {
                let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
                output.push_str(&String::from_utf8_lossy(&out.stderr));
                CommandOutput {
                    code: out.status.code().unwrap_or(-1),
                    output,
                }
            }
            Ok(Err(e)) => CommandOutput {
                code: -1,
                output: format!("\n[wait error] {}\n", e),
            },
            Err(_) => {
                warn!(
                    program = %self.program,
                    subcommand = first,
                    timeout_secs = self.timeout.as_secs(),
                    "Gateway command timed out"
                );
                CommandOutput {
                    code: TIMED_OUT_CODE,
                    output: format!("\n[timed out after {}s]\n", self.timeout.as_secs()),
                }
            }
        }
    }

    /// `config set <key> <value>`
    pub async fn config_set(&self, key: &str, value: &str) -> CommandOutput {
        self.run(&["config", "set", key, value]).await
    }

    /// `config set --json <key> <json>`
    pub async fn config_set_json(&self, key: &str, json: &str) -> CommandOutput {
        self.run(&["config", "set", "--json", key, json]).await
    }

    /// `doctor --fix`, run once at boot
    pub async fn doctor_fix(&self) -> CommandOutput {
        self.run(&["doctor", "--fix"]).await
    }

    /// Push auth, proxy-trust and control UI settings, one `config set` each.
    ///
    /// Returns true when every call succeeded. Failures are logged only.
    pub async fn enforce_settings(&self, settings: &CriticalSettings<'_>) -> bool {
        let trusted = serde_json::to_string(settings.trusted_proxies)
            .unwrap_or_else(|_| "[]".to_string());
        let device_auth = settings.disable_device_auth.to_string();

        let steps: [(&str, &str, &str, bool); 5] = [
            ("gateway.controlUi.allowInsecureAuth", "true", "true", false),
            ("gateway.controlUi.dangerouslyDisableDeviceAuth", &device_auth, &device_auth, false),
            ("gateway.auth.mode", "token", "token", false),
            ("gateway.auth.token", settings.token, "[REDACTED]", false),
            ("gateway.trustedProxies", &trusted, &trusted, true),
        ];

        let mut all_ok = true;
        for (key, value, shown, json) in steps {
            let result = if json {
                self.config_set_json(key, value).await
            } else {
                self.config_set(key, value).await
            };

            if result.success() {
                debug!(key, value = shown, "Gateway setting applied");
            } else {
                all_ok = false;
                warn!(
                    key,
                    code = result.code,
                    output = %truncate_output(&result.output, 500),
                    "Failed to apply gateway setting"
                );
            }
        }

        if all_ok {
            info!("Critical gateway settings enforced");
        }
        all_ok
    }
}

/// Trim and cap command output for logging
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let text = output.trim();
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}\n...(truncated {} chars)", head, total - max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A CLI whose "program" is a shell script; `$@` holds the subcommand
    fn script_cli(dir: &std::path::Path, script: &str) -> GatewayCli {
        GatewayCli::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "gateway-cli".to_string()],
            dir.join("state"),
            dir.join("workspace"),
        )
    }

    #[tokio::test]
    async fn test_run_captures_exit_code_and_combined_output() {
        let dir = tempfile::tempdir().unwrap();
        let cli = script_cli(dir.path(), "echo out:$1; echo err:$2 >&2; exit 3");

        let result = cli.run(&["first", "second"]).await;
        assert_eq!(result.code, 3);
        assert!(!result.success());
        assert!(result.output.contains("out:first"));
        assert!(result.output.contains("err:second"));
        assert_eq!(cli.invocations(), 1);
    }

    #[tokio::test]
    async fn test_run_exports_state_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cli = script_cli(dir.path(), "echo \"$OPENCLAW_STATE_DIR|$OPENCLAW_WORKSPACE_DIR\"");

        let result = cli.run::<&str>(&[]).await;
        assert!(result.success());
        let expected = format!(
            "{}|{}",
            dir.path().join("state").display(),
            dir.path().join("workspace").display()
        );
        assert_eq!(result.output.trim(), expected);
    }

    #[tokio::test]
    async fn test_spawn_failure_maps_to_127() {
        let dir = tempfile::tempdir().unwrap();
        let cli = GatewayCli::new(
            "/nonexistent/gateway-binary",
            Vec::new(),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        );

        let result = cli.run(&["--version"]).await;
        assert_eq!(result.code, SPAWN_FAILED_CODE);
        assert!(result.output.contains("[spawn error]"));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_124() {
        let dir = tempfile::tempdir().unwrap();
        let cli = script_cli(dir.path(), "sleep 5").with_timeout(Duration::from_millis(100));

        let result = cli.run::<&str>(&[]).await;
        assert_eq!(result.code, TIMED_OUT_CODE);
    }

    #[tokio::test]
    async fn test_config_set_json_argument_order() {
        let dir = tempfile::tempdir().unwrap();
        let cli = script_cli(dir.path(), "echo \"$@\"");

        let result = cli
            .config_set_json("gateway.controlUi.allowedOrigins", "[\"https://a.com\"]")
            .await;
        assert_eq!(
            result.output.trim(),
            "config set --json gateway.controlUi.allowedOrigins [\"https://a.com\"]"
        );
    }

    #[tokio::test]
    async fn test_enforce_settings_issues_each_key() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let script = format!("echo \"$@\" >> {}", log.display());
        let cli = script_cli(dir.path(), &script);

        let proxies = vec!["127.0.0.1".to_string(), "::1".to_string()];
        let ok = cli
            .enforce_settings(&CriticalSettings {
                token: "tok",
                trusted_proxies: &proxies,
                disable_device_auth: true,
            })
            .await;
        assert!(ok);

        let calls = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines.contains(&"config set gateway.auth.mode token"));
        assert!(lines.contains(&"config set gateway.auth.token tok"));
        assert!(lines.contains(&"config set gateway.controlUi.dangerouslyDisableDeviceAuth true"));
        assert!(lines.contains(&"config set --json gateway.trustedProxies [\"127.0.0.1\",\"::1\"]"));
    }

    #[tokio::test]
    async fn test_enforce_settings_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cli = script_cli(dir.path(), "exit 1");
        let ok = cli
            .enforce_settings(&CriticalSettings {
                token: "tok",
                trusted_proxies: &[],
                disable_device_auth: false,
            })
            .await;
        assert!(!ok);
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("  short  ", 10), "short");
        assert_eq!(truncate_output("abcdefgh", 3), "abc\n...(truncated 5 chars)");
        assert_eq!(truncate_output("", 3), "");
    }
}
