//! Gateway auth token: env override, persisted file, or freshly generated

use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Random bytes in a generated token (hex encoded, so twice as many chars)
const TOKEN_BYTES: usize = 32;

/// Where the token came from, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Override,
    Persisted,
    Generated,
}

/// Resolves the gateway token once and hands out the same value afterwards.
pub struct TokenStore {
    path: PathBuf,
    override_token: Option<String>,
    resolved: OnceLock<(String, TokenSource)>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>, override_token: Option<String>) -> Self {
        Self {
            path: path.into(),
            override_token: override_token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            resolved: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the token, creating and persisting one on first use.
    ///
    /// Read and write failures are logged, never fatal: a token that could
    /// not be persisted is still valid for this process lifetime.
    pub fn get_or_create(&self) -> &str {
        &self.resolve().0
    }

    pub fn source(&self) -> TokenSource {
        self.resolve().1
    }

    fn resolve(&self) -> &(String, TokenSource) {
        self.resolved.get_or_init(|| {
            if let Some(token) = &self.override_token {
                return (token.clone(), TokenSource::Override);
            }

            match std::fs::read_to_string(&self.path) {
                Ok(existing) if !existing.trim().is_empty() => {
                    return (existing.trim().to_string(), TokenSource::Persisted);
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Could not read existing gateway token");
                }
            }

            let token = generate_token();
            match persist(&self.path, &token) {
                Ok(()) => info!(path = %self.path.display(), "Generated and persisted gateway token"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Could not persist gateway token"),
            }
            (token, TokenSource::Generated)
        })
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn persist(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(token.as_bytes())?;
    file.sync_all()
}
