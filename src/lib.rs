//! Gatewarden - A supervising reverse proxy for a single gateway process
//!
//! This library keeps one long-lived gateway child alive behind a public
//! HTTP endpoint:
//! - Spawns the gateway on demand and waits until it answers a probe
//! - Collapses concurrent start requests into a single spawn
//! - Recovers from refused connections with a cooldown and restarts after crashes
//! - Keeps the gateway's allowed CORS origins in sync with the public hostname
//! - Forwards HTTP and WebSocket traffic with an injected bearer token

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod origins;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod token;

/// Crate version, shown in the startup banner and health output
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
