//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_DUPLICATE_SWEEP_SECS, DEFAULT_DUPLICATE_WINDOW_SECS, DEFAULT_HISTORY_LIMIT,
    DEFAULT_HTTP_PORT, MAX_DUPLICATE_WINDOW_SECS, MAX_HISTORY_LIMIT, MAX_SWEEP_WINDOW_RATIO,
    MIN_DUPLICATE_WINDOW_SECS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// How long an identical (sender, receiver, text) send is treated as a
    /// retry of the first one.
    /// Env: `DUPLICATE_WINDOW_SECS`
    /// Default: `5` (held to 5..=10)
    pub duplicate_window: Duration,

    /// How often expired duplicate entries are swept. Never more than
    /// three windows.
    /// Env: `DUPLICATE_SWEEP_SECS`
    /// Default: `10`
    pub duplicate_sweep: Duration,

    /// Whether one user may hold several live connections at once. When
    /// disabled, binding a new connection displaces the previous one.
    /// Env: `MULTI_DEVICE` (true/false)
    /// Default: `true`
    pub multi_device: bool,

    /// Default page size for history requests that do not set `limit`.
    /// Env: `HISTORY_PAGE_LIMIT`
    /// Default: `50` (capped at 200)
    pub history_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            duplicate_window: Duration::from_secs(DEFAULT_DUPLICATE_WINDOW_SECS),
            duplicate_sweep: Duration::from_secs(DEFAULT_DUPLICATE_SWEEP_SECS),
            multi_device: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(secs) = parse_secs("DUPLICATE_WINDOW_SECS") {
            config.duplicate_window = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_secs("DUPLICATE_SWEEP_SECS") {
            config.duplicate_sweep = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MULTI_DEVICE") {
            config.multi_device = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("HISTORY_PAGE_LIMIT") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.history_limit = n.min(MAX_HISTORY_LIMIT),
                _ => tracing::warn!(value = %val, "Invalid HISTORY_PAGE_LIMIT, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config.normalized()
    }

    /// Hold the window to its accepted range, then clamp the sweep interval
    /// so that expired entries never outlive `MAX_SWEEP_WINDOW_RATIO` windows.
    pub fn normalized(mut self) -> Self {
        let min_window = Duration::from_secs(MIN_DUPLICATE_WINDOW_SECS);
        let max_window = Duration::from_secs(MAX_DUPLICATE_WINDOW_SECS);
        let window = self.duplicate_window.clamp(min_window, max_window);
        if window != self.duplicate_window {
            tracing::warn!(
                window_secs = self.duplicate_window.as_secs(),
                clamped_secs = window.as_secs(),
                "DUPLICATE_WINDOW_SECS out of range, clamping"
            );
            self.duplicate_window = window;
        }

        let max_sweep = u32::try_from(MAX_SWEEP_WINDOW_RATIO)
            .ok()
            .and_then(|ratio| self.duplicate_window.checked_mul(ratio))
            .unwrap_or(Duration::MAX);
        if self.duplicate_sweep > max_sweep {
            tracing::warn!(
                sweep_secs = self.duplicate_sweep.as_secs(),
                max_secs = max_sweep.as_secs(),
                "DUPLICATE_SWEEP_SECS too large for the window, clamping"
            );
            self.duplicate_sweep = max_sweep;
        }
        self
    }
}

/// Parse a positive whole number of seconds from `var`.
fn parse_secs(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(var, value = %raw, "Expected a positive number of seconds, using default");
            None
        }
    }
}
