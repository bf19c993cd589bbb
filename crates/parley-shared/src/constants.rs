/// Application name
pub const APP_NAME: &str = "Parley";

/// Maximum message text length, in characters
pub const MAX_TEXT_CHARS: usize = 1000;

/// Default duplicate-send suppression window in seconds
pub const DEFAULT_DUPLICATE_WINDOW_SECS: u64 = 5;

/// Accepted range for the duplicate window in seconds
pub const MIN_DUPLICATE_WINDOW_SECS: u64 = 5;
pub const MAX_DUPLICATE_WINDOW_SECS: u64 = 10;

/// Default sweep interval for expired duplicate entries in seconds
pub const DEFAULT_DUPLICATE_SWEEP_SECS: u64 = 10;

/// The sweep may lag the window by at most this factor
pub const MAX_SWEEP_WINDOW_RATIO: u64 = 3;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default page size for conversation history
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Upper bound on a single history page
pub const MAX_HISTORY_LIMIT: u32 = 200;
