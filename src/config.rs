//! Sync client configuration parsed from environment variables.
//!
//! Every setting has a default; `from_env` only overrides what is present.
//! Unparseable numbers are errors, never silent fallbacks.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::MessageType;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_TOPIC: &str = "/topic/diagram";
pub const DEFAULT_ERROR_QUEUE: &str = "/user/queue/errors";
pub const DEFAULT_DESTINATION_PREFIX: &str = "/app/diagram";

pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_HEARTBEAT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_PENDING_TTL_MS: u64 = 30_000;
pub const DEFAULT_PENDING_CAPACITY: usize = 1_000;

pub const DEFAULT_DRAG_THRESHOLD_PX: f64 = 5.0;
pub const DEFAULT_DRAG_THROTTLE_MS: u64 = 50;
pub const DEFAULT_DRAG_DEBOUNCE_MS: u64 = 250;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}")]
    Invalid { var: &'static str, value: String },
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Broker endpoint, subscriptions, and reconnect policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub url: String,
    /// Virtual host announced in the STOMP `CONNECT` frame.
    pub host: String,
    pub topic: String,
    pub error_queue: String,
    pub destination_prefix: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_attempts: u32,
    /// Zero disables heart-beating.
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Send destination for one message kind.
    #[must_use]
    pub fn destination(&self, kind: MessageType) -> String {
        kind.destination_under(&self.destination_prefix)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_owned(),
            host: "localhost".to_owned(),
            topic: DEFAULT_TOPIC.to_owned(),
            error_queue: DEFAULT_ERROR_QUEUE.to_owned(),
            destination_prefix: DEFAULT_DESTINATION_PREFIX.to_owned(),
            reconnect_base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Echo tracking window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_millis(DEFAULT_PENDING_TTL_MS), capacity: DEFAULT_PENDING_CAPACITY }
    }
}

/// Drag gesture coalescing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragConfig {
    /// Movement from the start position beyond which a gesture counts as a drag.
    pub threshold_px: f64,
    pub throttle: Duration,
    pub debounce: Duration,
}

impl Default for DragConfig {
    fn default() -> Self {
        Self {
            threshold_px: DEFAULT_DRAG_THRESHOLD_PX,
            throttle: Duration::from_millis(DEFAULT_DRAG_THROTTLE_MS),
            debounce: Duration::from_millis(DEFAULT_DRAG_DEBOUNCE_MS),
        }
    }
}

/// Request/response bootstrap service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self { base_url: DEFAULT_HTTP_URL.to_owned(), timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS) }
    }
}

// =============================================================================
// SYNC CONFIG
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub pending: PendingConfig,
    pub drag: DragConfig,
    pub bootstrap: BootstrapConfig,
    /// Where connector side assignments are persisted. `None` keeps them in memory.
    pub handles_path: Option<PathBuf>,
}

impl SyncConfig {
    /// Build config from `ERDSYNC_*` environment variables over the defaults.
    ///
    /// Optional:
    /// - `ERDSYNC_WS_URL`, `ERDSYNC_HTTP_URL`, `ERDSYNC_STOMP_HOST`
    /// - `ERDSYNC_TOPIC`, `ERDSYNC_ERROR_QUEUE`, `ERDSYNC_DESTINATION_PREFIX`
    /// - `ERDSYNC_RECONNECT_BASE_MS`, `ERDSYNC_RECONNECT_MAX_MS`, `ERDSYNC_RECONNECT_MAX_ATTEMPTS`
    /// - `ERDSYNC_HEARTBEAT_MS`, `ERDSYNC_CONNECT_TIMEOUT_SECS`
    /// - `ERDSYNC_PENDING_TTL_MS`, `ERDSYNC_PENDING_CAPACITY`
    /// - `ERDSYNC_DRAG_THRESHOLD_PX`, `ERDSYNC_DRAG_THROTTLE_MS`, `ERDSYNC_DRAG_DEBOUNCE_MS`
    /// - `ERDSYNC_HTTP_TIMEOUT_SECS`, `ERDSYNC_HANDLES_PATH`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first variable that fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let connection = ConnectionConfig {
            url: env_string("ERDSYNC_WS_URL").unwrap_or(defaults.connection.url),
            host: env_string("ERDSYNC_STOMP_HOST").unwrap_or(defaults.connection.host),
            topic: env_string("ERDSYNC_TOPIC").unwrap_or(defaults.connection.topic),
            error_queue: env_string("ERDSYNC_ERROR_QUEUE").unwrap_or(defaults.connection.error_queue),
            destination_prefix: env_string("ERDSYNC_DESTINATION_PREFIX")
                .unwrap_or(defaults.connection.destination_prefix),
            reconnect_base: Duration::from_millis(env_parse("ERDSYNC_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)?),
            reconnect_max: Duration::from_millis(env_parse("ERDSYNC_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)?),
            max_attempts: env_parse("ERDSYNC_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS)?,
            heartbeat: Duration::from_millis(env_parse("ERDSYNC_HEARTBEAT_MS", DEFAULT_HEARTBEAT_MS)?),
            connect_timeout: Duration::from_secs(env_parse(
                "ERDSYNC_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?),
        };
        let pending = PendingConfig {
            ttl: Duration::from_millis(env_parse("ERDSYNC_PENDING_TTL_MS", DEFAULT_PENDING_TTL_MS)?),
            capacity: env_parse("ERDSYNC_PENDING_CAPACITY", DEFAULT_PENDING_CAPACITY)?,
        };
        let drag = DragConfig {
            threshold_px: env_parse("ERDSYNC_DRAG_THRESHOLD_PX", DEFAULT_DRAG_THRESHOLD_PX)?,
            throttle: Duration::from_millis(env_parse("ERDSYNC_DRAG_THROTTLE_MS", DEFAULT_DRAG_THROTTLE_MS)?),
            debounce: Duration::from_millis(env_parse("ERDSYNC_DRAG_DEBOUNCE_MS", DEFAULT_DRAG_DEBOUNCE_MS)?),
        };
        let bootstrap = BootstrapConfig {
            base_url: env_string("ERDSYNC_HTTP_URL")
                .map_or(defaults.bootstrap.base_url, |url| url.trim_end_matches('/').to_owned()),
            timeout: Duration::from_secs(env_parse("ERDSYNC_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?),
        };
        let handles_path = env_string("ERDSYNC_HANDLES_PATH").map(PathBuf::from);

        Ok(Self { connection, pending, drag, bootstrap, handles_path })
    }
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    let Some(raw) = env_string(key) else {
        return Ok(default);
    };
    raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid { var: key, value: raw })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
