//! Bus Configuration
//!
//! Configuration for the socket listener, frame limits and queue sizes.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (daemon only)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - Config file: `$XDG_CONFIG_HOME/socketbus/socketbus.toml`
//! - Socket: `$XDG_RUNTIME_DIR/socketbus/bus.sock`, falling back to
//!   `/tmp/socketbus-$UID/bus.sock`
//!
//! # Example Configuration
//!
//! ```toml
//! socket_path = "/run/user/1000/socketbus/bus.sock"
//! max_message_size = 1048576
//! idle_timeout_ms = 300000
//! message_timeout_ms = 3000
//! graceful_timeout_ms = 10000
//! inbound_queue_capacity = 10
//! outbound_queue_capacity = 10
//! pending_backlog = 64
//! application_queue_capacity = 256
//! enforce_peer_uid = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::connection::{ConnectionOptions, DEFAULT_QUEUE_CAPACITY};
use crate::transport::frame::{FrameLimits, DEFAULT_MAX_MESSAGE_SIZE};

/// Environment variable overriding the socket path
pub const ENV_SOCKET: &str = "SOCKETBUS_SOCKET";
/// Environment variable overriding the maximum message size
pub const ENV_MAX_MESSAGE_SIZE: &str = "SOCKETBUS_MAX_MESSAGE_SIZE";
/// Environment variable overriding the idle timeout (ms)
pub const ENV_IDLE_TIMEOUT_MS: &str = "SOCKETBUS_IDLE_TIMEOUT_MS";
/// Environment variable overriding the message timeout (ms)
pub const ENV_MESSAGE_TIMEOUT_MS: &str = "SOCKETBUS_MESSAGE_TIMEOUT_MS";
/// Environment variable overriding the graceful shutdown deadline (ms)
pub const ENV_GRACEFUL_TIMEOUT_MS: &str = "SOCKETBUS_GRACEFUL_TIMEOUT_MS";

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Runtime configuration for one bus instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Unix socket path to bind
    pub socket_path: PathBuf,

    /// Largest accepted payload in bytes
    pub max_message_size: usize,

    /// Max wait for the start of the next frame, in milliseconds
    pub idle_timeout_ms: u64,

    /// Max wait to finish one started frame, in milliseconds
    pub message_timeout_ms: u64,

    /// Max wait for connections to finish during shutdown, in milliseconds
    pub graceful_timeout_ms: u64,

    /// Per-connection inbound queue capacity
    pub inbound_queue_capacity: usize,

    /// Per-connection outbound queue capacity
    pub outbound_queue_capacity: usize,

    /// Accepted connections waiting for registration
    pub pending_backlog: usize,

    /// Capacity of the shared application-facing inbound queue
    pub application_queue_capacity: usize,

    /// Reject peers running as another non-root user
    pub enforce_peer_uid: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout_ms: 5 * 60 * 1000,
            message_timeout_ms: 3000,
            graceful_timeout_ms: 10_000,
            inbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pending_backlog: 64,
            application_queue_capacity: 256,
            enforce_peer_uid: true,
        }
    }
}

impl BusConfig {
    /// Default configuration bound to a specific socket path
    #[must_use]
    pub fn with_socket_path(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Parse configuration from TOML text; missing keys take defaults
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ParseError` on malformed TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `SOCKETBUS_*` overrides from the process environment
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a variable is not a number.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a variable is not a number.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_SOCKET) {
            self.socket_path = PathBuf::from(path);
        }
        if let Some(v) = parse_env(&lookup, ENV_MAX_MESSAGE_SIZE)? {
            self.max_message_size = v;
        }
        if let Some(v) = parse_env(&lookup, ENV_IDLE_TIMEOUT_MS)? {
            self.idle_timeout_ms = v;
        }
        if let Some(v) = parse_env(&lookup, ENV_MESSAGE_TIMEOUT_MS)? {
            self.message_timeout_ms = v;
        }
        if let Some(v) = parse_env(&lookup, ENV_GRACEFUL_TIMEOUT_MS)? {
            self.graceful_timeout_ms = v;
        }
        Ok(())
    }

    /// Check that the configuration can run a bus
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "socket_path must not be empty".to_string(),
            ));
        }
        if self.max_message_size == 0 || u32::try_from(self.max_message_size).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "max_message_size must be between 1 and {} bytes",
                u32::MAX
            )));
        }

        for (name, value) in [
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("message_timeout_ms", self.message_timeout_ms),
            ("graceful_timeout_ms", self.graceful_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.message_timeout_ms > self.idle_timeout_ms {
            return Err(ConfigError::ValidationError(format!(
                "message_timeout_ms ({}) must not exceed idle_timeout_ms ({})",
                self.message_timeout_ms, self.idle_timeout_ms
            )));
        }

        for (name, value) in [
            ("inbound_queue_capacity", self.inbound_queue_capacity),
            ("outbound_queue_capacity", self.outbound_queue_capacity),
            ("pending_backlog", self.pending_backlog),
            ("application_queue_capacity", self.application_queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        Ok(())
    }

    /// Idle timeout as a `Duration`
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Message timeout as a `Duration`
    #[must_use]
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Graceful shutdown deadline as a `Duration`
    #[must_use]
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    /// Frame limits derived from this configuration
    #[must_use]
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_message_size: self.max_message_size,
            idle_timeout: self.idle_timeout(),
            message_timeout: self.message_timeout(),
        }
    }

    /// Per-connection options derived from this configuration
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            limits: self.frame_limits(),
            inbound_capacity: self.inbound_queue_capacity,
            outbound_capacity: self.outbound_queue_capacity,
        }
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ConfigError::ValidationError(format!("{key} must be a non-negative integer, got {raw:?}"))
        }),
    }
}

/// Get the default socket path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/socketbus-$UID/`
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("socketbus").join("bus.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/socketbus-{uid}/bus.sock"))
    }
}

/// Get the default configuration file path
///
/// Returns `None` when no config directory can be determined.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("socketbus").join("socketbus.toml"))
}

/// Load configuration from a file, then apply environment overrides
///
/// With `path = None` the default config path is used, and a missing file
/// there just means defaults. An explicitly given path must exist.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read or parsed, an
/// environment override is malformed, or the result fails validation.
pub fn load_config(path: Option<&Path>) -> Result<BusConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config_from_path(path)?,
        None => match default_config_path() {
            Some(default) if default.exists() => load_config_from_path(&default)?,
            _ => BusConfig::default(),
        },
    };

    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Parse a TOML configuration file without overrides or validation
///
/// # Errors
///
/// Returns `ConfigError::ReadError` or `ConfigError::ParseError`.
pub fn load_config_from_path(path: &Path) -> Result<BusConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = ?path, "Loaded config file");
    BusConfig::from_toml_str(&content)
}
