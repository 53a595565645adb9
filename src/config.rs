//! Engine configuration
//!
//! Every section has compiled defaults, so an empty JSON object (or no file
//! at all) yields a working engine:
//!
//! ```json
//! {
//!   "ws": { "listen": "127.0.0.1:0", "ping_interval_secs": 30 },
//!   "session": { "high_watermark": 102400, "low_watermark": 20480 },
//!   "pool": { "idle_ttl_secs": 300, "keepalive_interval_secs": 15 },
//!   "tunnel": { "buffer_size": 32768 },
//!   "local_shell": { "program": "/bin/zsh", "args": ["--login"] },
//!   "log_filter": "oxide_remote=debug"
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flow-control HIGH watermark (100 KiB of queued, unflushed output)
pub const DEFAULT_HIGH_WATERMARK: usize = 100 * 1024;
/// Flow-control LOW watermark (20 KiB)
pub const DEFAULT_LOW_WATERMARK: usize = 20 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub local_shell: LocalShellConfig,
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
}

impl EngineConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        if s.low_watermark >= s.high_watermark {
            return Err(ConfigError::Invalid(format!(
                "session.low_watermark ({}) must be below session.high_watermark ({})",
                s.low_watermark, s.high_watermark
            )));
        }
        if s.ring_capacity_lines == 0 || s.ring_capacity_bytes == 0 || s.max_line_bytes == 0 {
            return Err(ConfigError::Invalid(
                "session ring buffer limits must be non-zero".into(),
            ));
        }
        if s.output_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session.output_queue_capacity must be non-zero".into(),
            ));
        }
        if self.ws.ping_interval_secs == 0 || self.ws.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ws intervals must be non-zero".into()));
        }
        if self.pool.sweep_interval_secs == 0 || self.pool.keepalive_interval_secs == 0 {
            return Err(ConfigError::Invalid("pool intervals must be non-zero".into()));
        }
        if s.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.sweep_interval_secs must be non-zero".into(),
            ));
        }
        if self.tunnel.buffer_size == 0 || self.tunnel.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.buffer_size and tunnel.idle_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Terminal WebSocket server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    /// Bind address; port 0 lets the OS pick
    #[serde(default = "default_ws_listen")]
    pub listen: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Connection is dropped when nothing (including pong) arrives within this window
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// How long a fresh connection may take to send `TermSetSessionId`
    /// before a session is opened implicitly
    #[serde(default = "default_bind_timeout_ms")]
    pub session_bind_timeout_ms: u64,
}

fn default_ws_listen() -> String {
    "127.0.0.1:0".to_string()
}
fn default_ping_interval() -> u64 {
    30
}
fn default_read_timeout() -> u64 {
    90
}
fn default_send_timeout() -> u64 {
    5
}
fn default_bind_timeout_ms() -> u64 {
    2000
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            listen: default_ws_listen(),
            ping_interval_secs: default_ping_interval(),
            read_timeout_secs: default_read_timeout(),
            send_timeout_secs: default_send_timeout(),
            session_bind_timeout_ms: default_bind_timeout_ms(),
        }
    }
}

impl WsConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn session_bind_timeout(&self) -> Duration {
        Duration::from_millis(self.session_bind_timeout_ms)
    }
}

/// Terminal session, flow control and ring buffer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    #[serde(default = "default_ring_lines")]
    pub ring_capacity_lines: usize,
    #[serde(default = "default_ring_bytes")]
    pub ring_capacity_bytes: usize,
    /// Longer lines are split into several ring entries
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_grace_secs")]
    pub reconnect_grace_secs: u64,
    #[serde(default = "default_session_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// Chunks buffered between a transport reader and its session
    #[serde(default = "default_output_queue")]
    pub output_queue_capacity: usize,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    #[serde(default = "default_max_request_lines")]
    pub max_output_request_lines: usize,
}

fn default_high_watermark() -> usize {
    DEFAULT_HIGH_WATERMARK
}
fn default_low_watermark() -> usize {
    DEFAULT_LOW_WATERMARK
}
fn default_ring_lines() -> usize {
    5000
}
fn default_ring_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_max_line_bytes() -> usize {
    8 * 1024
}
fn default_grace_secs() -> u64 {
    30
}
fn default_session_sweep_secs() -> u64 {
    5
}
fn default_output_queue() -> usize {
    64
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_max_request_lines() -> usize {
    10_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            ring_capacity_lines: default_ring_lines(),
            ring_capacity_bytes: default_ring_bytes(),
            max_line_bytes: default_max_line_bytes(),
            reconnect_grace_secs: default_grace_secs(),
            sweep_interval_secs: default_session_sweep_secs(),
            output_queue_capacity: default_output_queue(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            max_output_request_lines: default_max_request_lines(),
        }
    }
}

impl SessionConfig {
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }
}

/// SSH connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Unreferenced connections older than this are closed by the sweep
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_pool_sweep_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_secs: u64,
    /// Consecutive keepalive misses before a connection is marked Dead
    #[serde(default = "default_keepalive_failures")]
    pub keepalive_max_failures: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// russh protocol-level keepalive
    #[serde(default = "default_ssh_keepalive")]
    pub ssh_keepalive_secs: u64,
    /// 0 = unlimited
    #[serde(default)]
    pub max_connections: usize,
}

fn default_idle_ttl() -> u64 {
    300
}
fn default_pool_sweep_secs() -> u64 {
    30
}
fn default_keepalive_interval() -> u64 {
    15
}
fn default_keepalive_timeout() -> u64 {
    5
}
fn default_keepalive_failures() -> u32 {
    2
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_ssh_keepalive() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_pool_sweep_secs(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_timeout_secs: default_keepalive_timeout(),
            keepalive_max_failures: default_keepalive_failures(),
            connect_timeout_secs: default_connect_timeout(),
            ssh_keepalive_secs: default_ssh_keepalive(),
            max_connections: 0,
        }
    }
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Port-forwarding relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// A relayed connection with no traffic in either direction for this long is closed
    #[serde(default = "default_tunnel_idle")]
    pub idle_timeout_secs: u64,
}

fn default_buffer_size() -> usize {
    32 * 1024
}
fn default_tunnel_idle() -> u64 {
    300
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            idle_timeout_secs: default_tunnel_idle(),
        }
    }
}

impl TunnelConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Local shell overrides; unset fields fall back to `$SHELL --login`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalShellConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}
