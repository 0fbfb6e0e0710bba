//! Server descriptors and connection policy

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Hard ceiling on concurrent sessions, applied regardless of configuration
pub const HARD_MAX_SESSIONS: usize = 10;

/// Upper bound for the doubling retry backoff
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// A configured remote server
///
/// Owned by configuration storage; a running session keeps its own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Stable identifier from configuration storage
    #[serde(default)]
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication mode
    #[serde(default)]
    pub auth_mode: AuthMode,

    /// Path to private key file (key mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,

    /// Prefer the SSH agent even when a key path is configured
    #[serde(default)]
    pub use_agent: bool,
}

/// Authentication modes supported by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// SSH agent authentication
    #[default]
    Agent,
    /// Private key file
    Key,
}

impl ServerDescriptor {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            id: String::new(),
            name: host.clone(),
            host,
            port,
            username: username.into(),
            auth_mode: AuthMode::Agent,
            key_path: None,
            use_agent: false,
        }
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.auth_mode = AuthMode::Key;
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.auth_mode = AuthMode::Agent;
        self.use_agent = true;
        self
    }

    /// `host:port` form used for dialing and logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the agent should be used for this server
    pub fn wants_agent(&self) -> bool {
        self.use_agent || self.auth_mode == AuthMode::Agent
    }
}

/// Per-manager connection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    /// Maximum concurrent sessions (clamped to [`HARD_MAX_SESSIONS`])
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Keepalive interval in seconds, 0 disables the keepalive ticker
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Retries after the first failed connection attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled after every attempt
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// known_hosts file (default: ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    /// Reject hosts missing from known_hosts instead of learning them
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// Maximum I/O log entries kept per session
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// Health probe interval in milliseconds
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
}

fn default_port() -> u16 {
    22
}

fn default_max_sessions() -> usize {
    HARD_MAX_SESSIONS
}

fn default_keepalive() -> u64 {
    30
}

fn default_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_log_entries() -> usize {
    10_000
}

fn default_health_interval_ms() -> u64 {
    10_000
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            keepalive_interval_secs: default_keepalive(),
            connect_timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_backoff_ms(),
            known_hosts_path: None,
            strict_host_key_checking: false,
            max_log_entries: default_max_log_entries(),
            health_interval_ms: default_health_interval_ms(),
        }
    }
}

impl ConnectionPolicy {
    /// Parse a policy from JSON; absent fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, SshError> {
        serde_json::from_str(json)
            .map_err(|e| SshError::ConnectionFailed(format!("Invalid connection policy: {}", e)))
    }

    /// Load a policy file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SshError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn effective_max_sessions(&self) -> usize {
        self.max_sessions.min(HARD_MAX_SESSIONS)
    }

    /// `None` when the keepalive ticker is disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.known_hosts_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".ssh").join("known_hosts"))
                .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"))
        })
    }
}
