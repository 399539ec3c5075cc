//! Proxy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tunnel::{Security, TunnelCredentials};

/// Default local SOCKS5 listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9000";

/// Timeouts and buffer sizing for one relayed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Limit for dialing the remote endpoint
    pub dial_timeout: Duration,
    /// Limit for each individual read and each individual write
    pub io_timeout: Duration,
    /// Absolute session cap, measured from the start of relaying
    pub session_lifetime: Duration,
    /// Copy buffer size per direction
    pub buffer_size: usize,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(5),
            session_lifetime: Duration::from_secs(60),
            buffer_size: 256,
        }
    }
}

impl RelayPolicy {
    /// Validate the policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.dial_timeout.is_zero() {
            return Err("dial_timeout must be positive".into());
        }
        if self.io_timeout.is_zero() {
            return Err("io_timeout must be positive".into());
        }
        if self.session_lifetime.is_zero() {
            return Err("session_lifetime must be positive".into());
        }
        if self.buffer_size == 0 {
            return Err("buffer_size must be positive".into());
        }
        Ok(())
    }
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local SOCKS5 listen address
    pub listen_addr: String,
    /// Fixed remote tunnel endpoint (`host:port`)
    pub remote_addr: String,
    /// Credentials passed to the tunnel
    pub credentials: TunnelCredentials,
    /// Per-session relay policy
    pub policy: RelayPolicy,
    /// Maximum concurrent sessions; `None` admits everything
    pub max_sessions: Option<usize>,
    /// Send SOCKS5 failure replies instead of closing silently
    pub strict_replies: bool,
}

impl ProxyConfig {
    /// Create a configuration with the default policy.
    pub fn new(
        listen_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        credentials: TunnelCredentials,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            remote_addr: remote_addr.into().trim().to_string(),
            credentials,
            policy: RelayPolicy::default(),
            max_sessions: None,
            strict_replies: false,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr cannot be empty".into());
        }
        if self.remote_addr.trim().is_empty() {
            return Err("remote_addr cannot be empty".into());
        }
        if self.max_sessions == Some(0) {
            return Err("max_sessions must be positive when set".into());
        }
        self.credentials.validate()?;
        self.policy.validate()
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    /// Local SOCKS5 listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Remote tunnel endpoint
    pub remote_addr: String,
    /// Tunnel user id (UUID)
    pub user_id: String,
    /// Tunnel record protection
    #[serde(default)]
    pub security: Security,
    /// Tunnel alter id
    #[serde(default = "default_alter_id")]
    pub alter_id: u16,
    /// Dial timeout (seconds)
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Per-read/per-write timeout (seconds)
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Absolute session cap (seconds)
    #[serde(default = "default_session_lifetime_secs")]
    pub session_lifetime_secs: u64,
    /// Copy buffer size (bytes)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum concurrent sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
    /// Send SOCKS5 failure replies
    #[serde(default)]
    pub strict_replies: bool,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_alter_id() -> u16 {
    64
}

fn default_dial_timeout_secs() -> u64 {
    RelayPolicy::default().dial_timeout.as_secs()
}

fn default_io_timeout_secs() -> u64 {
    RelayPolicy::default().io_timeout.as_secs()
}

fn default_session_lifetime_secs() -> u64 {
    RelayPolicy::default().session_lifetime.as_secs()
}

fn default_buffer_size() -> usize {
    RelayPolicy::default().buffer_size
}

impl ProxyConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ProxyConfig, String> {
        let credentials = TunnelCredentials {
            user_id: self.user_id.trim().to_string(),
            security: self.security,
            alter_id: self.alter_id,
        };

        let mut config = ProxyConfig::new(&self.listen_addr, &self.remote_addr, credentials);
        config.policy = RelayPolicy {
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            session_lifetime: Duration::from_secs(self.session_lifetime_secs),
            buffer_size: self.buffer_size,
        };
        config.max_sessions = self.max_sessions;
        config.strict_replies = self.strict_replies;

        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            remote_addr: config.remote_addr.clone(),
            user_id: config.credentials.user_id.clone(),
            security: config.credentials.security,
            alter_id: config.credentials.alter_id,
            dial_timeout_secs: config.policy.dial_timeout.as_secs(),
            io_timeout_secs: config.policy.io_timeout.as_secs(),
            session_lifetime_secs: config.policy.session_lifetime.as_secs(),
            buffer_size: config.policy.buffer_size,
            max_sessions: config.max_sessions,
            strict_replies: config.strict_replies,
        }
    }
}
