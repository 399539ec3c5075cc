//! Tunnel adapter boundary.
//!
//! The proxy core knows the tunnel only through [`TunnelConnector`]: given a
//! raw connection to the fixed remote endpoint and a `host:port` destination,
//! produce a byte stream that reaches that destination, or fail. How the
//! stream is protected on the wire is the connector's business.
//!
//! [`SealedTunnel`] is the connector shipped with the crate.

pub mod cipher;
pub mod sealed;

pub use cipher::{Security, UserId};
pub use sealed::SealedTunnel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::Result;

/// Byte stream produced by a tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Owned, type-erased tunnel stream. Dropping it closes the tunnel.
pub type TunnelStream = Box<dyn TunnelIo>;

/// Turns a dialed connection plus a destination into a tunneled stream.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Establish the tunnel over `stream` towards `destination` (`host:port`
    /// bytes, host taken verbatim from the request).
    async fn connect(&self, stream: TcpStream, destination: &[u8]) -> Result<TunnelStream>;
}

/// Credentials handed to the tunnel, passed through the proxy unexamined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCredentials {
    /// User id (UUID)
    pub user_id: String,
    /// Record protection
    #[serde(default)]
    pub security: Security,
    /// Alternate id mixed into authentication and key derivation
    #[serde(default = "default_alter_id")]
    pub alter_id: u16,
}

fn default_alter_id() -> u16 {
    64
}

impl TunnelCredentials {
    /// Credentials with default security and alter id.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            security: Security::default(),
            alter_id: default_alter_id(),
        }
    }

    /// Set the record protection.
    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Validate the credentials.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("user_id cannot be empty".into());
        }
        UserId::parse(&self.user_id).map_err(|e| e.to_string())?;
        Ok(())
    }
}
