//! # Tunnel Hub
//!
//! A local SOCKS5 front end. Applications connect to a loopback listener,
//! name a destination with a minimal SOCKS5 handshake, and get bridged to a
//! fixed remote endpoint through a tunnel that carries the destination.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Acceptor (one task per local connection)               │
//! ├─────────────────────────────────────────────────────────┤
//! │  SOCKS5 Handshake (greeting, request, fixed reply)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Session Relay (dial, tunnel, two deadline-bound loops) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Tunnel Connector (SealedTunnel, ChaCha20-Poly1305)     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session Policy
//!
//! 1. **Silent rejection**: malformed handshakes close without a reply unless
//!    strict replies are enabled
//! 2. **Per-operation deadlines**: every relay read and write is bounded
//! 3. **Absolute lifetime**: sessions end after a fixed cap, busy or not
//! 4. **No retries**: any dial, tunnel or transport failure ends the session

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod proxy;
pub mod tunnel;

pub use config::{ProxyConfig, ProxyConfigFile, RelayPolicy};
pub use error::{Error, Result};
pub use proxy::{Acceptor, ProxyMetrics, TargetAddr};
pub use tunnel::{SealedTunnel, TunnelConnector, TunnelCredentials, TunnelStream};

/// SOCKS protocol version spoken on the local socket
pub const SOCKS_VERSION: u8 = proxy::socks5::SOCKS_VERSION;
