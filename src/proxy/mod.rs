//! Local SOCKS5 front end.
//!
//! `acceptor` owns the listening socket, `socks5` drives the handshake on
//! each connection, and `relay` bridges an established session through the
//! tunnel to the fixed remote endpoint.

pub mod acceptor;
pub mod address;
pub mod metrics;
pub mod relay;
pub mod socks5;

pub use acceptor::Acceptor;
pub use address::TargetAddr;
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use relay::{Session, SessionRelay, SessionSummary, Teardown};
pub use socks5::{Command, Handshake, HandshakeState, Request};
