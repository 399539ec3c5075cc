//! Proxy metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Proxy metrics collector.
pub struct ProxyMetrics {
    /// Proxy start time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Connections currently being handled
    active_connections: AtomicU64,
    /// Handshakes that aborted
    handshake_failures: AtomicU64,
    /// Sessions that reached relaying
    sessions_established: AtomicU64,
    /// Remote endpoint dials that failed or timed out
    dial_failures: AtomicU64,
    /// Tunnel establishments that failed
    tunnel_failures: AtomicU64,
    /// Sessions ended by the absolute lifetime cap
    lifetime_teardowns: AtomicU64,
    /// Bytes relayed client -> remote
    bytes_up: AtomicU64,
    /// Bytes relayed remote -> client
    bytes_down: AtomicU64,
}

impl ProxyMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            sessions_established: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            tunnel_failures: AtomicU64::new(0),
            lifetime_teardowns: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment aborted handshakes.
    pub fn increment_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment sessions that reached relaying.
    pub fn increment_sessions(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failed or timed-out remote dials.
    pub fn increment_dial_failures(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failed tunnel establishments.
    pub fn increment_tunnel_failures(&self) {
        self.tunnel_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment sessions cut off by the lifetime cap.
    pub fn increment_lifetime_teardowns(&self) {
        self.lifetime_teardowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes relayed towards the remote.
    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes relayed towards the client.
    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get established sessions.
    pub fn sessions_established(&self) -> u64 {
        self.sessions_established.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            sessions_established: self.sessions_established(),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            tunnel_failures: self.tunnel_failures.load(Ordering::Relaxed),
            lifetime_teardowns: self.lifetime_teardowns.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"Tunnel Hub Metrics
==================
Uptime: {} seconds

Connections:
  Total:       {}
  Active:      {}
  Established: {}

Failures:
  Handshake: {}
  Dial:      {}
  Tunnel:    {}

Lifetime teardowns: {}

Traffic:
  Up:   {} bytes
  Down: {} bytes
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.sessions_established,
            snapshot.handshake_failures,
            snapshot.dial_failures,
            snapshot.tunnel_failures,
            snapshot.lifetime_teardowns,
            snapshot.bytes_up,
            snapshot.bytes_down,
        )
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub handshake_failures: u64,
    pub sessions_established: u64,
    pub dial_failures: u64,
    pub tunnel_failures: u64,
    pub lifetime_teardowns: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl MetricsSnapshot {
    /// Share of accepted connections that reached relaying.
    pub fn establish_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.sessions_established as f64 / self.total_connections as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_up + self.bytes_down) as f64 / self.uptime_secs as f64
        }
    }
}
