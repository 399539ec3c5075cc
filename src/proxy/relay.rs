//! Session relay.
//!
//! Owns one session end to end: dials the fixed remote endpoint, asks the
//! tunnel connector for a tunneled stream, then runs two directional copy
//! loops until the first of
//!
//! - the client -> remote loop ending,
//! - the remote -> client loop ending,
//! - the absolute session lifetime elapsing.
//!
//! Every read and every write in a copy loop is bounded by the policy's
//! `io_timeout`. The lifetime is a hard cap from the start of relaying, not
//! an idle timer; busy sessions are cut off too.
//!
//! Teardown cancels whichever loop is still running. Each loop owns one half
//! of each stream, so once both loop tasks are gone both streams are closed,
//! exactly once, by drop.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tokio::time::timeout;

use crate::config::RelayPolicy;
use crate::error::{Error, Result};
use crate::proxy::address::TargetAddr;
use crate::proxy::metrics::ProxyMetrics;
use crate::tunnel::{TunnelConnector, TunnelStream};

/// Process-unique session number, used for log correlation only.
pub type SessionId = u64;

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local client -> tunnel
    Upstream,
    /// Tunnel -> local client
    Downstream,
}

/// Why a copy loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    /// Source reached end of stream
    Eof,
    /// No read completed within the deadline
    ReadTimeout,
    /// A write did not complete within the deadline
    WriteTimeout,
    /// Reading failed
    ReadError(io::ErrorKind),
    /// Writing failed
    WriteError(io::ErrorKind),
    /// The loop task died without reporting
    Aborted,
}

/// Which event ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// One copy loop finished first
    LoopEnded(Direction, LoopEnd),
    /// The absolute lifetime elapsed
    LifetimeExceeded,
}

impl Teardown {
    fn ended(&self, direction: Direction) -> bool {
        matches!(self, Teardown::LoopEnded(d, _) if *d == direction)
    }
}

/// Outcome of one relayed session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Session number
    pub id: SessionId,
    /// Requested destination
    pub target: TargetAddr,
    /// Event that ended the session
    pub teardown: Teardown,
    /// Bytes written towards the tunnel
    pub bytes_up: u64,
    /// Bytes written towards the client
    pub bytes_down: u64,
    /// Time from pairing to teardown
    pub duration: Duration,
}

/// One local connection paired with its tunneled remote stream.
pub struct Session<L> {
    id: SessionId,
    target: TargetAddr,
    local: L,
    remote: TunnelStream,
    created_at: Instant,
}

impl<L> Session<L>
where
    L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Pair a local stream with an established tunnel.
    pub fn new(id: SessionId, target: TargetAddr, local: L, remote: TunnelStream) -> Self {
        Self {
            id,
            target,
            local,
            remote,
            created_at: Instant::now(),
        }
    }

    /// Get session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Destination this session reaches.
    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// Relay until the first termination event, then close both streams.
    pub async fn relay(self, policy: &RelayPolicy) -> SessionSummary {
        let Session {
            id,
            target,
            local,
            remote,
            created_at,
        } = self;

        let (local_reader, local_writer) = tokio::io::split(local);
        let (remote_reader, remote_writer) = tokio::io::split(remote);
        let bytes_up = Arc::new(AtomicU64::new(0));
        let bytes_down = Arc::new(AtomicU64::new(0));

        let mut upstream = tokio::spawn(copy_with_deadlines(
            local_reader,
            remote_writer,
            policy.io_timeout,
            policy.buffer_size,
            Arc::clone(&bytes_up),
        ));
        let mut downstream = tokio::spawn(copy_with_deadlines(
            remote_reader,
            local_writer,
            policy.io_timeout,
            policy.buffer_size,
            Arc::clone(&bytes_down),
        ));

        let teardown = tokio::select! {
            end = &mut upstream => Teardown::LoopEnded(Direction::Upstream, loop_end(end)),
            end = &mut downstream => Teardown::LoopEnded(Direction::Downstream, loop_end(end)),
            _ = tokio::time::sleep(policy.session_lifetime) => Teardown::LifetimeExceeded,
        };

        // A handle that already yielded must not be polled again.
        for (direction, handle) in [(Direction::Upstream, upstream), (Direction::Downstream, downstream)] {
            if !teardown.ended(direction) {
                handle.abort();
                let _ = handle.await;
            }
        }

        SessionSummary {
            id,
            target,
            teardown,
            bytes_up: bytes_up.load(Ordering::Relaxed),
            bytes_down: bytes_down.load(Ordering::Relaxed),
            duration: created_at.elapsed(),
        }
    }
}

fn loop_end(joined: std::result::Result<LoopEnd, JoinError>) -> LoopEnd {
    joined.unwrap_or(LoopEnd::Aborted)
}

/// Copy `reader` into `writer` with a deadline on every read and write.
async fn copy_with_deadlines<R, W>(
    mut reader: R,
    mut writer: W,
    io_timeout: Duration,
    buffer_size: usize,
    copied: Arc<AtomicU64>,
) -> LoopEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match timeout(io_timeout, reader.read(&mut buf)).await {
            Err(_) => return LoopEnd::ReadTimeout,
            Ok(Err(e)) => return LoopEnd::ReadError(e.kind()),
            Ok(Ok(0)) => return LoopEnd::Eof,
            Ok(Ok(n)) => n,
        };

        match timeout(io_timeout, writer.write_all(&buf[..n])).await {
            Err(_) => return LoopEnd::WriteTimeout,
            Ok(Err(e)) => return LoopEnd::WriteError(e.kind()),
            Ok(Ok(())) => {}
        }

        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Establishes and relays sessions towards one fixed remote endpoint.
pub struct SessionRelay {
    remote_addr: String,
    policy: RelayPolicy,
    connector: Arc<dyn TunnelConnector>,
    metrics: Arc<ProxyMetrics>,
    next_id: AtomicU64,
}

impl SessionRelay {
    /// Create a relay manager.
    pub fn new(
        remote_addr: impl Into<String>,
        policy: RelayPolicy,
        connector: Arc<dyn TunnelConnector>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            policy,
            connector,
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    /// Dial the remote endpoint within the dial timeout.
    async fn dial(&self) -> Result<TcpStream> {
        let dial_timeout = self.policy.dial_timeout;
        let stream = timeout(dial_timeout, TcpStream::connect(&self.remote_addr))
            .await
            .map_err(|_| Error::Timeout(dial_timeout.as_millis() as u64))?
            .map_err(Error::Network)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Dial and tunnel towards `target`. No retries; on failure `local` is
    /// dropped, which closes it.
    pub async fn establish<L>(&self, local: L, target: TargetAddr) -> Result<Session<L>>
    where
        L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let remote = self.dial().await.map_err(|e| {
            self.metrics.increment_dial_failures();
            e
        })?;

        let destination = target.destination();
        let tunneled = self
            .connector
            .connect(remote, &destination)
            .await
            .map_err(|e| {
                self.metrics.increment_tunnel_failures();
                e
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(id, target, local, tunneled))
    }

    /// Establish a session and relay it to completion.
    pub async fn run<L>(&self, local: L, target: TargetAddr) -> Result<SessionSummary>
    where
        L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = self.establish(local, target).await?;
        self.metrics.increment_sessions();
        tracing::debug!("Session {} relaying to {}", session.id(), session.target());

        let summary = session.relay(&self.policy).await;

        self.metrics.add_bytes_up(summary.bytes_up);
        self.metrics.add_bytes_down(summary.bytes_down);
        if summary.teardown == Teardown::LifetimeExceeded {
            self.metrics.increment_lifetime_teardowns();
        }

        tracing::debug!(
            "Session {} to {} closed after {:?}: {:?} ({} bytes up, {} bytes down)",
            summary.id,
            summary.target,
            summary.duration,
            summary.teardown,
            summary.bytes_up,
            summary.bytes_down
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Hands the dialed socket straight back and remembers destinations.
    #[derive(Default)]
    struct Passthrough {
        destinations: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl TunnelConnector for Passthrough {
        async fn connect(&self, stream: TcpStream, destination: &[u8]) -> Result<TunnelStream> {
            self.destinations.lock().unwrap().push(destination.to_vec());
            Ok(Box::new(stream))
        }
    }

    struct Refusing;

    #[async_trait]
    impl TunnelConnector for Refusing {
        async fn connect(&self, _stream: TcpStream, _destination: &[u8]) -> Result<TunnelStream> {
            Err(Error::tunnel("refused"))
        }
    }

    async fn echo_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    fn target() -> TargetAddr {
        TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 80)
    }

    fn relay(
        remote: String,
        policy: RelayPolicy,
        connector: Arc<dyn TunnelConnector>,
    ) -> (Arc<SessionRelay>, Arc<ProxyMetrics>) {
        let metrics = Arc::new(ProxyMetrics::new());
        let relay = SessionRelay::new(remote, policy, connector, Arc::clone(&metrics));
        (Arc::new(relay), metrics)
    }

    #[tokio::test]
    async fn test_relays_both_ways_until_client_closes() {
        let connector = Arc::new(Passthrough::default());
        let (relay, metrics) = relay(
            echo_endpoint().await,
            RelayPolicy::default(),
            connector.clone(),
        );

        let (mut client, local) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { relay.run(local, target()).await });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client);
        let summary = task.await.unwrap().unwrap();

        assert_eq!(
            summary.teardown,
            Teardown::LoopEnded(Direction::Upstream, LoopEnd::Eof)
        );
        assert_eq!(summary.bytes_up, 5);
        assert_eq!(summary.bytes_down, 5);
        assert_eq!(
            connector.destinations.lock().unwrap().as_slice(),
            &[b"10.0.0.1:80".to_vec()]
        );
        assert_eq!(metrics.sessions_established(), 1);
        assert_eq!(metrics.snapshot().bytes_up, 5);
    }

    #[tokio::test]
    async fn test_client_close_closes_remote() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap().to_string();
        let (closed_tx, closed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
            let _ = closed_tx.send(());
        });

        let (relay, _) = relay(remote_addr, RelayPolicy::default(), Arc::new(Passthrough::default()));
        let (client, local) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { relay.run(local, target()).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);

        // Well under both the 5 s deadline and the 60 s cap.
        tokio::time::timeout(Duration::from_secs(2), closed_rx)
            .await
            .expect("remote side was not closed")
            .unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_lifetime_cap_ends_busy_session() {
        let policy = RelayPolicy {
            session_lifetime: Duration::from_millis(300),
            ..RelayPolicy::default()
        };
        let (relay, metrics) = relay(echo_endpoint().await, policy, Arc::new(Passthrough::default()));

        let (mut client, local) = tokio::io::duplex(1024);
        let started = Instant::now();
        let task = tokio::spawn(async move { relay.run(local, target()).await });

        let mut exchanged = 0;
        loop {
            if client.write_all(b"x").await.is_err() {
                break;
            }
            let mut buf = [0u8; 1];
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => exchanged += 1,
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.teardown, Teardown::LifetimeExceeded);
        assert!(exchanged > 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(metrics.snapshot().lifetime_teardowns, 1);
    }

    #[tokio::test]
    async fn test_idle_direction_times_out() {
        let policy = RelayPolicy {
            io_timeout: Duration::from_millis(200),
            session_lifetime: Duration::from_secs(30),
            ..RelayPolicy::default()
        };
        let (relay, _) = relay(echo_endpoint().await, policy, Arc::new(Passthrough::default()));

        let (mut client, local) = tokio::io::duplex(1024);
        let started = Instant::now();
        let summary = relay.run(local, target()).await.unwrap();

        assert!(matches!(
            summary.teardown,
            Teardown::LoopEnded(_, LoopEnd::ReadTimeout)
        ));
        assert!(started.elapsed() < Duration::from_secs(3));

        // Local side is closed as part of the teardown.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_client_hits_write_deadline() {
        let policy = RelayPolicy {
            io_timeout: Duration::from_millis(200),
            session_lifetime: Duration::from_secs(30),
            ..RelayPolicy::default()
        };
        let (relay, _) = relay(echo_endpoint().await, policy, Arc::new(Passthrough::default()));

        // The client keeps sending but never reads its echo back.
        let (mut client, local) = tokio::io::duplex(64);
        tokio::spawn(async move {
            while client.write_all(&[0u8; 16]).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let started = Instant::now();
        let summary = relay.run(local, target()).await.unwrap();

        assert_eq!(
            summary.teardown,
            Teardown::LoopEnded(Direction::Downstream, LoopEnd::WriteTimeout)
        );
        assert!(summary.bytes_down > 0);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = Arc::new(Passthrough::default());
        let (relay, metrics) = relay(dead_addr, RelayPolicy::default(), connector.clone());

        let (mut client, local) = tokio::io::duplex(1024);
        let result = relay.run(local, target()).await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert!(connector.destinations.lock().unwrap().is_empty());
        assert_eq!(metrics.snapshot().dial_failures, 1);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_failure() {
        let (relay, metrics) = relay(echo_endpoint().await, RelayPolicy::default(), Arc::new(Refusing));

        let (_client, local) = tokio::io::duplex(1024);
        let result = relay.run(local, target()).await;

        assert!(matches!(result, Err(Error::Tunnel(_))));
        assert_eq!(metrics.snapshot().tunnel_failures, 1);
        assert_eq!(metrics.sessions_established(), 0);
    }

    #[tokio::test]
    async fn test_small_buffer_moves_large_payload() {
        let (relay, _) = relay(echo_endpoint().await, RelayPolicy::default(), Arc::new(Passthrough::default()));

        let (client, local) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { relay.run(local, target()).await });

        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let (mut reader, mut writer) = tokio::io::split(client);
        let expected = payload.clone();
        let write_side = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer
        });

        let mut echoed = vec![0u8; expected.len()];
        reader.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, expected);

        drop(write_side.await.unwrap());
        drop(reader);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.bytes_up, 10_000);
    }

    #[test]
    fn test_teardown_ended() {
        let teardown = Teardown::LoopEnded(Direction::Downstream, LoopEnd::Eof);
        assert!(teardown.ended(Direction::Downstream));
        assert!(!teardown.ended(Direction::Upstream));
        assert!(!Teardown::LifetimeExceeded.ended(Direction::Upstream));
    }
}
