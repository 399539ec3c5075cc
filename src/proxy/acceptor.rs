//! Local listener.
//!
//! Accepts SOCKS5 clients and runs each one in its own task: handshake
//! first, then the session relay. Failures stay inside the connection's
//! task. The loop itself only stops when `accept` fails.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::proxy::metrics::ProxyMetrics;
use crate::proxy::relay::SessionRelay;
use crate::proxy::socks5::Handshake;
use crate::tunnel::TunnelConnector;

/// SOCKS5 acceptor bound to the local listen address.
pub struct Acceptor {
    listener: TcpListener,
    relay: Arc<SessionRelay>,
    metrics: Arc<ProxyMetrics>,
    admission: Option<Arc<Semaphore>>,
    strict_replies: bool,
}

impl Acceptor {
    /// Validate `config` and bind its listen address.
    pub async fn bind(config: &ProxyConfig, connector: Arc<dyn TunnelConnector>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let listener = TcpListener::bind(&config.listen_addr).await?;
        let metrics = Arc::new(ProxyMetrics::new());
        let relay = SessionRelay::new(
            config.remote_addr.clone(),
            config.policy,
            connector,
            Arc::clone(&metrics),
        );

        Ok(Self {
            listener,
            relay: Arc::new(relay),
            metrics,
            admission: config.max_sessions.map(|n| Arc::new(Semaphore::new(n))),
            strict_replies: config.strict_replies,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Accept connections until the listener fails.
    ///
    /// Running sessions are detached tasks and keep going after this returns.
    pub async fn run(self) -> Result<()> {
        tracing::info!("SOCKS5 proxy listening on {}", self.local_addr()?);
        if let Some(admission) = &self.admission {
            tracing::info!("Admission limited to {} concurrent sessions", admission.available_permits());
        }

        loop {
            // Excess clients wait in the listen backlog until a permit frees up.
            let permit = match &self.admission {
                Some(admission) => match Arc::clone(admission).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Ok(()),
                },
                None => None,
            };

            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                    return Err(Error::Network(e));
                }
            };

            let relay = Arc::clone(&self.relay);
            let metrics = Arc::clone(&self.metrics);
            let strict_replies = self.strict_replies;

            tokio::spawn(async move {
                metrics.increment_connections();

                if let Err(e) =
                    handle_connection(stream, &relay, &metrics, strict_replies).await
                {
                    if e.is_handshake_failure() {
                        tracing::debug!("Rejected handshake from {}: {}", peer_addr, e);
                    } else {
                        tracing::debug!("Connection from {} closed: {}", peer_addr, e);
                    }
                }

                metrics.decrement_connections();
                drop(permit);
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    relay: &SessionRelay,
    metrics: &ProxyMetrics,
    strict_replies: bool,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let (stream, request) = Handshake::new(stream)
        .strict_replies(strict_replies)
        .run()
        .await
        .map_err(|e| {
            metrics.increment_handshake_failures();
            e
        })?;

    tracing::debug!(
        "{:?} request for {} ({:?})",
        request.command,
        request.target,
        request.target.form()
    );
    relay.run(stream, request.target).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use crate::proxy::socks5::SUCCESS_REPLY;
    use crate::tunnel::{SealedTunnel, Security, TunnelCredentials};

    const USER: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn credentials() -> TunnelCredentials {
        TunnelCredentials::new(USER).with_security(Security::Chacha20Poly1305)
    }

    /// Far end of the tunnel: authenticates, reports the destination, echoes.
    async fn tunnel_endpoint() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let endpoint = Arc::new(SealedTunnel::new(&credentials()).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let endpoint = Arc::clone(&endpoint);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let Ok((destination, tunneled)) = endpoint.accept(stream).await else {
                        return;
                    };
                    let _ = tx.send(destination);
                    let (mut reader, mut writer) = tokio::io::split(tunneled);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        (addr, rx)
    }

    async fn start(config: ProxyConfig) -> (SocketAddr, Arc<ProxyMetrics>) {
        let connector = Arc::new(SealedTunnel::new(&config.credentials).unwrap());
        let acceptor = Acceptor::bind(&config, connector).await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let metrics = acceptor.metrics();
        tokio::spawn(acceptor.run());
        (addr, metrics)
    }

    fn config(remote: &str) -> ProxyConfig {
        ProxyConfig::new("127.0.0.1:0", remote, credentials())
    }

    async fn socks_connect(proxy: SocketAddr, request: &[u8]) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client.write_all(request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, SUCCESS_REPLY);
        client
    }

    #[tokio::test]
    async fn test_end_to_end_domain_request() {
        let (remote, mut destinations) = tunnel_endpoint().await;
        let (proxy, metrics) = start(config(&remote)).await;

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.org");
        request.extend_from_slice(&[0x01, 0xbb]);
        let mut client = socks_connect(proxy, &request).await;

        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut echoed = [0u8; 18];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"GET / HTTP/1.0\r\n\r\n");

        assert_eq!(destinations.recv().await.unwrap(), b"example.org:443");
        assert_eq!(metrics.sessions_established(), 1);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_non_utf8_domain_reaches_tunnel_verbatim() {
        let (remote, mut destinations) = tunnel_endpoint().await;
        let (proxy, _) = start(config(&remote)).await;

        let _client =
            socks_connect(proxy, &[0x05, 0x01, 0x00, 0x03, 0x02, 0xc3, 0x28, 0x00, 0x50]).await;

        assert_eq!(destinations.recv().await.unwrap(), b"\xc3\x28:80");
    }

    #[tokio::test]
    async fn test_end_to_end_ipv4_request() {
        let (remote, mut destinations) = tunnel_endpoint().await;
        let (proxy, _) = start(config(&remote)).await;

        let mut client = socks_connect(proxy, &[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50]).await;
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        assert_eq!(destinations.recv().await.unwrap(), b"127.0.0.1:80");
    }

    #[tokio::test]
    async fn test_rejected_greeting_gets_silent_close() {
        let (remote, _destinations) = tunnel_endpoint().await;
        let (proxy, metrics) = start(config(&remote)).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        for _ in 0..50 {
            if metrics.active_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.handshake_failures, 1);
        assert_eq!(snapshot.sessions_established, 0);
    }

    #[tokio::test]
    async fn test_unreachable_remote_closes_after_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);
        let (proxy, _) = start(config(&dead)).await;

        // The success reply precedes the dial, so the failure shows up as a close.
        let mut client = socks_connect(proxy, &[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0, 80]).await;
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_max_sessions_holds_back_excess_clients() {
        let (remote, _destinations) = tunnel_endpoint().await;
        let mut limited = config(&remote);
        limited.max_sessions = Some(1);
        let (proxy, _) = start(limited).await;

        let first = socks_connect(proxy, &[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0, 80]).await;

        let mut second = TcpStream::connect(proxy).await.unwrap();
        second.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        let waited =
            tokio::time::timeout(Duration::from_millis(300), second.read_exact(&mut method)).await;
        assert!(waited.is_err(), "second client admitted while first was active");

        drop(first);
        tokio::time::timeout(Duration::from_secs(2), second.read_exact(&mut method))
            .await
            .expect("second client never admitted")
            .unwrap();
        assert_eq!(method, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let bad = ProxyConfig::new("127.0.0.1:0", "", credentials());
        let connector = Arc::new(SealedTunnel::new(&credentials()).unwrap());
        assert!(matches!(
            Acceptor::bind(&bad, connector).await,
            Err(Error::Config(_))
        ));
    }
}
