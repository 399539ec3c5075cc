//! Sealed record tunnel.
//!
//! ## Wire format
//!
//! ```text
//! proxy -> endpoint, once:
//! +-----------+--------------+----------+
//! | salt (16) | auth tag (8) | security |
//! +-----------+--------------+----------+
//!
//! then records in both directions:
//! +-------------+----------------------------+
//! | len (u16BE) | body (sealed or plaintext) |
//! +-------------+----------------------------+
//! ```
//!
//! The first proxy record carries the destination (`host:port`). Records
//! after that carry relayed bytes.
//!
//! Record translation runs in one pump task per tunnel that bridges an
//! in-memory duplex pipe to the socket. The caller gets the other end of the
//! pipe; dropping it stops the pump and closes the socket right away, even
//! when the pump is blocked on a peer that stopped reading.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::tunnel::cipher::{
    auth_tag, random_salt, verify_auth_tag, RecordCipher, Security, TunnelKeys, UserId,
    AUTH_TAG_SIZE, SALT_SIZE,
};
use crate::tunnel::{TunnelConnector, TunnelCredentials, TunnelStream};

/// Size of the connection header
pub const HEADER_SIZE: usize = SALT_SIZE + AUTH_TAG_SIZE + 1;

/// Maximum plaintext bytes per record
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Tunnel connector sealing relayed bytes into authenticated records.
pub struct SealedTunnel {
    user: UserId,
    security: Security,
    alter_id: u16,
}

impl SealedTunnel {
    /// Create a connector from opaque credentials.
    pub fn new(credentials: &TunnelCredentials) -> Result<Self> {
        Ok(Self {
            user: UserId::parse(&credentials.user_id)?,
            security: credentials.security,
            alter_id: credentials.alter_id,
        })
    }

    /// Record protection in use.
    pub fn security(&self) -> Security {
        self.security
    }

    /// Open a tunnel towards `destination` over any byte stream.
    pub async fn open<S>(&self, mut stream: S, destination: &[u8]) -> Result<TunnelStream>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if destination.len() > MAX_RECORD_PAYLOAD {
            return Err(Error::tunnel("destination too long"));
        }

        let salt = random_salt();
        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_slice(&salt);
        header.put_slice(&auth_tag(&self.user, &salt, self.alter_id));
        header.put_u8(self.security.to_byte());
        stream.write_all(&header).await?;

        let keys = TunnelKeys::derive(&self.user, &salt, self.alter_id)?;
        let mut sealer = keys.client_cipher(self.security);
        let opener = keys.server_cipher(self.security);

        write_record(&mut stream, &mut sealer, destination).await?;
        stream.flush().await?;

        Ok(spawn_pump(stream, sealer, opener))
    }

    /// Endpoint side: authenticate an incoming tunnel and read its destination.
    pub async fn accept<S>(&self, mut stream: S) -> Result<(Vec<u8>, TunnelStream)>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await?;

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&header[..SALT_SIZE]);
        let mut tag = [0u8; AUTH_TAG_SIZE];
        tag.copy_from_slice(&header[SALT_SIZE..SALT_SIZE + AUTH_TAG_SIZE]);

        if !verify_auth_tag(&self.user, &salt, self.alter_id, &tag) {
            return Err(Error::Authentication);
        }

        let security = Security::from_byte(header[HEADER_SIZE - 1])?;
        if security != self.security {
            return Err(Error::tunnel(format!(
                "security mismatch: expected {:?}, got {:?}",
                self.security, security
            )));
        }

        let keys = TunnelKeys::derive(&self.user, &salt, self.alter_id)?;
        let mut opener = keys.client_cipher(security);
        let sealer = keys.server_cipher(security);

        let destination = read_record(&mut stream, &mut opener)
            .await?
            .ok_or_else(|| Error::tunnel("closed before destination"))?;

        Ok((destination, spawn_pump(stream, sealer, opener)))
    }
}

#[async_trait]
impl TunnelConnector for SealedTunnel {
    async fn connect(&self, stream: TcpStream, destination: &[u8]) -> Result<TunnelStream> {
        self.open(stream, destination).await
    }
}

async fn write_record<W>(writer: &mut W, cipher: &mut RecordCipher, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = cipher.seal(payload)?;
    let mut record = BytesMut::with_capacity(2 + body.len());
    record.put_u16(body.len() as u16);
    record.put_slice(&body);
    writer.write_all(&record).await?;
    Ok(())
}

/// Read one record. `None` means the peer closed at a record boundary.
async fn read_record<R>(reader: &mut R, cipher: &mut RecordCipher) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Network(e)),
    };

    if len > MAX_RECORD_PAYLOAD + cipher.overhead() {
        return Err(Error::InvalidMessage("record too large".into()));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    cipher.open(&body).map(Some)
}

/// Caller's end of the pump pipe. Dropping it drops `_closed`, which stops
/// the pump.
struct PumpedStream {
    pipe: DuplexStream,
    _closed: oneshot::Sender<()>,
}

impl AsyncRead for PumpedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_read(cx, buf)
    }
}

impl AsyncWrite for PumpedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.pipe).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_shutdown(cx)
    }
}

fn spawn_pump<S>(stream: S, mut sealer: RecordCipher, mut opener: RecordCipher) -> TunnelStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (app_side, pump_side) = tokio::io::duplex(PIPE_CAPACITY);
    let (closed_tx, closed_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut net_reader, mut net_writer) = tokio::io::split(stream);
        let (mut pipe_reader, mut pipe_writer) = tokio::io::split(pump_side);

        // Pipe -> socket
        let outbound = async {
            let mut buf = vec![0u8; MAX_RECORD_PAYLOAD];
            loop {
                let n = pipe_reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                write_record(&mut net_writer, &mut sealer, &buf[..n]).await?;
            }
            net_writer.shutdown().await?;
            Ok::<_, Error>(())
        };

        // Socket -> pipe
        let inbound = async {
            while let Some(payload) = read_record(&mut net_reader, &mut opener).await? {
                pipe_writer.write_all(&payload).await?;
            }
            pipe_writer.shutdown().await?;
            Ok::<_, Error>(())
        };

        // The socket halves drop with this task, closing the socket.
        let result = tokio::select! {
            r = outbound => r,
            r = inbound => r,
            _ = closed_rx => Ok(()),
        };
        if let Err(e) = result {
            tracing::debug!("Tunnel pump ended: {}", e);
        }
    });

    Box::new(PumpedStream {
        pipe: app_side,
        _closed: closed_tx,
    })
}
