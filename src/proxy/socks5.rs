//! SOCKS5 handshake parser.
//!
//! Speaks the local-facing half of the proxy: method negotiation, request
//! decoding and the fixed success reply. Only "no authentication required"
//! is offered. CONNECT and BIND are both accepted and both become a
//! connect-style tunnel.
//!
//! Every failure aborts the handshake. By default the peer gets no failure
//! reply at all, the connection is simply dropped; `strict_replies` switches
//! to protocol-compliant failure replies.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::proxy::address::TargetAddr;

/// SOCKS protocol version
pub const SOCKS_VERSION: u8 = 0x05;
/// Method: no authentication required
pub const METHOD_NO_AUTH: u8 = 0x00;
/// Method reply: no acceptable methods
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;
/// Command: CONNECT
pub const CMD_CONNECT: u8 = 0x01;
/// Command: BIND
pub const CMD_BIND: u8 = 0x02;

/// Reply sent once the request is accepted. The bound address and port are
/// never tracked, so they are always reported as zero.
pub const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Handshake progress. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    /// Reading version, method count and methods
    GreetingRead,
    /// Looking for "no authentication required"
    MethodCheck,
    /// Reading VER, CMD, RSV, ATYP
    RequestRead,
    /// Validating the command
    CommandCheck,
    /// Decoding the destination
    AddressDecode,
    /// Writing the success reply
    ReplySent,
    /// Ready for relaying
    Established,
    /// Handshake failed, connection is dropped
    Aborted,
}

/// Requested command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// CONNECT (0x01)
    Connect,
    /// BIND (0x02), handled exactly like CONNECT
    Bind,
}

impl Command {
    fn from_byte(cmd: u8) -> Result<Self> {
        match cmd {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            other => Err(Error::UnsupportedCommand(other)),
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested command
    pub command: Command,
    /// Requested destination
    pub target: TargetAddr,
}

/// One handshake over one accepted connection.
pub struct Handshake<S> {
    stream: S,
    state: HandshakeState,
    strict_replies: bool,
}

impl<S> Handshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Start a handshake on a freshly accepted stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: HandshakeState::GreetingRead,
            strict_replies: false,
        }
    }

    /// Send protocol-compliant failure replies instead of closing silently.
    pub fn strict_replies(mut self, strict: bool) -> Self {
        self.strict_replies = strict;
        self
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the handshake to completion.
    ///
    /// On success the stream is handed back together with the request. On
    /// failure the stream is dropped, which closes it.
    pub async fn run(mut self) -> Result<(S, Request)> {
        match self.drive().await {
            Ok(request) => Ok((self.stream, request)),
            Err(e) => {
                let failed_in = self.state;
                self.state = HandshakeState::Aborted;
                if self.strict_replies {
                    // The connection is going away regardless.
                    let _ = self.send_failure(failed_in, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<Request> {
        self.state = HandshakeState::GreetingRead;
        let version = self.stream.read_u8().await?;
        if version != SOCKS_VERSION {
            return Err(Error::VersionMismatch {
                expected: SOCKS_VERSION,
                actual: version,
            });
        }
        let count = self.stream.read_u8().await? as usize;
        let mut methods = vec![0u8; count];
        self.stream.read_exact(&mut methods).await?;

        self.state = HandshakeState::MethodCheck;
        if !methods.contains(&METHOD_NO_AUTH) {
            return Err(Error::NoAcceptableMethod);
        }
        self.stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])
            .await?;

        self.state = HandshakeState::RequestRead;
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        let [version, cmd, _reserved, atyp] = header;
        if version != SOCKS_VERSION {
            return Err(Error::VersionMismatch {
                expected: SOCKS_VERSION,
                actual: version,
            });
        }

        self.state = HandshakeState::CommandCheck;
        let command = Command::from_byte(cmd)?;

        self.state = HandshakeState::AddressDecode;
        let target = TargetAddr::read_from(&mut self.stream, atyp).await?;

        self.state = HandshakeState::ReplySent;
        self.stream.write_all(&SUCCESS_REPLY).await?;
        self.stream.flush().await?;

        self.state = HandshakeState::Established;
        Ok(Request { command, target })
    }

    async fn send_failure(&mut self, failed_in: HandshakeState, err: &Error) -> Result<()> {
        if failed_in == HandshakeState::MethodCheck {
            self.stream
                .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                .await?;
        } else if failed_in >= HandshakeState::RequestRead {
            if let Some(code) = err.reply_code() {
                let mut reply = SUCCESS_REPLY;
                reply[1] = code;
                self.stream.write_all(&reply).await?;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }
}
