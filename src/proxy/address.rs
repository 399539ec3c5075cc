//! SOCKS5 destination address codec.
//!
//! A destination on the wire is an address-type tag followed by the
//! type-specific host bytes and a big-endian port:
//!
//! ```text
//! +------+----------------------+----------+
//! | ATYP | DST.ADDR (variable)  | DST.PORT |
//! +------+----------------------+----------+
//!   0x01   4 raw bytes            2 bytes BE
//!   0x03   1 length byte + name
//!   0x04   (recognized, rejected)
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Address type tag: IPv4
pub const ATYP_IPV4: u8 = 0x01;
/// Address type tag: domain name
pub const ATYP_DOMAIN: u8 = 0x03;
/// Address type tag: IPv6
pub const ATYP_IPV6: u8 = 0x04;

/// Which wire form a destination was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressForm {
    /// Four raw address bytes
    Ipv4,
    /// Length-prefixed host name
    DomainName,
}

/// A decoded destination: host plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// IPv4 destination
    Ipv4(Ipv4Addr, u16),
    /// Domain destination; the name bytes are kept verbatim and may be
    /// empty or not UTF-8
    Domain(Vec<u8>, u16),
}

impl TargetAddr {
    /// Read the address body for `atyp` and the trailing port from `reader`.
    ///
    /// IPv6 is refused before any address byte is consumed.
    pub async fn read_from<R>(reader: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Ipv4(Ipv4Addr::from(octets), port))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let port = reader.read_u16().await?;
                Ok(TargetAddr::Domain(name, port))
            }
            ATYP_IPV6 => Err(Error::Ipv6Unsupported),
            other => Err(Error::UnsupportedAddressType(other)),
        }
    }

    /// Decode from an in-memory buffer holding the bytes after ATYP.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn decode(atyp: u8, buf: &[u8]) -> Result<(Self, usize)> {
        match atyp {
            ATYP_IPV4 => {
                need(buf, 6)?;
                let octets = [buf[0], buf[1], buf[2], buf[3]];
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok((TargetAddr::Ipv4(Ipv4Addr::from(octets), port), 6))
            }
            ATYP_DOMAIN => {
                need(buf, 1)?;
                let len = buf[0] as usize;
                let total = 1 + len + 2;
                need(buf, total)?;
                let host = buf[1..1 + len].to_vec();
                let port = u16::from_be_bytes([buf[1 + len], buf[2 + len]]);
                Ok((TargetAddr::Domain(host, port), total))
            }
            ATYP_IPV6 => Err(Error::Ipv6Unsupported),
            other => Err(Error::UnsupportedAddressType(other)),
        }
    }

    /// Host part for display; undecodable name bytes are replaced.
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip, _) => ip.to_string(),
            TargetAddr::Domain(name, _) => String::from_utf8_lossy(name).into_owned(),
        }
    }

    /// Exact `host:port` bytes handed to the tunnel.
    pub fn destination(&self) -> Vec<u8> {
        match self {
            TargetAddr::Ipv4(ip, port) => format!("{}:{}", ip, port).into_bytes(),
            TargetAddr::Domain(name, port) => {
                let mut out = Vec::with_capacity(name.len() + 6);
                out.extend_from_slice(name);
                out.extend_from_slice(format!(":{}", port).as_bytes());
                out
            }
        }
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) | TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Wire form this address was decoded from.
    pub fn form(&self) -> AddressForm {
        match self {
            TargetAddr::Ipv4(..) => AddressForm::Ipv4,
            TargetAddr::Domain(..) => AddressForm::DomainName,
        }
    }
}

/// `host:port` for logs. See [`TargetAddr::destination`] for the exact bytes.
impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Domain(name, port) => {
                write!(f, "{}:{}", String::from_utf8_lossy(name), port)
            }
        }
    }
}

fn need(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(Error::Buffer {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}
