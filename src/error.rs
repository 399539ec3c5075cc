//! Error types for the tunnel hub.

use thiserror::Error;

/// Result type alias for tunnel hub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SOCKS5 reply status: general failure.
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
/// SOCKS5 reply status: command not supported.
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
/// SOCKS5 reply status: address type not supported.
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Errors that can occur while handshaking, tunneling or relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error (includes short reads and peer close)
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Operation did not finish in time
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Greeting did not offer "no authentication required"
    #[error("no acceptable authentication method offered")]
    NoAcceptableMethod,

    /// Request command is neither CONNECT nor BIND
    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// Unknown address type tag
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// IPv6 destinations are recognized but not served
    #[error("IPv6 destinations are not supported")]
    Ipv6Unsupported,

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Tunnel establishment or framing failed
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Tunnel credentials did not verify
    #[error("authentication failed")]
    Authentication,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },
}

impl Error {
    /// Create a new tunnel error
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Error::Tunnel(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error came out of the local SOCKS5 exchange.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Error::VersionMismatch { .. }
                | Error::NoAcceptableMethod
                | Error::UnsupportedCommand(_)
                | Error::UnsupportedAddressType(_)
                | Error::Ipv6Unsupported
                | Error::InvalidMessage(_)
        )
    }

    /// SOCKS5 request reply status that describes this error, if any.
    ///
    /// Greeting failures and plain I/O errors have no request-level status.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            Error::UnsupportedCommand(_) => Some(REPLY_COMMAND_NOT_SUPPORTED),
            Error::UnsupportedAddressType(_) | Error::Ipv6Unsupported => {
                Some(REPLY_ADDRESS_TYPE_NOT_SUPPORTED)
            }
            Error::VersionMismatch { .. } | Error::InvalidMessage(_) => {
                Some(REPLY_GENERAL_FAILURE)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Authentication;
        assert_eq!(err.to_string(), "authentication failed");

        let err = Error::Timeout(5000);
        assert_eq!(err.to_string(), "timeout after 5000ms");

        let err = Error::UnsupportedCommand(3);
        assert_eq!(err.to_string(), "unsupported command: 0x03");
    }

    #[test]
    fn test_handshake_classification() {
        assert!(Error::NoAcceptableMethod.is_handshake_failure());
        assert!(Error::Ipv6Unsupported.is_handshake_failure());
        assert!(!Error::Timeout(10).is_handshake_failure());
        assert!(!Error::tunnel("refused").is_handshake_failure());
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(Error::UnsupportedCommand(3).reply_code(), Some(0x07));
        assert_eq!(Error::Ipv6Unsupported.reply_code(), Some(0x08));
        assert_eq!(Error::UnsupportedAddressType(9).reply_code(), Some(0x08));
        assert_eq!(
            Error::VersionMismatch { expected: 5, actual: 4 }.reply_code(),
            Some(0x01)
        );
        assert_eq!(Error::NoAcceptableMethod.reply_code(), None);
    }
}
