//! Tunnel credentials and record protection.
//!
//! - user ids are 16-byte UUIDs
//! - HMAC-SHA256 auth tags prove knowledge of the user id
//! - HKDF-SHA256 derives one key per direction from a per-connection salt
//! - ChaCha20-Poly1305 seals records with a counter nonce
//!
//! All key material is zeroized on drop.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of the per-connection salt
pub const SALT_SIZE: usize = 16;

/// Size of the truncated HMAC carried in the tunnel header
pub const AUTH_TAG_SIZE: usize = 8;

/// Size of a user id
pub const USER_ID_SIZE: usize = 16;

/// Record protection negotiated for a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Security {
    /// Records are framed but not encrypted
    #[default]
    #[serde(rename = "none")]
    None,
    /// Records are sealed with ChaCha20-Poly1305
    #[serde(rename = "chacha20-poly1305")]
    Chacha20Poly1305,
}

impl Security {
    /// Header byte for this security type.
    pub fn to_byte(self) -> u8 {
        match self {
            Security::None => 0x00,
            Security::Chacha20Poly1305 => 0x01,
        }
    }

    /// Parse a header byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Security::None),
            0x01 => Ok(Security::Chacha20Poly1305),
            other => Err(Error::tunnel(format!("unknown security type {:#04x}", other))),
        }
    }
}

/// A tunnel user id.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct UserId([u8; USER_ID_SIZE]);

impl UserId {
    /// Parse a UUID string; dashes are optional.
    pub fn parse(s: &str) -> Result<Self> {
        let compact: String = s.trim().chars().filter(|c| *c != '-').collect();
        let bytes =
            hex::decode(&compact).map_err(|e| Error::config(format!("invalid user id: {}", e)))?;
        let bytes: [u8; USER_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::config("user id must be 16 bytes"))?;
        Ok(Self(bytes))
    }

    /// Generate a random (version 4) user id.
    pub fn random() -> Self {
        let mut bytes = [0u8; USER_ID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self(bytes)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; USER_ID_SIZE] {
        &self.0
    }
}

/// Canonical 8-4-4-4-12 form.
impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserId(..)")
    }
}

/// Fresh random salt for one tunnel.
pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Compute the header auth tag: first 8 bytes of
/// HMAC-SHA256(user id, salt || alter_id).
pub fn auth_tag(user: &UserId, salt: &[u8; SALT_SIZE], alter_id: u16) -> [u8; AUTH_TAG_SIZE] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(user.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(salt);
    mac.update(&alter_id.to_be_bytes());
    let result = mac.finalize().into_bytes();

    let mut tag = [0u8; AUTH_TAG_SIZE];
    tag.copy_from_slice(&result[..AUTH_TAG_SIZE]);
    tag
}

/// Verify a header auth tag in constant time.
pub fn verify_auth_tag(
    user: &UserId,
    salt: &[u8; SALT_SIZE],
    alter_id: u16,
    expected: &[u8; AUTH_TAG_SIZE],
) -> bool {
    let computed = auth_tag(user, salt, alter_id);
    computed
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Per-direction keys for one tunnel.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TunnelKeys {
    client_key: [u8; KEY_SIZE],
    server_key: [u8; KEY_SIZE],
}

impl TunnelKeys {
    /// Derive both direction keys from the user id and connection salt.
    pub fn derive(user: &UserId, salt: &[u8; SALT_SIZE], alter_id: u16) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt.as_slice()), user.as_bytes());
        let context = alter_id.to_be_bytes();

        let client_info = [b"tunnelhub client key".as_slice(), &context].concat();
        let server_info = [b"tunnelhub server key".as_slice(), &context].concat();

        let mut client_key = [0u8; KEY_SIZE];
        let mut server_key = [0u8; KEY_SIZE];
        hkdf.expand(&client_info, &mut client_key)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;
        hkdf.expand(&server_info, &mut server_key)
            .map_err(|_| Error::crypto("HKDF expansion failed"))?;

        Ok(Self {
            client_key,
            server_key,
        })
    }

    /// Cipher for records flowing from the proxy to the tunnel endpoint.
    pub fn client_cipher(&self, security: Security) -> RecordCipher {
        RecordCipher::new(security, &self.client_key)
    }

    /// Cipher for records flowing from the tunnel endpoint back.
    pub fn server_cipher(&self, security: Security) -> RecordCipher {
        RecordCipher::new(security, &self.server_key)
    }
}

/// Seals or opens the records of one direction.
///
/// Each direction keeps its own nonce counter, so a cipher must only ever be
/// used for sealing or only for opening.
pub struct RecordCipher {
    cipher: Option<ChaCha20Poly1305>,
    counter: u64,
}

impl RecordCipher {
    /// Create a cipher for `security` keyed with `key`.
    pub fn new(security: Security, key: &[u8; KEY_SIZE]) -> Self {
        let cipher = match security {
            Security::None => None,
            Security::Chacha20Poly1305 => Some(ChaCha20Poly1305::new(key.into())),
        };
        Self { cipher, counter: 0 }
    }

    /// Bytes added to each record body.
    pub fn overhead(&self) -> usize {
        if self.cipher.is_some() {
            TAG_SIZE
        } else {
            0
        }
    }

    /// Protect one record body.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.cipher.as_ref() {
            None => Ok(plaintext.to_vec()),
            Some(cipher) => {
                let nonce = counter_nonce(self.counter);
                self.counter = self.counter.wrapping_add(1);
                let payload = Payload {
                    msg: plaintext,
                    aad: b"",
                };
                cipher
                    .encrypt((&nonce).into(), payload)
                    .map_err(|_| Error::crypto("encryption failed"))
            }
        }
    }

    /// Unprotect one record body.
    pub fn open(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        match self.cipher.as_ref() {
            None => Ok(body.to_vec()),
            Some(cipher) => {
                if body.len() < TAG_SIZE {
                    return Err(Error::Buffer {
                        expected: TAG_SIZE,
                        actual: body.len(),
                    });
                }
                let nonce = counter_nonce(self.counter);
                self.counter = self.counter.wrapping_add(1);
                let payload = Payload { msg: body, aad: b"" };
                cipher
                    .decrypt((&nonce).into(), payload)
                    .map_err(|_| Error::crypto("decryption/authentication failed"))
            }
        }
    }
}

/// Counter in the last 8 bytes (little-endian), first 4 bytes zero.
fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}
