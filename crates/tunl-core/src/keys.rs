//! WireGuard Key Management
//!
//! X25519 key pairs used as client credentials and for handshake
//! ephemerals.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

fn decode_32(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;
    bytes.try_into().map_err(|_| KeyError::InvalidLength)
}

/// Private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self {
            secret: StaticSecret::from(decode_32(s)?),
        })
    }

    /// Matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey(X25519Public::from(&self.secret))
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// Shared secret with a peer
    pub fn diffie_hellman(&self, peer: &PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(&peer.0).to_bytes()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Public key (Curve25519)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(X25519Public);

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(X25519Public::from(bytes))
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        Ok(Self::from_bytes(decode_32(s)?))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.as_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Private key with its public half
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    /// Derive from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish()
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_base64_roundtrip() {
        let pair = KeyPair::generate();
        let restored = PrivateKey::from_base64(&pair.private.to_base64()).unwrap();
        assert_eq!(restored.public_key(), pair.public);
    }

    #[test]
    fn test_shared_secret_agrees() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(
            a.private.diffie_hellman(&b.public),
            b.private.diffie_hellman(&a.public)
        );
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(
            PublicKey::from_base64("not-valid-base64!!!"),
            Err(KeyError::InvalidBase64)
        );
        assert_eq!(PublicKey::from_base64("AAAA"), Err(KeyError::InvalidLength));
    }
}
