//! Access-key handling and per-connection identity material.
//!
//! Both peers share an access key.  It is used two ways:
//! - Reduced to a single byte, it keys the version-0 packet checksum.
//! - Digested with SHA-256, it keys an HMAC over the peer's `host:port`,
//!   producing the connection's "local hash".  The first
//!   [`SIGNATURE_LEN`] bytes of that hash are offered during the handshake.

use std::net::SocketAddr;

use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::packet::{Signature, SIGNATURE_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Pre-shared secret for checksums and signature derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessKey {
    /// Textual or binary key.
    Secret(Vec<u8>),
    /// Key already given as a number; used directly as the checksum key.
    Numeric(u32),
}

impl AccessKey {
    /// The one-byte checksum key: the byte sum modulo 256 for secrets, the
    /// low byte for numeric keys.
    pub fn checksum_key(&self) -> u8 {
        match self {
            Self::Secret(bytes) => bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)),
            Self::Numeric(value) => (*value & 0xFF) as u8,
        }
    }

    /// SHA-256 digest of the key.  Numeric keys are digested in decimal form.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match self {
            Self::Secret(bytes) => hasher.update(bytes),
            Self::Numeric(value) => hasher.update(value.to_string().as_bytes()),
        }
        hasher.finalize().into()
    }
}

impl From<&str> for AccessKey {
    fn from(key: &str) -> Self {
        Self::Secret(key.as_bytes().to_vec())
    }
}

impl From<u32> for AccessKey {
    fn from(key: u32) -> Self {
        Self::Numeric(key)
    }
}

/// HMAC-SHA256, keyed by the access-key digest, over `"{host}:{port}"`.
pub fn connection_hash(access_key: &AccessKey, endpoint: SocketAddr) -> [u8; 32] {
    let digest = access_key.digest();
    let mut mac =
        HmacSha256::new_from_slice(&digest).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(format!("{}:{}", endpoint.ip(), endpoint.port()).as_bytes());
    mac.finalize().into_bytes().into()
}

/// The handshake signature: `hash` truncated to [`SIGNATURE_LEN`] bytes.
pub fn signature_from_hash(hash: &[u8; 32]) -> Signature {
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&hash[..SIGNATURE_LEN]);
    signature
}

/// Cryptographically random signature bytes.
pub fn random_signature() -> Signature {
    let mut signature = [0u8; SIGNATURE_LEN];
    rand::thread_rng().fill_bytes(&mut signature);
    signature
}

/// Random session id, generated once per connection.
pub fn random_session_id() -> u8 {
    rand::thread_rng().gen()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn checksum_key_sums_secret_bytes() {
        // 'a' (97) + 'b' (98) = 195
        assert_eq!(AccessKey::from("ab").checksum_key(), 195);
        // 200 + 100 = 300 ≡ 44 (mod 256)
        assert_eq!(AccessKey::Secret(vec![200, 100]).checksum_key(), 44);
    }

    #[test]
    fn numeric_key_is_used_directly() {
        assert_eq!(AccessKey::from(1).checksum_key(), 1);
        assert_eq!(AccessKey::from(0x1FF).checksum_key(), 0xFF);
    }

    #[test]
    fn connection_hash_is_deterministic() {
        let key = AccessKey::from("ridfebb9");
        let a = connection_hash(&key, addr("127.0.0.1:60000"));
        let b = connection_hash(&key, addr("127.0.0.1:60000"));
        assert_eq!(a, b);
    }

    #[test]
    fn connection_hash_binds_endpoint_and_key() {
        let key = AccessKey::from("ridfebb9");
        let base = connection_hash(&key, addr("127.0.0.1:60000"));

        assert_ne!(base, connection_hash(&key, addr("127.0.0.1:60001")));
        assert_ne!(base, connection_hash(&key, addr("10.0.0.1:60000")));
        assert_ne!(
            base,
            connection_hash(&AccessKey::from("other"), addr("127.0.0.1:60000"))
        );
    }

    #[test]
    fn signature_is_hash_prefix() {
        let hash = connection_hash(&AccessKey::from("k"), addr("127.0.0.1:1"));
        assert_eq!(signature_from_hash(&hash), hash[..SIGNATURE_LEN]);
    }
}
