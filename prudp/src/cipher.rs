//! Payload encryption seam.
//!
//! DATA payloads are passed through a [`PayloadCipher`] keyed by the
//! connection's encryption key.  The algorithm is the embedder's choice; the
//! crate ships only [`Plaintext`], which leaves payloads untouched.

use std::fmt;

/// Symmetric stream cipher applied to DATA payload bytes.
pub trait PayloadCipher: fmt::Debug + Send + Sync {
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Vec<u8>;
    fn decrypt(&self, data: &[u8], key: &[u8]) -> Vec<u8>;
}

/// Identity cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl PayloadCipher for Plaintext {
    fn encrypt(&self, data: &[u8], _key: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decrypt(&self, data: &[u8], _key: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}
