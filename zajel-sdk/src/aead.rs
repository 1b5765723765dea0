//! Shared ChaCha20-Poly1305 sealing helpers.
//!
//! Wire layout for every ciphertext in the protocol:
//!
//! ```text
//! [12B nonce][ciphertext][16B tag]
//! ```
//!
//! The nonce is freshly random per message and prefixed; the Poly1305 tag
//! is appended by the AEAD.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};

/// Nonce length prefixed to every ciphertext.
pub(crate) const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag length.
pub(crate) const TAG_LEN: usize = 16;

/// Failures shared by every AEAD consumer in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AeadError {
    /// Input shorter than nonce + tag — cannot even be an empty message.
    ShortInput,
    /// Poly1305 tag mismatch: tampered, truncated, or wrong key.
    AuthFailed,
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub(crate) fn seal(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    // Encryption with a valid key and nonce cannot fail for in-memory buffers.
    let ct = cipher
        .encrypt(&nonce, plaintext)
        .unwrap_or_default();
    let mut wire = Vec::with_capacity(NONCE_LEN + ct.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ct);
    wire
}

/// Decrypt a `[nonce][ct][tag]` buffer under `key`.
pub(crate) fn open(key: &[u8; 32], wire: &[u8]) -> Result<Vec<u8>, AeadError> {
    if wire.len() < NONCE_LEN + TAG_LEN {
        return Err(AeadError::ShortInput);
    }
    let (nonce, ct) = wire.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| AeadError::AuthFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [7u8; 32];
        let wire = seal(&key, b"hello");
        assert_eq!(open(&key, &wire).unwrap(), b"hello");
    }

    #[test]
    fn bit_flips_fail_auth() {
        let key = [7u8; 32];
        let wire = seal(&key, b"flip me");
        // Flip one bit in every position: nonce, ciphertext, and tag.
        for i in 0..wire.len() {
            let mut bad = wire.clone();
            bad[i] ^= 0x01;
            assert_eq!(open(&key, &bad), Err(AeadError::AuthFailed), "byte {i}");
        }
    }

    #[test]
    fn short_input_is_distinct() {
        let key = [7u8; 32];
        assert_eq!(open(&key, &[0u8; 27]), Err(AeadError::ShortInput));
        // 28 bytes = nonce + tag exactly: a valid empty message shape,
        // but garbage bytes fail authentication instead.
        assert_eq!(open(&key, &[0u8; 28]), Err(AeadError::AuthFailed));
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = [9u8; 32];
        let wire = seal(&key, b"");
        assert_eq!(wire.len(), NONCE_LEN + TAG_LEN);
        assert_eq!(open(&key, &wire).unwrap(), b"");
    }
}
