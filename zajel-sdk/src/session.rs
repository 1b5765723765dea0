//! Pairwise X25519 sessions with salted HKDF key derivation.
//!
//! Each peer holds a long-term X25519 identity key. A session between two
//! peers derives its key from the raw Diffie-Hellman shared secret through
//! HKDF-SHA256 with a protocol-versioned salt:
//!
//! ```text
//! shared  = X25519(ourPriv, theirPub)
//! session = HKDF-SHA256(key=shared, salt="zajel-session-salt-v1",
//!                       info="zajel_session", L=32)
//! ```
//!
//! Three further contexts are derived the same way for channel content
//! (per epoch), upstream messages, and device-link tunnels. The salts and
//! infos are constants: two implementations given the same inputs must
//! derive byte-identical keys.
//!
//! Content encryption is ChaCha20-Poly1305 with the `[12B nonce][ct][tag]`
//! wire layout from [`crate::aead`].

use chacha20poly1305::aead::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::aead::{self, AeadError};

/// Salt for pairwise session key derivation.
const SESSION_SALT: &[u8] = b"zajel-session-salt-v1";
const SESSION_INFO: &[u8] = b"zajel_session";

/// Salt for per-epoch channel content keys.
const CHANNEL_SALT: &[u8] = b"zajel-channel-salt-v1";

/// Salt for upstream (subscriber → channel owner) message keys.
const UPSTREAM_SALT: &[u8] = b"zajel-upstream-salt-v1";
const UPSTREAM_INFO: &[u8] = b"zajel_upstream_message";

/// Salt for device-link tunnel keys.
const LINK_SALT: &[u8] = b"zajel-link-salt-v1";

/// Errors from session establishment and content decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("input shorter than nonce and tag")]
    ShortInput,
    #[error("authentication failed")]
    AuthFailed,
    #[error("invalid public key")]
    InvalidKey,
}

impl From<AeadError> for SessionError {
    fn from(e: AeadError) -> Self {
        match e {
            AeadError::ShortInput => SessionError::ShortInput,
            AeadError::AuthFailed => SessionError::AuthFailed,
        }
    }
}

/// A long-term X25519 identity key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore from a persisted 32-byte secret.
    pub fn from_secret(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Secret key bytes for persistence.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Our public key.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Fingerprint of our public key for out-of-band verification.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.public)
    }
}

/// Derive 32 bytes from `ikm` with the given salt and info.
fn derive(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

/// An established pairwise session.
///
/// Holds the HKDF-derived session key and the raw shared secret, from
/// which the channel/upstream/link context keys are derived on demand.
pub struct PairwiseSession {
    session_key: [u8; 32],
    shared_secret: [u8; 32],
    their_public: PublicKey,
}

impl PairwiseSession {
    /// Establish a session with a peer's public key.
    pub fn establish(ours: &IdentityKeyPair, theirs: &PublicKey) -> Self {
        let shared = ours.secret.diffie_hellman(theirs);
        let session_key = derive(shared.as_bytes(), SESSION_SALT, SESSION_INFO);
        Self {
            session_key,
            shared_secret: shared.to_bytes(),
            their_public: *theirs,
        }
    }

    /// Establish from a peer's raw 32-byte public key.
    pub fn establish_raw(ours: &IdentityKeyPair, theirs: [u8; 32]) -> Self {
        Self::establish(ours, &PublicKey::from(theirs))
    }

    /// Encrypt under the session key. Output is `[nonce][ct][tag]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        aead::seal(&self.session_key, plaintext)
    }

    /// Decrypt a `[nonce][ct][tag]` buffer under the session key.
    pub fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>, SessionError> {
        Ok(aead::open(&self.session_key, wire)?)
    }

    /// Channel content key for an epoch. Rotated on membership change by
    /// bumping the epoch.
    pub fn channel_content_key(&self, epoch: u64) -> [u8; 32] {
        let info = format!("zajel_channel_content_epoch_{epoch}");
        derive(&self.shared_secret, CHANNEL_SALT, info.as_bytes())
    }

    /// Key for upstream messages relayed to a channel owner.
    pub fn upstream_key(&self) -> [u8; 32] {
        derive(&self.shared_secret, UPSTREAM_SALT, UPSTREAM_INFO)
    }

    /// Key for a device-link tunnel bound to a link code.
    pub fn link_tunnel_key(&self, link_code: &str) -> [u8; 32] {
        let info = format!("zajel_link_tunnel_{link_code}");
        derive(&self.shared_secret, LINK_SALT, info.as_bytes())
    }

    /// Encrypt under a derived context key rather than the session key.
    pub fn encrypt_with(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        aead::seal(key, plaintext)
    }

    /// Decrypt under a derived context key.
    pub fn decrypt_with(key: &[u8; 32], wire: &[u8]) -> Result<Vec<u8>, SessionError> {
        Ok(aead::open(key, wire)?)
    }

    /// The peer's fingerprint, for display next to ours.
    pub fn their_fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.their_public)
    }
}

/// SHA-256 fingerprint of an X25519 public key.
///
/// Displayed out-of-band so two users can detect a man-in-the-middle by
/// comparing what each device shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a public key.
    pub fn of(key: &PublicKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self(digest.into())
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Unpadded RFC 4648 base32, grouped in fours for reading aloud.
    pub fn to_base32_grouped(&self) -> String {
        let raw = data_encoding::BASE32_NOPAD.encode(&self.0);
        raw.as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_session_key() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let a = PairwiseSession::establish(&alice, &bob.public());
        let b = PairwiseSession::establish(&bob, &alice.public());

        let wire = a.encrypt(b"the meeting is at noon");
        assert_eq!(b.decrypt(&wire).unwrap(), b"the meeting is at noon");

        let back = b.encrypt(b"confirmed");
        assert_eq!(a.decrypt(&back).unwrap(), b"confirmed");
    }

    #[test]
    fn hkdf_derivation_is_deterministic() {
        // Fixed inputs must yield byte-identical output on every platform.
        // This pins the cross-platform regression for the salted contexts.
        let shared = [0x42u8; 32];
        let key = derive(&shared, SESSION_SALT, SESSION_INFO);
        let again = derive(&shared, SESSION_SALT, SESSION_INFO);
        assert_eq!(key, again);

        let expected = {
            let hk = hkdf::Hkdf::<Sha256>::new(Some(b"zajel-session-salt-v1"), &shared);
            let mut out = [0u8; 32];
            hk.expand(b"zajel_session", &mut out).unwrap();
            out
        };
        assert_eq!(key, expected);
    }

    #[test]
    fn context_keys_are_all_distinct() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let s = PairwiseSession::establish(&alice, &bob.public());

        let keys = [
            s.session_key,
            s.channel_content_key(0),
            s.channel_content_key(1),
            s.upstream_key(),
            s.link_tunnel_key("A1B2C3"),
            s.link_tunnel_key("ZZZZZZ"),
        ];
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j], "contexts {i} and {j} collided");
            }
        }
    }

    #[test]
    fn tampering_is_rejected() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let s = PairwiseSession::establish(&alice, &bob.public());

        let mut wire = s.encrypt(b"original");
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert_eq!(s.decrypt(&wire), Err(SessionError::AuthFailed));

        assert_eq!(s.decrypt(&[1, 2, 3]), Err(SessionError::ShortInput));
    }

    #[test]
    fn fingerprint_renderings() {
        let pair = IdentityKeyPair::generate();
        let fp = pair.fingerprint();

        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let grouped = fp.to_base32_grouped();
        assert!(grouped.split(' ').all(|g| g.len() <= 4 && !g.is_empty()));
        // Same key → same fingerprint, both renderings.
        assert_eq!(fp, Fingerprint::of(&pair.public()));
    }

    #[test]
    fn restored_identity_matches() {
        let pair = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret(pair.secret_bytes());
        assert_eq!(pair.public().as_bytes(), restored.public().as_bytes());
    }
}
