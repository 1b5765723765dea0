//! Sender-key group cryptography.
//!
//! Each member generates a random 32-byte sender key and distributes it
//! to every other member over existing pairwise sessions. A group message
//! is encrypted once with the author's sender key and broadcast; each
//! recipient decrypts with their stored copy of that author's key.
//!
//! Membership changes:
//!
//! - **Add** — the adder sends the joiner the roster plus all known
//!   sender keys (a [`WelcomePackage`]) over their pairwise session.
//! - **Remove** — every remaining member rotates its own sender key,
//!   purges the leaver's, and redistributes. Everything encrypted after
//!   rotation is dark to the leaver.
//!
//! Delivery is per-author FIFO: every author stamps a monotonically
//! increasing sequence number per group and receivers reject anything at
//! or below the author's high-water mark. Messages from different authors
//! carry no cross-order guarantee.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::aead::{self, AeadError};

/// Errors from group encryption and key management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GroupCryptoError {
    #[error("sender key must be 32 bytes of valid base64")]
    InvalidKey,
    #[error("no sender key stored for that author")]
    UnknownSender,
    #[error("input shorter than nonce and tag")]
    ShortInput,
    #[error("authentication failed")]
    AuthFailed,
    #[error("duplicate sequence number from author")]
    Duplicate,
}

impl From<AeadError> for GroupCryptoError {
    fn from(e: AeadError) -> Self {
        match e {
            AeadError::ShortInput => GroupCryptoError::ShortInput,
            AeadError::AuthFailed => GroupCryptoError::AuthFailed,
        }
    }
}

/// A member of a group roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub device_id: String,
    pub display_name: String,
    /// X25519 public key, base64.
    pub public_key: String,
    pub joined_at: DateTime<Utc>,
}

/// Group metadata shared among members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub members: Vec<GroupMember>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// What an adder sends a joiner over their pairwise session: the roster
/// and every sender key the adder knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePackage {
    pub group: Group,
    /// (deviceId, base64 sender key) pairs.
    pub sender_keys: Vec<(String, String)>,
}

/// An encrypted group message as broadcast to members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessage {
    pub group_id: String,
    /// Device id of the author whose sender key encrypted the payload.
    pub author: String,
    /// Author-scoped monotonic sequence number.
    pub sequence: u64,
    /// `[nonce][ct][tag]`, base64.
    pub payload: String,
}

/// The sender-key store plus sequencing state for one device.
#[derive(Default)]
pub struct GroupCrypto {
    /// (groupId, deviceId) → sender key.
    sender_keys: HashMap<(String, String), [u8; 32]>,
    /// Our next outgoing sequence number per group.
    send_seq: HashMap<String, u64>,
    /// Per (groupId, author) receive high-water mark.
    last_seen: HashMap<(String, String), u64>,
}

impl GroupCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh random sender key.
    pub fn generate_sender_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Store a sender key received from another member (base64 input).
    pub fn set_sender_key(
        &mut self,
        group_id: &str,
        device_id: &str,
        key_b64: &str,
    ) -> Result<(), GroupCryptoError> {
        let bytes = B64.decode(key_b64).map_err(|_| GroupCryptoError::InvalidKey)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| GroupCryptoError::InvalidKey)?;
        self.set_sender_key_bytes(group_id, device_id, key);
        Ok(())
    }

    /// Store a raw sender key.
    pub fn set_sender_key_bytes(&mut self, group_id: &str, device_id: &str, key: [u8; 32]) {
        self.sender_keys
            .insert((group_id.to_string(), device_id.to_string()), key);
    }

    /// Whether we hold a key for `(group, device)`.
    pub fn has_sender_key(&self, group_id: &str, device_id: &str) -> bool {
        self.sender_keys
            .contains_key(&(group_id.to_string(), device_id.to_string()))
    }

    /// Encrypt a message with our own sender key, stamping the next
    /// sequence number for this group.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        group_id: &str,
        self_device: &str,
    ) -> Result<GroupMessage, GroupCryptoError> {
        let key = self
            .sender_keys
            .get(&(group_id.to_string(), self_device.to_string()))
            .ok_or(GroupCryptoError::UnknownSender)?;
        let seq = self.send_seq.entry(group_id.to_string()).or_insert(0);
        *seq += 1;
        let wire = aead::seal(key, plaintext);
        Ok(GroupMessage {
            group_id: group_id.to_string(),
            author: self_device.to_string(),
            sequence: *seq,
            payload: B64.encode(wire),
        })
    }

    /// Decrypt raw ciphertext bytes from a known author. No sequencing —
    /// use [`GroupCrypto::receive`] for the full receive path.
    pub fn decrypt(
        &self,
        wire: &[u8],
        group_id: &str,
        author: &str,
    ) -> Result<Vec<u8>, GroupCryptoError> {
        let key = self
            .sender_keys
            .get(&(group_id.to_string(), author.to_string()))
            .ok_or(GroupCryptoError::UnknownSender)?;
        Ok(aead::open(key, wire)?)
    }

    /// Full receive path: reject duplicates by `(author, sequence)`, then
    /// decrypt. The high-water mark only advances on successful
    /// decryption so a forged frame cannot burn a sequence number.
    pub fn receive(&mut self, msg: &GroupMessage) -> Result<Vec<u8>, GroupCryptoError> {
        let mark_key = (msg.group_id.clone(), msg.author.clone());
        if let Some(&mark) = self.last_seen.get(&mark_key) {
            if msg.sequence <= mark {
                return Err(GroupCryptoError::Duplicate);
            }
        }
        let wire = B64
            .decode(&msg.payload)
            .map_err(|_| GroupCryptoError::ShortInput)?;
        let plaintext = self.decrypt(&wire, &msg.group_id, &msg.author)?;
        self.last_seen.insert(mark_key, msg.sequence);
        Ok(plaintext)
    }

    /// Purge a departed member's sender key. Must happen before anything
    /// is encrypted post-departure.
    pub fn remove_member(&mut self, group_id: &str, device_id: &str) {
        self.sender_keys
            .remove(&(group_id.to_string(), device_id.to_string()));
        self.last_seen
            .remove(&(group_id.to_string(), device_id.to_string()));
    }

    /// Rotate our own sender key after a membership change. Returns the
    /// new key for redistribution over pairwise sessions.
    pub fn rotate_sender_key(&mut self, group_id: &str, self_device: &str) -> [u8; 32] {
        let key = Self::generate_sender_key();
        self.set_sender_key_bytes(group_id, self_device, key);
        key
    }

    /// All keys we hold for a group, base64-encoded, for a welcome package.
    pub fn export_keys(&self, group_id: &str) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .sender_keys
            .iter()
            .filter(|((g, _), _)| g == group_id)
            .map(|((_, d), k)| (d.clone(), B64.encode(k)))
            .collect();
        keys.sort();
        keys
    }

    /// Drop all state for a group we left.
    pub fn purge_group(&mut self, group_id: &str) {
        self.sender_keys.retain(|(g, _), _| g != group_id);
        self.last_seen.retain(|(g, _), _| g != group_id);
        self.send_seq.remove(group_id);
    }
}
