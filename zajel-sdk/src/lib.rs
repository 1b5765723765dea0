//! Client-side building blocks for the Zajel messaging fabric.
//!
//! This crate holds everything a client needs that the server must never
//! see in the clear:
//!
//! - [`session`] — X25519 pairwise sessions with salted-HKDF key
//!   derivation and ChaCha20-Poly1305 content encryption
//! - [`group`] — sender-key group cryptography with rotation on
//!   membership change and per-author FIFO sequencing
//! - [`protocol`] — the length-delimited binary frame codec spoken over
//!   the peer-to-peer data channel
//! - [`message`] — the message model exchanged between devices
//! - [`keystore`] — OS secret-store persistence for identity and sender
//!   keys
//!
//! The server relays ciphertext blobs produced here without interpreting
//! them; nothing in this crate depends on the server implementation.

pub mod group;
pub mod keystore;
pub mod message;
pub mod protocol;
pub mod session;

mod aead;

pub use group::{GroupCrypto, GroupCryptoError, GroupMessage};
pub use message::Message;
pub use protocol::{Frame, FrameType, ProtocolError};
pub use session::{Fingerprint, IdentityKeyPair, PairwiseSession, SessionError};
