//! Server-to-server federation.
//!
//! Three cooperating pieces:
//!
//! - [`gossip`] — SWIM failure detection and membership dissemination
//!   (direct ping, indirect ping-req, suspicion, incarnation refutation,
//!   piggybacked updates, periodic full state exchange)
//! - [`ring`] / [`router`] — consistent-hash ring with virtual nodes that
//!   decides which server owns a rendezvous hash, and the redirect
//!   decisions derived from it
//! - [`transport`] — long-lived TCP links carrying signed JSON envelopes,
//!   with backoff reconnect and dial-race tie-breaking
//!
//! Every envelope is Ed25519-signed by its sender; unverifiable traffic
//! is dropped before it reaches any of the above.

pub mod envelope;
pub mod gossip;
pub mod membership;
pub mod ring;
pub mod router;
pub mod transport;

pub use envelope::{Envelope, Subtype};
pub use gossip::{Gossip, GossipConfig};
pub use membership::{Member, MemberStatus, MemberUpdate, MembershipTable};
pub use ring::HashRing;
pub use router::{DhtRouter, Route};
pub use transport::FederationTransport;

/// Failures of the federation transport layer. Link loss itself is not
/// an error here — liveness verdicts belong to the gossip detector.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("binding federation listener on port {port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer closed during handshake")]
    HandshakeClosed,
    #[error("malformed hello")]
    MalformedHello,
    #[error("unverifiable envelope signature")]
    SignatureInvalid,
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("encoding envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
