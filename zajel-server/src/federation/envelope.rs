//! Signed gossip envelopes.
//!
//! Every server-to-server message is one JSON envelope:
//!
//! ```json
//! {"type":"gossip","subtype":"ping","senderId":"...","sequenceNumber":7,
//!  "timestamp":1719000000,"payload":{...},"piggyback":[...],"signature":"..."}
//! ```
//!
//! The signature is Ed25519 over the canonical JSON of the envelope with
//! the signature field empty. serde_json orders object keys
//! deterministically, so both sides serialize identical bytes.

use serde::{Deserialize, Serialize};

use super::membership::{Member, MemberUpdate};
use crate::identity::{self, ServerIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subtype {
    Ping,
    PingAck,
    PingReq,
    Join,
    Leave,
    Suspect,
    Confirm,
    StateSync,
    /// Link handshake: first envelope on every new transport connection.
    Hello,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: Subtype,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    pub timestamp: i64,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub piggyback: Vec<MemberUpdate>,
    #[serde(default)]
    pub signature: String,
}

impl Envelope {
    /// Build and sign an envelope.
    pub fn signed(
        identity: &ServerIdentity,
        subtype: Subtype,
        sequence_number: u64,
        timestamp: i64,
        payload: serde_json::Value,
        piggyback: Vec<MemberUpdate>,
    ) -> Self {
        let mut env = Self {
            kind: "gossip".to_string(),
            subtype,
            sender_id: identity.server_id().to_string(),
            sequence_number,
            timestamp,
            payload,
            piggyback,
            signature: String::new(),
        };
        let bytes = env.canonical_bytes();
        env.signature = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(identity.sign(&bytes).to_bytes())
        };
        env
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        serde_json::to_vec(&unsigned).unwrap_or_default()
    }

    /// Verify the signature against the claimed sender id.
    pub fn verify(&self) -> bool {
        use base64::Engine;
        let Ok(sig) = base64::engine::general_purpose::STANDARD.decode(&self.signature) else {
            return false;
        };
        identity::verify(&self.sender_id, &self.canonical_bytes(), &sig)
    }
}

// ── typed payloads ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingAckPayload {
    /// The sequence number of the ping (or ping_req) being answered.
    #[serde(rename = "ackSeq")]
    pub ack_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReqPayload {
    /// Server to probe on the requester's behalf.
    pub target: String,
    /// Requester's waiter id, echoed in the eventual ack.
    #[serde(rename = "originSeq")]
    pub origin_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectPayload {
    pub target: String,
    pub incarnation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub member: Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeavePayload {
    #[serde(rename = "serverId")]
    pub server_id: String,
    pub incarnation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncPayload {
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signed_envelopes_verify() {
        let identity = ServerIdentity::ephemeral();
        let env = Envelope::signed(
            &identity,
            Subtype::Ping,
            42,
            1_719_000_000,
            json!({}),
            Vec::new(),
        );
        assert!(env.verify());
    }

    #[test]
    fn any_field_tamper_breaks_the_signature() {
        let identity = ServerIdentity::ephemeral();
        let env = Envelope::signed(
            &identity,
            Subtype::Suspect,
            1,
            1_719_000_000,
            json!({"target": "victim", "incarnation": 3}),
            Vec::new(),
        );

        let mut tampered = env.clone();
        tampered.payload = json!({"target": "victim", "incarnation": 4});
        assert!(!tampered.verify());

        let mut tampered = env.clone();
        tampered.sequence_number = 2;
        assert!(!tampered.verify());

        let mut tampered = env.clone();
        tampered.sender_id = ServerIdentity::ephemeral().server_id().to_string();
        assert!(!tampered.verify());

        let mut tampered = env;
        tampered.signature = String::new();
        assert!(!tampered.verify());
    }

    #[test]
    fn wire_roundtrip_preserves_signature_validity() {
        let identity = ServerIdentity::ephemeral();
        let env = Envelope::signed(
            &identity,
            Subtype::StateSync,
            9,
            1_719_000_000,
            serde_json::to_value(StateSyncPayload { members: vec![] }).unwrap(),
            Vec::new(),
        );
        let wire = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&wire).unwrap();
        assert!(back.verify());
        assert_eq!(back.subtype, Subtype::StateSync);
    }
}
