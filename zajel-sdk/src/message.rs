//! The message model exchanged between a user's devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat message as stored and synced between devices.
///
/// Identity is the `(local_id, peer_id, timestamp)` triple: two copies of
/// a message that differ only in decrypted content (for example one side
/// holds a placeholder for an undecryptable frame) still compare equal,
/// so device sync does not duplicate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sender-assigned id, unique per device.
    #[serde(rename = "localId")]
    pub local_id: String,
    /// The conversation peer.
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub timestamp: DateTime<Utc>,
    /// Decrypted content. Not part of identity.
    #[serde(default)]
    pub content: String,
    /// True if this device authored the message.
    #[serde(default)]
    pub outgoing: bool,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.local_id == other.local_id
            && self.peer_id == other.peer_id
            && self.timestamp == other.timestamp
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message {
            local_id: "m-17".to_string(),
            peer_id: "K3YB7Q".to_string(),
            timestamp: "2026-03-01T12:00:00Z".parse().unwrap(),
            content: "hi".to_string(),
            outgoing: true,
        }
    }

    #[test]
    fn json_roundtrip_preserves_all_fields() {
        let msg = sample();
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.content, msg.content);
        assert_eq!(back.outgoing, msg.outgoing);
        assert!(json.contains("\"localId\""));
        assert!(json.contains("\"peerId\""));
    }

    #[test]
    fn equality_ignores_content() {
        let a = sample();
        let mut b = sample();
        b.content = "something else".to_string();
        b.outgoing = false;
        assert_eq!(a, b);

        let mut c = sample();
        c.local_id = "m-18".to_string();
        assert_ne!(a, c);
    }
}
