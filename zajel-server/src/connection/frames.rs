//! Client frame schema.
//!
//! Frames are JSON objects with a mandatory `type`. The enum captures the
//! required fields per type; unknown extra fields are allowed and, for
//! the opaque-relay types, forwarded untouched from the raw frame.

use serde::Deserialize;

/// Hard frame cap applied before parsing.
pub const MAX_BULK_FRAME: usize = 256 * 1024;

/// Cap for everything except the bulk types.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// Dead drops are bounded ciphertext.
pub const MAX_DEAD_DROP: usize = 4 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "pairingCode")]
        pairing_code: Option<String>,
        #[serde(rename = "publicKey")]
        public_key: Option<String>,
        #[serde(rename = "peerId")]
        peer_id: Option<String>,
    },

    #[serde(rename = "pair_request")]
    PairRequest {
        #[serde(rename = "targetCode")]
        target_code: String,
    },

    #[serde(rename = "pair_response")]
    PairResponse {
        #[serde(rename = "targetCode")]
        target_code: String,
        accepted: bool,
    },

    // Opaque signaling relays: validated for `target`, forwarded raw.
    #[serde(rename = "offer")]
    Offer { target: String },
    #[serde(rename = "answer")]
    Answer { target: String },
    #[serde(rename = "ice_candidate")]
    IceCandidate { target: String },
    #[serde(rename = "call_offer")]
    CallOffer { target: String },
    #[serde(rename = "call_answer")]
    CallAnswer { target: String },
    #[serde(rename = "call_reject")]
    CallReject { target: String },
    #[serde(rename = "call_hangup")]
    CallHangup { target: String },
    #[serde(rename = "call_ice")]
    CallIce { target: String },

    #[serde(rename = "link_request")]
    LinkRequest {
        #[serde(rename = "linkCode")]
        link_code: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    #[serde(rename = "link_response")]
    LinkResponse {
        #[serde(rename = "linkCode")]
        link_code: String,
        accepted: bool,
        #[serde(rename = "publicKey")]
        public_key: Option<String>,
    },

    #[serde(rename = "upstream-message")]
    UpstreamMessage {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "ephemeralPublicKey")]
        ephemeral_public_key: String,
    },

    #[serde(rename = "stream-start")]
    StreamStart {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "channelId")]
        channel_id: String,
    },
    #[serde(rename = "stream-frame")]
    StreamFrame {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "channelId")]
        channel_id: String,
    },
    #[serde(rename = "stream-end")]
    StreamEnd {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "channel-subscribe")]
    ChannelSubscribe {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "channel-owner-register")]
    ChannelOwnerRegister {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    #[serde(rename = "chunk_announce")]
    ChunkAnnounce {
        #[serde(rename = "peerId")]
        peer_id: String,
        chunks: Vec<String>,
    },
    #[serde(rename = "chunk_request")]
    ChunkRequest {
        #[serde(rename = "chunkId")]
        chunk_id: String,
        #[serde(rename = "channelId")]
        channel_id: String,
    },
    #[serde(rename = "chunk_push")]
    ChunkPush {
        #[serde(rename = "chunkId")]
        chunk_id: String,
        #[serde(rename = "channelId")]
        channel_id: String,
        target: String,
    },

    #[serde(rename = "update_load")]
    UpdateLoad {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "connectedCount")]
        connected_count: u32,
        #[serde(rename = "maxConnections")]
        max_connections: Option<u32>,
    },

    #[serde(rename = "register_rendezvous")]
    RegisterRendezvous {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "relayId")]
        relay_id: String,
    },

    #[serde(rename = "register_daily_points")]
    RegisterDailyPoints {
        #[serde(rename = "peerId")]
        peer_id: String,
        /// Base64 point hashes.
        points: Vec<String>,
        #[serde(rename = "deadDrop")]
        dead_drop: String,
        #[serde(rename = "relayId")]
        relay_id: String,
    },

    #[serde(rename = "register_hourly_tokens")]
    RegisterHourlyTokens {
        #[serde(rename = "peerId")]
        peer_id: String,
        /// Base64 token hashes.
        tokens: Vec<String>,
        #[serde(rename = "relayId")]
        relay_id: String,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "attest_request")]
    AttestRequest {
        build_token: String,
        device_id: String,
    },

    #[serde(rename = "attest_response")]
    AttestResponse { nonce: String, responses: String },

    #[serde(rename = "get_relays")]
    GetRelays,
}

impl ClientFrame {
    /// Bulk types get the larger size cap.
    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            ClientFrame::UpstreamMessage { .. }
                | ClientFrame::StreamFrame { .. }
                | ClientFrame::ChunkPush { .. }
        )
    }
}

/// The `peerId` a frame claims to be from, if it carries one.
pub fn embedded_peer_id(value: &serde_json::Value) -> Option<&str> {
    value.get("peerId").and_then(|v| v.as_str())
}
