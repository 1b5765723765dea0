//! Client-visible error kinds and error frame construction.
//!
//! Every error a client can see is one of these kinds, rendered as
//! `{"type":"error","reason":"<kind>","detail":"..."}` over the same
//! connection. Internal failures are logged with a correlation id and
//! reported to the client as `internal` with no detail.

use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    InvalidMessage,
    RateLimited,
    NotRegistered,
    UnknownPeer,
    UnknownChannel,
    QueueFull,
    CapacityExhausted,
    CryptoInvalidKey,
    CryptoAuthFailed,
    CryptoShortInput,
    ProtocolUnsupportedVersion,
    ProtocolUnknownType,
    FederationUnreachable,
    FederationSignatureInvalid,
    StorageUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::InvalidMessage => "invalid_message",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotRegistered => "not_registered",
            ErrorKind::UnknownPeer => "unknown_peer",
            ErrorKind::UnknownChannel => "unknown_channel",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::CapacityExhausted => "capacity_exhausted",
            ErrorKind::CryptoInvalidKey => "crypto_invalid_key",
            ErrorKind::CryptoAuthFailed => "crypto_auth_failed",
            ErrorKind::CryptoShortInput => "crypto_short_input",
            ErrorKind::ProtocolUnsupportedVersion => "protocol_unsupported_version",
            ErrorKind::ProtocolUnknownType => "protocol_unknown_type",
            ErrorKind::FederationUnreachable => "federation_unreachable",
            ErrorKind::FederationSignatureInvalid => "federation_signature_invalid",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A dispatch failure carrying the client-visible kind and detail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {detail}", .kind.as_str())]
pub struct DispatchError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl DispatchError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidMessage, detail)
    }
}

/// Render an error frame.
pub fn error_frame(kind: ErrorKind, detail: Option<&str>) -> serde_json::Value {
    match detail {
        Some(d) => json!({"type": "error", "reason": kind.as_str(), "detail": d}),
        None => json!({"type": "error", "reason": kind.as_str()}),
    }
}
