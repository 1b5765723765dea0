//! Opaque relays: WebRTC signaling, call control, and chunk routing.
//!
//! The server forwards these frames without interpreting anything beyond
//! the routing header. The sender's peer id is stamped into `from` so the
//! receiver can answer.

use std::sync::Arc;

use super::ClientConn;
use crate::errors::{DispatchError, ErrorKind};
use crate::server::SharedState;

/// Stamp the sender onto a raw frame before forwarding.
fn stamped(raw: &serde_json::Value, from: &str) -> serde_json::Value {
    let mut frame = raw.clone();
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("from".to_string(), serde_json::Value::String(from.into()));
    }
    frame
}

/// offer / answer / ice_candidate / call_* — relay to the target.
pub fn relay(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    target: &str,
    raw: &serde_json::Value,
) -> Result<(), DispatchError> {
    let from = conn.require_peer_id()?;
    if !state.send_to_peer(target, &stamped(raw, from)) {
        return Err(DispatchError::new(ErrorKind::UnknownPeer, "target offline"));
    }
    Ok(())
}

/// `chunk_announce`: record which chunks this peer can serve.
pub fn chunk_announce(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    chunks: &[String],
) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?;
    if chunks.is_empty() {
        return Err(DispatchError::invalid("chunks must not be empty"));
    }
    state.chunks.announce(peer, chunks);
    Ok(())
}

/// `chunk_request`: route the request to one announcer of the chunk.
pub fn chunk_request(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    chunk_id: &str,
    _channel_id: &str,
    raw: &serde_json::Value,
) -> Result<(), DispatchError> {
    let from = conn.require_peer_id()?;
    let Some(holder) = state.chunks.pick_holder(chunk_id, from) else {
        return Err(DispatchError::new(
            ErrorKind::UnknownPeer,
            "no peer holds that chunk",
        ));
    };
    if !state.send_to_peer(&holder, &stamped(raw, from)) {
        return Err(DispatchError::new(ErrorKind::UnknownPeer, "holder offline"));
    }
    Ok(())
}

/// `chunk_push`: deliver a pushed chunk to the peer that asked for it.
pub fn chunk_push(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    target: &str,
    raw: &serde_json::Value,
) -> Result<(), DispatchError> {
    let from = conn.require_peer_id()?;
    if !state.send_to_peer(target, &stamped(raw, from)) {
        return Err(DispatchError::new(ErrorKind::UnknownPeer, "target offline"));
    }
    Ok(())
}
