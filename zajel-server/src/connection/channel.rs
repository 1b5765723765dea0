//! Channel fan-out: upstream messages to the owner, stream frames to
//! subscribers, and owner registration with queue flush.

use std::sync::Arc;
use std::time::Instant;

use super::{ClientConn, Outbound, send_frame};
use crate::errors::DispatchError;
use crate::server::{Metrics, SharedState};

/// Rewrite an upstream frame into the event delivered to the owner.
fn upstream_event(raw: &serde_json::Value, from: &str) -> serde_json::Value {
    let mut frame = raw.clone();
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("type".to_string(), "upstream".into());
        obj.insert("from".to_string(), from.into());
    }
    frame
}

/// `upstream-message`: forward to the channel owner if online, queue
/// otherwise. The queue is bounded drop-oldest; queueing is not an error.
pub fn upstream_message(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    channel_id: &str,
    raw: &serde_json::Value,
) -> Result<(), DispatchError> {
    let from = conn.require_peer_id()?;
    let event = upstream_event(raw, from);

    if let Some(owner) = state.channels.owner(channel_id) {
        if state.send_to_peer(&owner, &event) {
            return Ok(());
        }
        // Owner entry is stale (socket gone): fall through to the queue.
    }
    Metrics::bump(&state.metrics.upstream_queued_total);
    if state
        .channels
        .enqueue_upstream(channel_id, event, Instant::now())
    {
        tracing::debug!(channel = %channel_id, "upstream queue full, dropped oldest");
    }
    Ok(())
}

fn fan_out(state: &Arc<SharedState>, channel_id: &str, from: &str, frame: &serde_json::Value) {
    for subscriber in state.channels.subscribers(channel_id, from) {
        state.send_to_peer(&subscriber, frame);
    }
}

/// `stream-start`: remember the live stream and announce it.
pub fn stream_start(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    stream_id: &str,
    channel_id: &str,
    raw: &serde_json::Value,
) -> Result<(), DispatchError> {
    let from = conn.require_peer_id()?;
    let mut frame = raw.clone();
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("from".to_string(), from.into());
    }
    state.channels.stream_started(channel_id, stream_id, frame.clone());
    fan_out(state, channel_id, from, &frame);
    Ok(())
}

/// `stream-frame`: fan to the subscriber set at send time. Subscribers
/// that joined mid-stream see frames from the join point onward only.
pub fn stream_frame(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    channel_id: &str,
    raw: &serde_json::Value,
) -> Result<(), DispatchError> {
    let from = conn.require_peer_id()?;
    let mut frame = raw.clone();
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("from".to_string(), from.into());
    }
    fan_out(state, channel_id, from, &frame);
    Ok(())
}

/// `stream-end`: drop the live-stream record and announce the end.
pub fn stream_end(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    stream_id: &str,
    channel_id: &str,
    raw: &serde_json::Value,
) -> Result<(), DispatchError> {
    let from = conn.require_peer_id()?;
    state.channels.stream_ended(channel_id, stream_id);
    let mut frame = raw.clone();
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("from".to_string(), from.into());
    }
    fan_out(state, channel_id, from, &frame);
    Ok(())
}

/// `channel-subscribe`: join the subscriber set. Ongoing streams are
/// announced so the joiner can attach; missed frames are never replayed.
pub fn subscribe(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    channel_id: &str,
) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?;
    let active = state.channels.subscribe(channel_id, peer);
    for start_frame in active {
        send_frame(out, &start_frame);
    }
    Ok(())
}

/// `channel-owner-register`: claim ownership and flush the queue —
/// expired entries filtered, survivors in FIFO order, queue deleted.
pub fn owner_register(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    channel_id: &str,
) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?;
    let backlog = state.channels.claim_owner(channel_id, peer, Instant::now());
    tracing::debug!(
        channel = %channel_id,
        owner = %peer,
        backlog = backlog.len(),
        "channel owner registered"
    );
    for frame in backlog {
        send_frame(out, &frame);
    }
    Ok(())
}
