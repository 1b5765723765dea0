//! Per-client connection handler.
//!
//! Each WebSocket connection is owned by exactly one handler task, the
//! sole mutator of that connection's state. Every frame runs the same
//! pipeline — size cap, rate limit, parse, schema validation, peer-id
//! consistency, dispatch — with earlier checks failing fast. Dispatch and
//! disconnect cleanup run under per-section error boundaries so one
//! failure never skips the rest.
//!
//! Submodules by responsibility:
//! - [`frames`] — the client frame schema
//! - [`pairing`] — registration, pairing codes, device links
//! - [`signaling`] — opaque relays (offer/answer/ICE, calls, chunks)
//! - [`channel`] — channel fan-out, upstream queueing, streams
//! - [`rendezvous_cmd`] — dead drops, live tokens, relays, attestation

pub mod frames;

mod channel;
mod pairing;
mod rendezvous_cmd;
mod signaling;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use tokio::sync::mpsc;

use crate::errors::{DispatchError, ErrorKind, error_frame};
use crate::ratelimit::TokenBucket;
use crate::server::{Metrics, SharedState};
use frames::{ClientFrame, MAX_BULK_FRAME, MAX_CONTROL_FRAME, embedded_peer_id};

/// Outbound frame queue for one connection.
pub type Outbound = mpsc::Sender<String>;

/// Challenge state between `attest_request` and `attest_response`.
#[derive(Debug, Clone)]
pub struct PendingAttest {
    pub device_id: String,
    pub build_token: String,
    pub nonce: String,
}

/// State of a single client connection.
pub struct ClientConn {
    pub session_id: String,
    /// Set once `register` succeeds.
    pub peer_id: Option<String>,
    pub limiter: TokenBucket,
    pub pending_attest: Option<PendingAttest>,
    pub attested: bool,
}

impl ClientConn {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            peer_id: None,
            limiter: TokenBucket::for_connection(),
            pending_attest: None,
            attested: false,
        }
    }

    /// The registered peer id, or a `not_registered` dispatch error.
    pub fn require_peer_id(&self) -> Result<&str, DispatchError> {
        self.peer_id
            .as_deref()
            .ok_or_else(|| DispatchError::new(ErrorKind::NotRegistered, "register first"))
    }
}

/// Queue a frame on an outbound channel. Best-effort: a full buffer means
/// a stuck client, and the socket loop will notice soon enough.
pub fn send_frame(out: &Outbound, frame: &serde_json::Value) {
    let _ = out.try_send(frame.to_string());
}

/// Handle one WebSocket connection to completion.
pub async fn handle_socket(mut socket: WebSocket, state: Arc<SharedState>) {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let session_id = format!("conn-{}", COUNTER.fetch_add(1, Ordering::Relaxed));
    tracing::info!(%session_id, "client connected");
    Metrics::bump(&state.metrics.connections_total);

    let mut conn = ClientConn::new(session_id.clone());
    let (tx, mut rx) = mpsc::channel::<String>(256);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if socket.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        process_frame(&mut conn, &state, &tx, text.as_str()).await;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => process_frame(&mut conn, &state, &tx, text).await,
                            Err(_) => {
                                send_frame(&tx, &error_frame(ErrorKind::ParseError, None));
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(_)) => break,
                }
            }
        }
    }

    run_cleanup(&mut conn, &state);
    tracing::info!(
        %session_id,
        peer_id = conn.peer_id.as_deref().unwrap_or("-"),
        "client disconnected"
    );
}

/// The per-frame pipeline. Order matters: earlier checks fail fast.
pub async fn process_frame(
    conn: &mut ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    raw: &str,
) {
    Metrics::bump(&state.metrics.frames_total);

    // 1. Hard size cap, before any parsing.
    if raw.len() > MAX_BULK_FRAME {
        send_frame(
            out,
            &error_frame(ErrorKind::InvalidMessage, Some("frame too large")),
        );
        return;
    }

    // 2. Token-bucket rate limit. Reported, never a disconnect.
    if !conn.limiter.try_acquire() {
        Metrics::bump(&state.metrics.rate_limited_total);
        send_frame(out, &error_frame(ErrorKind::RateLimited, None));
        return;
    }

    // 3. Parse as a JSON object.
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            send_frame(out, &error_frame(ErrorKind::ParseError, None));
            return;
        }
    };
    if !value.is_object() {
        send_frame(out, &error_frame(ErrorKind::ParseError, None));
        return;
    }

    // 4. Schema validation per message type.
    let frame: ClientFrame = match serde_json::from_value(value.clone()) {
        Ok(f) => f,
        Err(e) => {
            send_frame(
                out,
                &error_frame(ErrorKind::InvalidMessage, Some(&e.to_string())),
            );
            return;
        }
    };

    // Control frames get the tighter cap once the type is known.
    if !frame.is_bulk() && raw.len() > MAX_CONTROL_FRAME {
        send_frame(
            out,
            &error_frame(ErrorKind::InvalidMessage, Some("frame too large")),
        );
        return;
    }

    // 5. Consistency: an embedded peerId must match the registered one.
    if let Some(claimed) = embedded_peer_id(&value) {
        match conn.peer_id.as_deref() {
            Some(registered) if registered == claimed => {}
            Some(_) => {
                send_frame(
                    out,
                    &error_frame(ErrorKind::InvalidMessage, Some("peerId mismatch")),
                );
                return;
            }
            None => {
                send_frame(out, &error_frame(ErrorKind::NotRegistered, None));
                return;
            }
        }
    }

    // 6. Dispatch, inside an error boundary: a failing handler reports
    // and preserves the connection.
    if let Err(e) = dispatch(conn, state, out, frame, &value).await {
        Metrics::bump(&state.metrics.errors_total);
        let correlation = rand::random::<u64>();
        tracing::warn!(
            session_id = %conn.session_id,
            correlation,
            "dispatch error: {e}"
        );
        let detail = match e.kind {
            // Internal details stay in the log, keyed by correlation id.
            ErrorKind::Internal | ErrorKind::StorageUnavailable => None,
            _ => Some(e.detail.as_str()),
        };
        send_frame(out, &error_frame(e.kind, detail));
    }
}

async fn dispatch(
    conn: &mut ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    frame: ClientFrame,
    raw: &serde_json::Value,
) -> Result<(), DispatchError> {
    match frame {
        ClientFrame::Register {
            pairing_code,
            public_key,
            peer_id,
        } => pairing::register(conn, state, out, pairing_code, public_key, peer_id),
        ClientFrame::PairRequest { target_code } => {
            pairing::pair_request(conn, state, out, &target_code)
        }
        ClientFrame::PairResponse {
            target_code,
            accepted,
        } => pairing::pair_response(conn, state, &target_code, accepted),
        ClientFrame::LinkRequest {
            link_code,
            public_key,
        } => pairing::link_request(conn, state, &link_code, &public_key),
        ClientFrame::LinkResponse {
            link_code,
            accepted,
            public_key,
        } => pairing::link_response(conn, state, &link_code, accepted, public_key.as_deref()),

        ClientFrame::Offer { target }
        | ClientFrame::Answer { target }
        | ClientFrame::IceCandidate { target }
        | ClientFrame::CallOffer { target }
        | ClientFrame::CallAnswer { target }
        | ClientFrame::CallReject { target }
        | ClientFrame::CallHangup { target }
        | ClientFrame::CallIce { target } => signaling::relay(conn, state, &target, raw),

        ClientFrame::UpstreamMessage { channel_id, .. } => {
            channel::upstream_message(conn, state, &channel_id, raw)
        }
        ClientFrame::StreamStart {
            stream_id,
            channel_id,
        } => channel::stream_start(conn, state, &stream_id, &channel_id, raw),
        ClientFrame::StreamFrame {
            stream_id: _,
            channel_id,
        } => channel::stream_frame(conn, state, &channel_id, raw),
        ClientFrame::StreamEnd {
            stream_id,
            channel_id,
        } => channel::stream_end(conn, state, &stream_id, &channel_id, raw),
        ClientFrame::ChannelSubscribe { channel_id } => {
            channel::subscribe(conn, state, out, &channel_id)
        }
        ClientFrame::ChannelOwnerRegister { channel_id } => {
            channel::owner_register(conn, state, out, &channel_id)
        }

        ClientFrame::ChunkAnnounce { chunks, .. } => signaling::chunk_announce(conn, state, &chunks),
        ClientFrame::ChunkRequest {
            chunk_id,
            channel_id,
        } => signaling::chunk_request(conn, state, &chunk_id, &channel_id, raw),
        ClientFrame::ChunkPush { target, .. } => signaling::chunk_push(conn, state, &target, raw),

        ClientFrame::UpdateLoad {
            connected_count,
            max_connections,
            ..
        } => rendezvous_cmd::update_load(conn, state, connected_count, max_connections),
        ClientFrame::RegisterRendezvous { relay_id, .. } => {
            rendezvous_cmd::register_rendezvous(conn, state, &relay_id)
        }
        ClientFrame::RegisterDailyPoints {
            points,
            dead_drop,
            relay_id,
            ..
        } => rendezvous_cmd::register_daily_points(conn, state, out, &points, &dead_drop, &relay_id),
        ClientFrame::RegisterHourlyTokens {
            tokens, relay_id, ..
        } => rendezvous_cmd::register_hourly_tokens(conn, state, out, &tokens, &relay_id),
        ClientFrame::Heartbeat { .. } => rendezvous_cmd::heartbeat(conn, state),
        ClientFrame::GetRelays => rendezvous_cmd::get_relays(conn, state, out),

        ClientFrame::Ping => {
            send_frame(out, &serde_json::json!({"type": "pong"}));
            Ok(())
        }
        ClientFrame::AttestRequest {
            build_token,
            device_id,
        } => rendezvous_cmd::attest_request(conn, out, build_token, device_id),
        ClientFrame::AttestResponse { nonce, responses } => {
            rendezvous_cmd::attest_response(conn, out, &nonce, &responses)
        }
    }
}

/// Disconnect cleanup. Every section runs under its own error boundary:
/// a failure is logged and swallowed, and the remaining sections still
/// run. Nothing here can escape to the transport close path.
pub fn run_cleanup(conn: &mut ClientConn, state: &Arc<SharedState>) {
    let peer_id = conn.peer_id.clone();
    let session_id = conn.session_id.clone();

    let mut section = |name: &str, f: &mut dyn FnMut() -> Result<(), String>| {
        if let Err(e) = f() {
            tracing::warn!(%session_id, section = name, "cleanup failed: {e}");
        }
    };

    // (a) attestation state
    section("attestation", &mut || {
        conn.pending_attest = None;
        conn.attested = false;
        Ok(())
    });

    // (b) rate limiter
    section("rate_limiter", &mut || {
        conn.limiter = TokenBucket::for_connection();
        Ok(())
    });

    // (c) channel owner release — queues stay for the next owner
    section("channel_owner", &mut || {
        if let Some(ref peer) = peer_id {
            let released = state.channels.release_owner(peer);
            if !released.is_empty() {
                tracing::debug!(%session_id, ?released, "released channel ownership");
            }
        }
        Ok(())
    });

    // (d) channel subscriptions
    section("subscriptions", &mut || {
        if let Some(ref peer) = peer_id {
            state.channels.remove_subscriber_everywhere(peer);
        }
        Ok(())
    });

    // (e) pairing code reclaim
    section("pairing_codes", &mut || {
        if let Some(ref peer) = peer_id {
            let mut codes = state.pairing_codes.lock();
            let reclaimed: Vec<String> = codes
                .iter()
                .filter(|(_, c)| &c.peer_id == peer)
                .map(|(code, _)| code.clone())
                .collect();
            for code in &reclaimed {
                codes.remove(code);
            }
            drop(codes);
            let mut pending = state.pending_pairs.lock();
            for code in &reclaimed {
                pending.remove(code);
            }
        }
        Ok(())
    });

    // (f) peer release: relay, rendezvous, chunk, presence
    section("peer_release", &mut || {
        let Some(ref peer) = peer_id else {
            return Ok(());
        };
        state.peers.lock().remove(peer);
        state.relays.unregister(peer);
        state.chunks.unregister_peer(peer);
        state
            .rendezvous
            .unregister_peer(peer)
            .map_err(|e| e.to_string())?;

        // Tell paired peers we went offline.
        let paired_with = state.paired.lock().remove(peer).unwrap_or_default();
        for other in &paired_with {
            if let Some(set) = state.paired.lock().get_mut(other) {
                set.remove(peer);
            }
            state.send_to_peer(
                other,
                &serde_json::json!({"type": "peer_offline", "peerId": peer}),
            );
        }
        Ok(())
    });
}
