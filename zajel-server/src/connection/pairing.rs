//! Registration, pairing codes, and device links.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde_json::json;

use super::{ClientConn, Outbound, send_frame};
use crate::errors::{DispatchError, ErrorKind};
use crate::server::{PAIRING_CODE_TTL, PairingCode, PeerEntry, PendingLink, SharedState, generate_code};

/// `register`: allocate or reclaim a peer id, and register a pairing
/// code when one is offered. Collisions on either are resolved by
/// generating a fresh value — never two peers behind one code.
pub fn register(
    conn: &mut ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    pairing_code: Option<String>,
    public_key: Option<String>,
    peer_id: Option<String>,
) -> Result<(), DispatchError> {
    if state.shutting_down.load(Ordering::Relaxed) {
        return Err(DispatchError::new(
            ErrorKind::CapacityExhausted,
            "server is draining",
        ));
    }

    match (pairing_code, public_key, peer_id) {
        (Some(code), Some(public_key), _) => {
            let peer_id = allocate_peer_id(conn, state, out, None, Some(public_key.clone()));

            // Register the offered code; a collision with another live
            // peer yields a freshly generated one.
            let granted = {
                let mut codes = state.pairing_codes.lock();
                let now = Instant::now();
                codes.retain(|_, c| c.expires_at > now);
                let mut granted = code;
                while codes
                    .get(&granted)
                    .is_some_and(|c| c.peer_id != peer_id)
                {
                    granted = generate_code();
                }
                codes.insert(
                    granted.clone(),
                    PairingCode {
                        peer_id: peer_id.clone(),
                        public_key: public_key.clone(),
                        expires_at: now + PAIRING_CODE_TTL,
                    },
                );
                granted
            };
            if let Some(entry) = state.peers.lock().get_mut(&peer_id) {
                entry.pairing_code = Some(granted.clone());
            }

            send_frame(
                out,
                &json!({"type": "registered", "peerId": peer_id, "pairingCode": granted}),
            );
            Ok(())
        }
        (None, _, Some(wanted)) => {
            let peer_id = allocate_peer_id(conn, state, out, Some(wanted), None);
            send_frame(out, &json!({"type": "registered", "peerId": peer_id}));

            // Let previously paired peers know we're reachable again.
            let paired_with: Vec<String> = state
                .paired
                .lock()
                .get(&peer_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            for other in paired_with {
                state.send_to_peer(
                    &other,
                    &json!({"type": "peer_online", "peerId": peer_id}),
                );
            }
            Ok(())
        }
        _ => Err(DispatchError::invalid(
            "register needs pairingCode+publicKey or peerId",
        )),
    }
}

/// Pick a peer id: the wanted one if free, otherwise freshly generated
/// until unique. Inserts the peer entry and updates the connection.
fn allocate_peer_id(
    conn: &mut ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    wanted: Option<String>,
    public_key: Option<String>,
) -> String {
    // Re-registering on the same connection reuses the existing id.
    if let Some(ref existing) = conn.peer_id {
        if let Some(entry) = state.peers.lock().get_mut(existing) {
            if public_key.is_some() {
                entry.public_key = public_key;
            }
            return existing.clone();
        }
    }

    let mut peers = state.peers.lock();
    let id = match wanted.filter(|w| !w.is_empty() && !peers.contains_key(w)) {
        Some(wanted) => wanted,
        None => loop {
            let candidate = generate_code();
            if !peers.contains_key(&candidate) {
                break candidate;
            }
        },
    };
    peers.insert(
        id.clone(),
        PeerEntry {
            tx: out.clone(),
            public_key,
            pairing_code: None,
        },
    );
    drop(peers);
    conn.peer_id = Some(id.clone());
    id
}

/// `pair_request`: look the code up and forward the request to its
/// owner. The requester is parked until the owner answers.
pub fn pair_request(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    target_code: &str,
) -> Result<(), DispatchError> {
    let requester = conn.require_peer_id()?.to_string();

    let owner = {
        let codes = state.pairing_codes.lock();
        codes
            .get(target_code)
            .filter(|c| c.expires_at > Instant::now())
            .cloned()
    };
    let Some(owner) = owner else {
        return Err(DispatchError::new(ErrorKind::UnknownPeer, "unknown code"));
    };

    let requester_key = state.peer_public_key(&requester).unwrap_or_default();

    // Auto-accept in test mode (refused at startup in release builds).
    if state.config.test_mode {
        send_frame(
            out,
            &json!({
                "type": "pair_response",
                "targetCode": target_code,
                "accepted": true,
                "peerId": owner.peer_id,
                "publicKey": owner.public_key,
            }),
        );
        state.record_pairing(&requester, &owner.peer_id);
        return Ok(());
    }

    state
        .pending_pairs
        .lock()
        .entry(target_code.to_string())
        .or_default()
        .push(requester.clone());

    let delivered = state.send_to_peer(
        &owner.peer_id,
        &json!({
            "type": "pair_request",
            "targetCode": target_code,
            "peerId": requester,
            "publicKey": requester_key,
        }),
    );
    if !delivered {
        if let Some(waiting) = state.pending_pairs.lock().get_mut(target_code) {
            waiting.retain(|p| p != &requester);
        }
        return Err(DispatchError::new(ErrorKind::UnknownPeer, "owner offline"));
    }
    Ok(())
}

/// `pair_response`: the code owner answers; route the verdict back to
/// every parked requester. A rejection tombstones the request for those
/// requesters only — the code itself stays registered.
pub fn pair_response(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    target_code: &str,
    accepted: bool,
) -> Result<(), DispatchError> {
    let responder = conn.require_peer_id()?.to_string();

    let owns_code = state
        .pairing_codes
        .lock()
        .get(target_code)
        .is_some_and(|c| c.peer_id == responder);
    if !owns_code {
        return Err(DispatchError::invalid("not the owner of that code"));
    }

    let requesters = state
        .pending_pairs
        .lock()
        .remove(target_code)
        .unwrap_or_default();
    if requesters.is_empty() {
        return Err(DispatchError::new(
            ErrorKind::UnknownPeer,
            "no pending request for that code",
        ));
    }

    let responder_key = state.peer_public_key(&responder).unwrap_or_default();
    for requester in requesters {
        state.send_to_peer(
            &requester,
            &json!({
                "type": "pair_response",
                "targetCode": target_code,
                "accepted": accepted,
                "peerId": responder,
                "publicKey": responder_key,
            }),
        );
        if accepted {
            state.record_pairing(&requester, &responder);
        }
    }
    Ok(())
}

/// `link_request`: park the requesting device under the link code until
/// the other device responds.
pub fn link_request(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    link_code: &str,
    public_key: &str,
) -> Result<(), DispatchError> {
    let requester = conn.require_peer_id()?.to_string();
    state.pending_links.lock().insert(
        link_code.to_string(),
        PendingLink {
            requester,
            public_key: public_key.to_string(),
        },
    );
    Ok(())
}

/// `link_response`: complete the key exchange in both directions and
/// burn the code.
pub fn link_response(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    link_code: &str,
    accepted: bool,
    public_key: Option<&str>,
) -> Result<(), DispatchError> {
    let responder = conn.require_peer_id()?.to_string();

    let Some(pending) = state.pending_links.lock().remove(link_code) else {
        return Err(DispatchError::new(
            ErrorKind::UnknownPeer,
            "no pending link for that code",
        ));
    };

    let responder_key = public_key
        .map(str::to_string)
        .or_else(|| state.peer_public_key(&responder))
        .unwrap_or_default();

    state.send_to_peer(
        &pending.requester,
        &json!({
            "type": "link_response",
            "linkCode": link_code,
            "accepted": accepted,
            "peerId": responder,
            "publicKey": responder_key,
        }),
    );
    if accepted {
        // The responder still needs the requester's key for the tunnel.
        state.send_to_peer(
            &responder,
            &json!({
                "type": "link_request",
                "linkCode": link_code,
                "peerId": pending.requester,
                "publicKey": pending.public_key,
            }),
        );
    }
    Ok(())
}
