//! Rendezvous commands: dead drops, live tokens, relay registry, and
//! remote attestation.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::json;
use sha2::Sha256;

use super::frames::MAX_DEAD_DROP;
use super::{ClientConn, Outbound, PendingAttest, send_frame};
use crate::errors::{DispatchError, ErrorKind};
use crate::federation::Route;
use crate::registry::RegistryError;
use crate::registry::rendezvous::{FoundDeadDrop, HourlyRegistration};
use crate::server::{Metrics, SharedState};

/// Upper bound on hashes per registration frame.
const MAX_HASHES: usize = 64;

fn registry_error(e: RegistryError) -> DispatchError {
    match e {
        RegistryError::ShuttingDown => {
            DispatchError::new(ErrorKind::CapacityExhausted, "server is draining")
        }
        RegistryError::Storage(e) => {
            DispatchError::new(ErrorKind::StorageUnavailable, e.to_string())
        }
    }
}

/// Decode a batch of base64 hashes, enforcing the batch bound.
fn decode_hashes(field: &str, values: &[String]) -> Result<Vec<Vec<u8>>, DispatchError> {
    if values.is_empty() {
        return Err(DispatchError::invalid(format!("{field} must not be empty")));
    }
    if values.len() > MAX_HASHES {
        return Err(DispatchError::invalid(format!(
            "{field} exceeds {MAX_HASHES} entries"
        )));
    }
    values
        .iter()
        .map(|v| {
            B64.decode(v)
                .map_err(|_| DispatchError::invalid(format!("{field} entry is not base64")))
        })
        .collect()
}

/// Split hashes into locally owned ones and per-server redirects.
fn partition(
    state: &Arc<SharedState>,
    hashes: Vec<Vec<u8>>,
) -> (Vec<Vec<u8>>, Vec<serde_json::Value>) {
    let mut local = Vec::new();
    let mut redirects: Vec<(String, String, Vec<String>)> = Vec::new();
    for hash in hashes {
        match state.router.decide(&hash) {
            Route::Local => local.push(hash),
            Route::Remote {
                server_id,
                endpoint,
            } => {
                let encoded = B64.encode(&hash);
                match redirects.iter_mut().find(|(id, _, _)| id == &server_id) {
                    Some((_, _, items)) => items.push(encoded),
                    None => redirects.push((server_id, endpoint, vec![encoded])),
                }
            }
        }
    }
    if !redirects.is_empty() {
        Metrics::bump(&state.metrics.redirects_total);
    }
    let redirects = redirects
        .into_iter()
        .map(|(server_id, endpoint, items)| {
            json!({"serverId": server_id, "endpoint": endpoint, "items": items})
        })
        .collect();
    (local, redirects)
}

fn dead_drop_json(found: &FoundDeadDrop) -> serde_json::Value {
    json!({
        "peerId": found.peer_id,
        "deadDrop": B64.encode(&found.dead_drop),
        "relayId": found.relay_id,
    })
}

/// `register_daily_points`: upsert our dead drop on each point we own
/// and return whatever other peers left there; points owned elsewhere
/// come back as redirects (partial-result pattern).
pub fn register_daily_points(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    points: &[String],
    dead_drop: &str,
    relay_id: &str,
) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?.to_string();
    let hashes = decode_hashes("points", points)?;
    let dead_drop = B64
        .decode(dead_drop)
        .map_err(|_| DispatchError::invalid("deadDrop is not base64"))?;
    if dead_drop.len() > MAX_DEAD_DROP {
        return Err(DispatchError::invalid("deadDrop exceeds 4 KiB"));
    }

    let (local, redirects) = partition(state, hashes);
    let mut found = Vec::new();
    if !local.is_empty() {
        let now = chrono::Utc::now().timestamp();
        found = state
            .rendezvous
            .register_daily_points(&peer, &local, &dead_drop, relay_id, now)
            .map_err(registry_error)?;
    }

    send_frame(
        out,
        &json!({
            "type": "daily_registered",
            "foundDeadDrops": found.iter().map(dead_drop_json).collect::<Vec<_>>(),
            "redirects": redirects,
        }),
    );
    Ok(())
}

/// `register_hourly_tokens`: like daily points but presence-only, and
/// peers already waiting on a token get a real-time `match` event.
pub fn register_hourly_tokens(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
    tokens: &[String],
    relay_id: &str,
) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?.to_string();
    let hashes = decode_hashes("tokens", tokens)?;

    let (local, redirects) = partition(state, hashes);
    let mut registration = HourlyRegistration::default();
    if !local.is_empty() {
        let now = chrono::Utc::now().timestamp();
        registration = state
            .rendezvous
            .register_hourly_tokens(&peer, &local, relay_id, now)
            .map_err(registry_error)?;
    }
    let HourlyRegistration {
        live_matches,
        notify,
    } = registration;

    for (waiting_peer, arrival) in notify {
        Metrics::bump(&state.metrics.matches_total);
        state.send_to_peer(
            &waiting_peer,
            &json!({
                "type": "match",
                "peerId": arrival.peer_id,
                "relayId": arrival.relay_id,
                "tokenHash": B64.encode(&arrival.token_hash),
            }),
        );
    }

    send_frame(
        out,
        &json!({
            "type": "hourly_registered",
            "liveMatches": live_matches.iter().map(|m| json!({
                "peerId": m.peer_id,
                "relayId": m.relay_id,
                "tokenHash": B64.encode(&m.token_hash),
            })).collect::<Vec<_>>(),
            "redirects": redirects,
        }),
    );
    Ok(())
}

/// `register_rendezvous`: volunteer as a rendezvous relay host.
pub fn register_rendezvous(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    relay_id: &str,
) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?;
    let public_key = state.peer_public_key(peer).unwrap_or_default();
    state.relays.register(peer, &public_key, relay_id);
    Ok(())
}

/// `update_load`: relay capacity telemetry.
pub fn update_load(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    connected_count: u32,
    max_connections: Option<u32>,
) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?;
    state
        .relays
        .update_load(peer, connected_count, max_connections);
    Ok(())
}

/// `heartbeat`: refresh liveness.
pub fn heartbeat(conn: &ClientConn, state: &Arc<SharedState>) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?;
    state.relays.heartbeat(peer);
    Ok(())
}

/// `get_relays`: a shuffled low-load relay selection.
pub fn get_relays(
    conn: &ClientConn,
    state: &Arc<SharedState>,
    out: &Outbound,
) -> Result<(), DispatchError> {
    let peer = conn.require_peer_id()?;
    let relays = state.relays.available(peer, 10);
    send_frame(out, &json!({"type": "relays", "relays": relays}));
    Ok(())
}

/// `attest_request`: issue a fresh challenge nonce.
pub fn attest_request(
    conn: &mut ClientConn,
    out: &Outbound,
    build_token: String,
    device_id: String,
) -> Result<(), DispatchError> {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let nonce = hex::encode(nonce);
    conn.pending_attest = Some(PendingAttest {
        device_id,
        build_token,
        nonce: nonce.clone(),
    });
    send_frame(out, &json!({"type": "attest_challenge", "nonce": nonce}));
    Ok(())
}

/// `attest_response`: the response must be HMAC-SHA256 of the challenge
/// nonce keyed by the build token.
pub fn attest_response(
    conn: &mut ClientConn,
    out: &Outbound,
    nonce: &str,
    responses: &str,
) -> Result<(), DispatchError> {
    let Some(pending) = conn.pending_attest.take() else {
        return Err(DispatchError::invalid("no attestation in progress"));
    };
    if pending.nonce != nonce {
        return Err(DispatchError::invalid("nonce mismatch"));
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(pending.build_token.as_bytes())
        .map_err(|_| DispatchError::new(ErrorKind::CryptoInvalidKey, "bad build token"))?;
    mac.update(pending.nonce.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected != responses {
        return Err(DispatchError::new(
            ErrorKind::CryptoAuthFailed,
            "attestation response mismatch",
        ));
    }
    conn.attested = true;
    tracing::info!(device = %pending.device_id, "device attested");
    send_frame(out, &json!({"type": "attest_result", "ok": true}));
    Ok(())
}
