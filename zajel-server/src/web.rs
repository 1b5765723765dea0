//! WebSocket client transport and the admin HTTP surface.
//!
//! `/ws` upgrades into the per-connection handler. `/health` is public;
//! `/stats` and `/metrics` require an HS256 Bearer JWT verified against
//! `ZAJEL_ADMIN_JWT_SECRET`. CORS only ever allows the single configured
//! admin origin, with credentials — never a wildcard.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::connection;
use crate::server::SharedState;

/// Build the router with the WebSocket endpoint and admin API.
pub fn router(state: Arc<SharedState>) -> Router {
    let cors = state.config.admin_ui_origin.as_ref().and_then(|origin| {
        let origin: HeaderValue = origin.parse().ok()?;
        Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_credentials(true)
                .allow_methods([Method::GET])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    });

    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(state);

    match cors {
        // Same-origin only when no admin origin is configured: no
        // cross-origin allow header is ever emitted.
        Some(cors) => app.layer(cors),
        None => app,
    }
}

async fn ws_upgrade(
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    exp: usize,
}

/// Verify the admin Bearer token. No secret configured means the admin
/// surface is closed.
fn check_admin(secret: Option<&str>, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(secret) = secret else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|_| ())
    .map_err(|_| StatusCode::UNAUTHORIZED)
}

async fn stats(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    check_admin(state.config.admin_jwt_secret.as_deref(), &headers)?;

    let (members_total, members_alive) = {
        let gossip = state.gossip.lock();
        match gossip.as_ref() {
            Some(g) => (g.membership.snapshot().len(), g.membership.alive_count()),
            None => (0, 0),
        }
    };

    Ok(Json(json!({
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "peers": state.peers.lock().len(),
        "pairingCodes": state.pairing_codes.lock().len(),
        "channels": state.channels.channel_count(),
        "queuedUpstream": state.channels.queued_total(),
        "relays": state.relays.len(),
        "chunks": state.chunks.chunk_count(),
        "federation": {
            "members": members_total,
            "alive": members_alive,
            "ringActive": state.router.active_count(),
        },
        "counters": {
            "connections": state.metrics.connections_total.load(Ordering::Relaxed),
            "frames": state.metrics.frames_total.load(Ordering::Relaxed),
            "rateLimited": state.metrics.rate_limited_total.load(Ordering::Relaxed),
            "errors": state.metrics.errors_total.load(Ordering::Relaxed),
            "matches": state.metrics.matches_total.load(Ordering::Relaxed),
            "upstreamQueued": state.metrics.upstream_queued_total.load(Ordering::Relaxed),
            "redirects": state.metrics.redirects_total.load(Ordering::Relaxed),
        },
    })))
}

async fn metrics(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    check_admin(state.config.admin_jwt_secret.as_deref(), &headers)?;

    let m = &state.metrics;
    let body = format!(
        concat!(
            "# TYPE zajel_connections_total counter\n",
            "zajel_connections_total {}\n",
            "# TYPE zajel_frames_total counter\n",
            "zajel_frames_total {}\n",
            "# TYPE zajel_rate_limited_total counter\n",
            "zajel_rate_limited_total {}\n",
            "# TYPE zajel_errors_total counter\n",
            "zajel_errors_total {}\n",
            "# TYPE zajel_matches_total counter\n",
            "zajel_matches_total {}\n",
            "# TYPE zajel_upstream_queued_total counter\n",
            "zajel_upstream_queued_total {}\n",
            "# TYPE zajel_redirects_total counter\n",
            "zajel_redirects_total {}\n",
            "# TYPE zajel_peers gauge\n",
            "zajel_peers {}\n",
            "# TYPE zajel_ring_active gauge\n",
            "zajel_ring_active {}\n",
        ),
        m.connections_total.load(Ordering::Relaxed),
        m.frames_total.load(Ordering::Relaxed),
        m.rate_limited_total.load(Ordering::Relaxed),
        m.errors_total.load(Ordering::Relaxed),
        m.matches_total.load(Ordering::Relaxed),
        m.upstream_queued_total.load(Ordering::Relaxed),
        m.redirects_total.load(Ordering::Relaxed),
        state.peers.lock().len(),
        state.router.active_count(),
    );
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    fn token(secret: &str, exp: i64) -> String {
        let claims = serde_json::json!({"sub": "admin", "exp": exp});
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_passes() {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let headers = bearer(&token("s3cret", exp));
        assert!(check_admin(Some("s3cret"), &headers).is_ok());
    }

    #[test]
    fn wrong_secret_expired_or_missing_all_fail() {
        let exp = chrono::Utc::now().timestamp() + 3600;

        let headers = bearer(&token("other-secret", exp));
        assert_eq!(
            check_admin(Some("s3cret"), &headers),
            Err(StatusCode::UNAUTHORIZED)
        );

        let stale = chrono::Utc::now().timestamp() - 3600;
        let headers = bearer(&token("s3cret", stale));
        assert_eq!(
            check_admin(Some("s3cret"), &headers),
            Err(StatusCode::UNAUTHORIZED)
        );

        assert_eq!(
            check_admin(Some("s3cret"), &HeaderMap::new()),
            Err(StatusCode::UNAUTHORIZED)
        );

        // No secret configured: the admin surface is closed outright.
        let headers = bearer(&token("s3cret", exp));
        assert_eq!(check_admin(None, &headers), Err(StatusCode::UNAUTHORIZED));
    }
}
