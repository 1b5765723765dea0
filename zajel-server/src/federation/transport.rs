//! Server-to-server transport: long-lived TCP links carrying
//! newline-delimited signed JSON envelopes.
//!
//! Each connection opens with a signed `hello` envelope from both sides;
//! a side that cannot produce a valid signature never gets a link. After
//! the handshake a link is keyed by the peer's server id and carries
//! envelopes both ways until either direction fails.
//!
//! Duplicate-link tie-breaking: when both servers dial each other, the
//! side with the lexicographically larger server id keeps its outbound
//! connection and the other side drops its own.
//!
//! `send` enqueues into the link's bounded write queue and returns once
//! queued. Overflow marks the link degraded rather than dropping it —
//! liveness verdicts belong to the gossip failure detector, not here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::FederationError;
use super::envelope::{Envelope, HelloPayload, Subtype};
use crate::identity::ServerIdentity;
use crate::registry::relay::jitter;

/// Handshake must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded per-link write queue.
const WRITE_QUEUE: usize = 256;

/// Reconnect backoff bounds.
const BACKOFF_MIN_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 60_000;

/// An envelope received from an authenticated link. `from` is the peer id
/// proven during the handshake, not whatever the payload claims.
#[derive(Debug)]
pub struct InboundEnvelope {
    pub from: String,
    pub envelope: Envelope,
}

struct Link {
    tx: mpsc::Sender<Envelope>,
    degraded: Arc<AtomicBool>,
    conn_gen: u64,
    outbound: bool,
    /// The peer's advertised endpoint, from its hello.
    endpoint: String,
}

pub struct FederationTransport {
    identity: Arc<ServerIdentity>,
    advertised_endpoint: String,
    links: parking_lot::Mutex<HashMap<String, Link>>,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    conn_gen: AtomicU64,
    seq: AtomicU64,
}

impl FederationTransport {
    /// Bind the federation listener and return the transport plus the
    /// stream of authenticated inbound envelopes.
    pub async fn start(
        identity: Arc<ServerIdentity>,
        listen_port: u16,
        advertised_endpoint: String,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundEnvelope>), FederationError> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|source| FederationError::Bind {
                port: listen_port,
                source,
            })?;
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);

        let transport = Arc::new(Self {
            identity,
            advertised_endpoint,
            links: parking_lot::Mutex::new(HashMap::new()),
            inbound_tx,
            conn_gen: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        });

        let accept_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "federation connection accepted");
                        let t = Arc::clone(&accept_transport);
                        tokio::spawn(async move {
                            if let Err(e) = t.run_link(stream, false).await {
                                tracing::debug!("inbound federation link ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("federation accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok((transport, inbound_rx))
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn hello(&self) -> Envelope {
        Envelope::signed(
            &self.identity,
            Subtype::Hello,
            self.next_seq(),
            chrono::Utc::now().timestamp(),
            serde_json::to_value(HelloPayload {
                endpoint: self.advertised_endpoint.clone(),
            })
            .unwrap_or_default(),
            Vec::new(),
        )
    }

    /// Enqueue an envelope for a connected peer. Returns false if no link
    /// exists. Queue overflow marks the link degraded and keeps it.
    pub fn send(&self, server_id: &str, envelope: Envelope) -> bool {
        let links = self.links.lock();
        let Some(link) = links.get(server_id) else {
            return false;
        };
        match link.tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !link.degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!(peer = %server_id, "federation write queue full, link degraded");
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.links.lock().contains_key(server_id)
    }

    pub fn is_degraded(&self, server_id: &str) -> bool {
        self.links
            .lock()
            .get(server_id)
            .is_some_and(|l| l.degraded.load(Ordering::Relaxed))
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.links.lock().keys().cloned().collect()
    }

    /// Dial an endpoint and keep retrying with exponential backoff and
    /// ±20% jitter until the process shuts down. Resets to the minimum
    /// backoff after every successful handshake.
    pub fn connect_with_retry(self: &Arc<Self>, endpoint: String) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff_ms = BACKOFF_MIN_MS;
            loop {
                // An incoming link to this endpoint may already exist
                // (the peer dialed us, or a previous attempt won).
                if transport
                    .links
                    .lock()
                    .values()
                    .any(|l| l.endpoint == endpoint)
                {
                    tokio::time::sleep(Duration::from_millis(jitter(backoff_ms, 0.2))).await;
                    backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
                    continue;
                }
                match TcpStream::connect(&endpoint).await {
                    Ok(stream) => match transport.run_link(stream, true).await {
                        Ok(()) => {
                            backoff_ms = BACKOFF_MIN_MS;
                            tracing::info!(%endpoint, "federation link dropped, will reconnect");
                        }
                        Err(e) => {
                            tracing::debug!(%endpoint, "federation link attempt failed: {e}");
                        }
                    },
                    Err(e) => {
                        tracing::debug!(%endpoint, backoff_ms, "federation dial failed: {e}");
                    }
                }
                tokio::time::sleep(Duration::from_millis(jitter(backoff_ms, 0.2))).await;
                backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
            }
        });
    }

    /// Handshake and run a link until either direction ends.
    async fn run_link(
        self: &Arc<Self>,
        stream: TcpStream,
        outbound: bool,
    ) -> Result<(), FederationError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Send our hello, then require theirs within the handshake window.
        let our_hello = serde_json::to_string(&self.hello())?;
        write_half.write_all(our_hello.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut line = String::new();
        let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| FederationError::HandshakeTimeout)??;
        if read == 0 {
            return Err(FederationError::HandshakeClosed);
        }
        let hello: Envelope =
            serde_json::from_str(line.trim()).map_err(|_| FederationError::MalformedHello)?;
        if hello.subtype != Subtype::Hello || !hello.verify() {
            // No oracle for why: unverifiable traffic is dropped silently.
            return Err(FederationError::SignatureInvalid);
        }
        let peer_id = hello.sender_id.clone();
        if peer_id == self.identity.server_id() {
            return Err(FederationError::SelfConnection);
        }
        let peer_endpoint = serde_json::from_value::<HelloPayload>(hello.payload.clone())
            .map(|p| p.endpoint)
            .unwrap_or_default();

        // Duplicate-link tie-break: larger server id keeps its outbound.
        let my_gen = self.conn_gen.fetch_add(1, Ordering::Relaxed);
        let (write_tx, mut write_rx) = mpsc::channel::<Envelope>(WRITE_QUEUE);
        let degraded = Arc::new(AtomicBool::new(false));
        {
            let mut links = self.links.lock();
            if let Some(existing) = links.get(&peer_id) {
                let we_are_larger = self.identity.server_id() > peer_id.as_str();
                let keep_existing = match (existing.outbound, outbound) {
                    // Our outbound vs their dial (or the reverse): the
                    // larger id's outbound wins.
                    (true, false) => we_are_larger,
                    (false, true) => !we_are_larger,
                    // Same direction twice: newest wins.
                    _ => false,
                };
                if keep_existing {
                    tracing::debug!(peer = %peer_id, "dropping duplicate link (tie-break)");
                    return Ok(());
                }
                tracing::debug!(peer = %peer_id, "replacing link (tie-break)");
            }
            links.insert(
                peer_id.clone(),
                Link {
                    tx: write_tx,
                    degraded: Arc::clone(&degraded),
                    conn_gen: my_gen,
                    outbound,
                    endpoint: peer_endpoint,
                },
            );
        }
        tracing::info!(peer = %peer_id, outbound, "federation link established");

        // Surface the hello to gossip so it can seed membership and join.
        let _ = self
            .inbound_tx
            .send(InboundEnvelope {
                from: peer_id.clone(),
                envelope: hello,
            })
            .await;

        // Writer: envelopes → JSON lines.
        let write_peer = peer_id.clone();
        let write_degraded = degraded;
        let write_handle = tokio::spawn(async move {
            while let Some(env) = write_rx.recv().await {
                let Ok(json) = serde_json::to_string(&env) else {
                    continue;
                };
                if write_half.write_all(json.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                    || write_half.flush().await.is_err()
                {
                    tracing::debug!(peer = %write_peer, "federation write failed");
                    break;
                }
                write_degraded.store(false, Ordering::Relaxed);
            }
        });

        // Reader: JSON lines → verified envelopes → inbound queue.
        let read_peer = peer_id.clone();
        let inbound_tx = self.inbound_tx.clone();
        let read_handle = tokio::spawn(async move {
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(env) = serde_json::from_str::<Envelope>(&line) else {
                    tracing::debug!(peer = %read_peer, "discarding malformed envelope");
                    continue;
                };
                // Dropped silently: no response reveals why.
                if !env.verify() || env.sender_id != read_peer {
                    continue;
                }
                if inbound_tx
                    .send(InboundEnvelope {
                        from: read_peer.clone(),
                        envelope: env,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut read_handle = read_handle;
        let mut write_handle = write_handle;
        tokio::select! {
            _ = &mut read_handle => write_handle.abort(),
            _ = &mut write_handle => read_handle.abort(),
        }

        // Only remove the entry if it is still ours — a replacement link
        // may have raced in with a newer generation.
        {
            let mut links = self.links.lock();
            if links.get(&peer_id).is_some_and(|l| l.conn_gen == my_gen) {
                links.remove(&peer_id);
                tracing::info!(peer = %peer_id, "federation link closed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn handshake_then_signed_traffic() {
        let a_identity = Arc::new(ServerIdentity::ephemeral());
        let b_identity = Arc::new(ServerIdentity::ephemeral());
        let b_id = b_identity.server_id().to_string();

        let a_port = free_port().await;
        let b_port = free_port().await;
        let (a, mut a_rx) = FederationTransport::start(
            Arc::clone(&a_identity),
            a_port,
            format!("127.0.0.1:{a_port}"),
        )
        .await
        .unwrap();
        let (_b, mut b_rx) = FederationTransport::start(
            Arc::clone(&b_identity),
            b_port,
            format!("127.0.0.1:{b_port}"),
        )
        .await
        .unwrap();

        a.connect_with_retry(format!("127.0.0.1:{b_port}"));

        // Both sides observe the peer's hello with the authenticated id.
        let a_hello = tokio::time::timeout(Duration::from_secs(5), a_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a_hello.envelope.subtype, Subtype::Hello);
        assert_eq!(a_hello.from, b_id);
        let b_hello = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b_hello.from, a_identity.server_id());

        // A properly signed ping flows A → B.
        let ping = Envelope::signed(
            &a_identity,
            Subtype::Ping,
            1,
            0,
            serde_json::json!({}),
            Vec::new(),
        );
        assert!(a.send(&b_id, ping));
        let received = tokio::time::timeout(Duration::from_secs(5), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.envelope.subtype, Subtype::Ping);
        assert_eq!(received.from, a_identity.server_id());

        // An envelope signed by some other key is dropped silently.
        let forged = Envelope::signed(
            &ServerIdentity::ephemeral(),
            Subtype::Ping,
            2,
            0,
            serde_json::json!({}),
            Vec::new(),
        );
        assert!(a.send(&b_id, forged));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(b_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn bind_conflict_is_a_typed_error() {
        let held = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = held.local_addr().unwrap().port();
        let result = FederationTransport::start(
            Arc::new(ServerIdentity::ephemeral()),
            port,
            format!("127.0.0.1:{port}"),
        )
        .await;
        assert!(matches!(result, Err(FederationError::Bind { .. })));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_false() {
        let port = free_port().await;
        let (t, _rx) = FederationTransport::start(
            Arc::new(ServerIdentity::ephemeral()),
            port,
            format!("127.0.0.1:{port}"),
        )
        .await
        .unwrap();
        let env = t.hello();
        assert!(!t.send("nobody", env));
    }
}
