//! Shared server state and runtime assembly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::config::ServerConfig;
use crate::db::Db;
use crate::federation::{DhtRouter, FederationTransport, Gossip, GossipConfig, MembershipTable};
use crate::identity::ServerIdentity;
use crate::registry::{ChannelRegistry, ChunkIndex, RelayRegistry, RendezvousRegistry};

/// Pairing codes expire after ten minutes.
pub const PAIRING_CODE_TTL: Duration = Duration::from_secs(10 * 60);

/// Peer ids and pairing codes: 6 chars, case-sensitive base32 without
/// the ambiguous I/O/0/1.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

/// Generate a fresh peer id or pairing code.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// A connected, registered peer.
pub struct PeerEntry {
    /// Serialized frames destined for this peer's socket.
    pub tx: mpsc::Sender<String>,
    pub public_key: Option<String>,
    pub pairing_code: Option<String>,
}

/// A registered pairing code.
#[derive(Debug, Clone)]
pub struct PairingCode {
    pub peer_id: String,
    pub public_key: String,
    pub expires_at: Instant,
}

/// A parked device-link request awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingLink {
    pub requester: String,
    pub public_key: String,
}

#[derive(Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    pub frames_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub matches_total: AtomicU64,
    pub upstream_queued_total: AtomicU64,
    pub redirects_total: AtomicU64,
}

impl Metrics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared state accessible by all connection handlers. Every map has its
/// own mutex and no lock is held across an await.
pub struct SharedState {
    pub config: ServerConfig,
    pub identity: Arc<ServerIdentity>,
    pub started_at: Instant,
    /// peer id → connected peer.
    pub peers: Mutex<HashMap<String, PeerEntry>>,
    /// pairing code → registration.
    pub pairing_codes: Mutex<HashMap<String, PairingCode>>,
    /// pairing code → peers with an outstanding pair_request on it.
    pub pending_pairs: Mutex<HashMap<String, Vec<String>>>,
    /// link code → parked link_request.
    pub pending_links: Mutex<HashMap<String, PendingLink>>,
    /// Established pairings, for online/offline notifications.
    pub paired: Mutex<HashMap<String, HashSet<String>>>,
    pub channels: ChannelRegistry,
    pub relays: RelayRegistry,
    pub chunks: ChunkIndex,
    pub rendezvous: RendezvousRegistry,
    pub router: Arc<DhtRouter>,
    pub gossip: Mutex<Option<Arc<Gossip>>>,
    pub transport: Mutex<Option<Arc<FederationTransport>>>,
    pub metrics: Metrics,
    pub shutting_down: AtomicBool,
}

impl SharedState {
    /// Queue a frame for a connected peer. Returns false if the peer is
    /// offline or its buffer is full.
    pub fn send_to_peer(&self, peer_id: &str, frame: &serde_json::Value) -> bool {
        let peers = self.peers.lock();
        let Some(entry) = peers.get(peer_id) else {
            return false;
        };
        entry.tx.try_send(frame.to_string()).is_ok()
    }

    pub fn peer_online(&self, peer_id: &str) -> bool {
        self.peers.lock().contains_key(peer_id)
    }

    pub fn peer_public_key(&self, peer_id: &str) -> Option<String> {
        self.peers.lock().get(peer_id)?.public_key.clone()
    }

    /// Record an established pairing in both directions.
    pub fn record_pairing(&self, a: &str, b: &str) {
        let mut paired = self.paired.lock();
        paired.entry(a.to_string()).or_default().insert(b.to_string());
        paired.entry(b.to_string()).or_default().insert(a.to_string());
    }
}

/// The assembled server.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        Ok(Self { config })
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let identity = Arc::new(match config.identity_file {
            Some(ref path) => ServerIdentity::load_or_create_file(path)?,
            None => ServerIdentity::load_or_create()?,
        });
        tracing::info!(server_id = %identity.server_id(), "server identity loaded");

        let open_db = || -> Result<Db> {
            Ok(match config.db_path {
                Some(ref path) => Db::open(path).context("opening database")?,
                None => Db::open_memory().context("opening in-memory database")?,
            })
        };
        let rendezvous = RendezvousRegistry::new(open_db()?)?;

        let advertised = config.advertised_endpoint();
        let router = Arc::new(DhtRouter::new(identity.server_id(), &advertised));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Federation: transport, membership, gossip.
        let (transport, inbound_rx) = FederationTransport::start(
            Arc::clone(&identity),
            config.federation_port,
            advertised.clone(),
        )
        .await?;
        let mut metadata = HashMap::new();
        metadata.insert("region".to_string(), config.region.clone());
        let node_id = format!(
            "{}-{}",
            config.region,
            &identity.server_id()[..8.min(identity.server_id().len())]
        );
        let membership = Arc::new(MembershipTable::new(
            identity.server_id().to_string(),
            node_id,
            advertised.clone(),
            metadata,
        ));
        let gossip = Gossip::spawn(
            GossipConfig::default(),
            Arc::clone(&identity),
            Arc::clone(&membership),
            Arc::clone(&transport),
            Arc::clone(&router),
            inbound_rx,
            Some(open_db()?),
            shutdown_rx.clone(),
        );
        for endpoint in config.bootstrap_endpoints() {
            gossip.bootstrap(endpoint);
        }

        let state = Arc::new(SharedState {
            config,
            identity,
            started_at: Instant::now(),
            peers: Mutex::new(HashMap::new()),
            pairing_codes: Mutex::new(HashMap::new()),
            pending_pairs: Mutex::new(HashMap::new()),
            pending_links: Mutex::new(HashMap::new()),
            paired: Mutex::new(HashMap::new()),
            channels: ChannelRegistry::new(),
            relays: RelayRegistry::new(),
            chunks: ChunkIndex::new(),
            rendezvous,
            router,
            gossip: Mutex::new(Some(Arc::clone(&gossip))),
            transport: Mutex::new(Some(transport)),
            metrics: Metrics::default(),
            shutting_down: AtomicBool::new(false),
        });

        // Periodic sweep: expired pairing codes, upstream queue TTL,
        // rendezvous expiry.
        let sweep_state = Arc::clone(&state);
        let mut sweep_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = sweep_shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        sweep_state
                            .pairing_codes
                            .lock()
                            .retain(|_, code| code.expires_at > now);
                        let evicted = sweep_state.channels.sweep(now);
                        if evicted > 0 {
                            tracing::debug!(evicted, "upstream queue sweep");
                        }
                        let unix_now = chrono::Utc::now().timestamp();
                        if let Err(e) = sweep_state.rendezvous.cleanup(unix_now) {
                            tracing::warn!("rendezvous cleanup failed: {e}");
                        }
                    }
                }
            }
        });

        // HTTP + WebSocket front.
        let app = crate::web::router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", state.config.port))
            .await
            .with_context(|| format!("binding client listener on port {}", state.config.port))?;
        tracing::info!("listening on {}", listener.local_addr()?);

        // Cooperative shutdown: block new registrations, announce our
        // departure, then let in-flight handlers finish.
        let shutdown_state = Arc::clone(&state);
        let mut serve_shutdown = shutdown_rx;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown_state.shutting_down.store(true, Ordering::Relaxed);
                shutdown_state.rendezvous.shutdown();
                gossip.announce_leave();
                let _ = shutdown_tx.send(true);
            }
        });

        match (
            state.config.tls_cert.as_deref(),
            state.config.tls_key.as_deref(),
        ) {
            (Some(cert), Some(key)) => {
                let tls_listener = crate::tls::TlsListener::new(listener, cert, key)?;
                tracing::info!("serving clients over TLS");
                axum::serve(tls_listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = serve_shutdown.changed().await;
                    })
                    .await?;
            }
            _ => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = serve_shutdown.changed().await;
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
