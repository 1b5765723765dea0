//! Shared harness: an assembled `SharedState` and a fake client that
//! drives the frame pipeline directly, no sockets involved.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use clap::Parser;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use zajel_server::config::ServerConfig;
use zajel_server::connection::{ClientConn, Outbound, process_frame};
use zajel_server::db::Db;
use zajel_server::federation::DhtRouter;
use zajel_server::identity::ServerIdentity;
use zajel_server::registry::{ChannelRegistry, ChunkIndex, RelayRegistry, RendezvousRegistry};
use zajel_server::server::{Metrics, SharedState};

pub fn test_state() -> Arc<SharedState> {
    let config = ServerConfig::parse_from(["zajel-server"]);
    state_with(config, None)
}

pub fn state_with(config: ServerConfig, router: Option<Arc<DhtRouter>>) -> Arc<SharedState> {
    let identity = Arc::new(ServerIdentity::ephemeral());
    let router = router.unwrap_or_else(|| {
        Arc::new(DhtRouter::new(identity.server_id(), "127.0.0.1:7100"))
    });
    Arc::new(SharedState {
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
        rendezvous: RendezvousRegistry::new(Db::open_memory().unwrap()).unwrap(),
        router,
        gossip: Mutex::new(None),
        transport: Mutex::new(None),
        metrics: Metrics::default(),
        shutting_down: AtomicBool::new(false),
    })
}

/// A fake client: a connection plus both ends of its outbound queue.
pub struct TestClient {
    pub conn: ClientConn,
    pub out: Outbound,
    pub rx: mpsc::Receiver<String>,
}

impl TestClient {
    pub fn connect(name: &str) -> Self {
        let (out, rx) = mpsc::channel(256);
        Self {
            conn: ClientConn::new(format!("test-{name}")),
            out,
            rx,
        }
    }

    pub async fn send(&mut self, state: &Arc<SharedState>, frame: serde_json::Value) {
        process_frame(&mut self.conn, state, &self.out, &frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, state: &Arc<SharedState>, raw: &str) {
        process_frame(&mut self.conn, state, &self.out, raw).await;
    }

    /// Next queued frame, parsed. Panics when nothing is queued.
    pub fn recv(&mut self) -> serde_json::Value {
        let text = self.rx.try_recv().expect("expected a frame");
        serde_json::from_str(&text).expect("frames are JSON")
    }

    pub fn try_recv(&mut self) -> Option<serde_json::Value> {
        self.rx
            .try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).expect("frames are JSON"))
    }

    /// Register with a pairing code; returns (peerId, grantedCode).
    pub async fn register(
        &mut self,
        state: &Arc<SharedState>,
        code: &str,
        public_key: &str,
    ) -> (String, String) {
        self.send(
            state,
            serde_json::json!({
                "type": "register",
                "pairingCode": code,
                "publicKey": public_key,
            }),
        )
        .await;
        let reply = self.recv();
        assert_eq!(reply["type"], "registered", "got {reply}");
        (
            reply["peerId"].as_str().unwrap().to_string(),
            reply["pairingCode"].as_str().unwrap().to_string(),
        )
    }
}
