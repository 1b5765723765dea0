//! SWIM gossip: failure detection and membership dissemination.
//!
//! Per round: probe one random alive peer with a signed ping; on timeout
//! escalate through `indirect_ping_count` proxies (`ping_req`); on
//! indirect timeout mark the target suspect, start the suspicion timer,
//! and broadcast `suspect`. Expiry without refutation promotes to
//! `failed` and broadcasts `confirm`. Every envelope piggybacks the five
//! most recent membership updates; a full state exchange with one random
//! peer runs every `state_exchange_interval`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use super::envelope::{
    Envelope, JoinPayload, LeavePayload, PingAckPayload, PingReqPayload, StateSyncPayload,
    Subtype, SuspectPayload,
};
use super::membership::{ApplyOutcome, MemberStatus, MemberUpdate, MembershipTable};
use super::router::DhtRouter;
use super::transport::{FederationTransport, InboundEnvelope};
use crate::db::{Db, MemberRow};
use crate::identity::ServerIdentity;

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub indirect_ping_count: usize,
    pub suspicion_timeout: Duration,
    pub failure_timeout: Duration,
    pub state_exchange_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_millis(500),
            indirect_ping_count: 3,
            suspicion_timeout: Duration::from_secs(5),
            failure_timeout: Duration::from_secs(30),
            state_exchange_interval: Duration::from_secs(30),
        }
    }
}

/// How many peers receive a suspect/confirm/refutation broadcast.
const BROADCAST_FANOUT: usize = 3;

enum AckWaiter {
    /// A local probe waiting for its ack.
    Local(oneshot::Sender<()>),
    /// We are proxying a ping_req: relay the ack back to the requester.
    Proxy { requester: String, origin_seq: u64 },
}

pub struct Gossip {
    config: GossipConfig,
    identity: Arc<ServerIdentity>,
    pub membership: Arc<MembershipTable>,
    transport: Arc<FederationTransport>,
    router: Arc<DhtRouter>,
    seq: AtomicU64,
    waiters: Mutex<HashMap<u64, AckWaiter>>,
    /// Endpoints we already spawned a reconnect task for.
    dialed: Mutex<HashSet<String>>,
    db: Option<Mutex<Db>>,
}

impl Gossip {
    /// Start the gossip engine: the inbound processor, the probe loop,
    /// and the state-exchange loop.
    pub fn spawn(
        config: GossipConfig,
        identity: Arc<ServerIdentity>,
        membership: Arc<MembershipTable>,
        transport: Arc<FederationTransport>,
        router: Arc<DhtRouter>,
        mut inbound: mpsc::Receiver<InboundEnvelope>,
        db: Option<Db>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let gossip = Arc::new(Self {
            config,
            identity,
            membership,
            transport,
            router,
            seq: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
            dialed: Mutex::new(HashSet::new()),
            db: db.map(Mutex::new),
        });

        // Reload persisted members as unknown until gossip confirms them,
        // and start dialing the ones that were alive.
        gossip.restore_members();

        let inbound_gossip = Arc::clone(&gossip);
        let mut inbound_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inbound_shutdown.changed() => break,
                    msg = inbound.recv() => match msg {
                        Some(msg) => inbound_gossip.handle(msg).await,
                        None => break,
                    },
                }
            }
        });

        let probe_gossip = Arc::clone(&gossip);
        let mut probe_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_gossip.config.ping_interval);
            loop {
                tokio::select! {
                    _ = probe_shutdown.changed() => break,
                    _ = ticker.tick() => probe_gossip.probe_round().await,
                }
            }
        });

        let sync_gossip = Arc::clone(&gossip);
        let mut sync_shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_gossip.config.state_exchange_interval);
            loop {
                tokio::select! {
                    _ = sync_shutdown.changed() => break,
                    _ = ticker.tick() => sync_gossip.state_exchange_round().await,
                }
            }
        });

        gossip
    }

    /// Dial a bootstrap endpoint; the join flows from the hello exchange.
    pub fn bootstrap(&self, endpoint: &str) {
        self.dial(endpoint);
    }

    fn dial(&self, endpoint: &str) {
        if endpoint.is_empty() || endpoint == self.membership.self_endpoint() {
            return;
        }
        let mut dialed = self.dialed.lock();
        if dialed.insert(endpoint.to_string()) {
            self.transport.connect_with_retry(endpoint.to_string());
        }
    }

    fn restore_members(&self) {
        let Some(ref db) = self.db else { return };
        let rows = match db.lock().load_members() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("could not restore membership table: {e}");
                return;
            }
        };
        let now = chrono::Utc::now().timestamp();
        for row in rows {
            if row.server_id == self.membership.self_id() {
                continue;
            }
            let endpoint = row.endpoint.clone();
            // Demote to unknown: only fresh gossip proves liveness.
            self.membership.apply(
                &MemberUpdate {
                    server_id: row.server_id,
                    status: MemberStatus::Unknown,
                    incarnation: row.incarnation as u64,
                    endpoint: endpoint.clone(),
                    public_key: row.public_key,
                    node_id: row.node_id,
                },
                now,
            );
            self.dial(&endpoint);
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn envelope(&self, subtype: Subtype, payload: serde_json::Value) -> Envelope {
        Envelope::signed(
            &self.identity,
            subtype,
            self.next_seq(),
            chrono::Utc::now().timestamp(),
            payload,
            self.membership.recent_updates(),
        )
    }

    fn persist(&self, update: &MemberUpdate) {
        let Some(ref db) = self.db else { return };
        let row = MemberRow {
            server_id: update.server_id.clone(),
            node_id: update.node_id.clone(),
            endpoint: update.endpoint.clone(),
            public_key: update.public_key.clone(),
            status: update.status.as_str().to_string(),
            incarnation: update.incarnation as i64,
            last_seen: chrono::Utc::now().timestamp(),
            metadata: HashMap::new(),
        };
        if let Err(e) = db.lock().save_member(&row) {
            tracing::warn!(member = %update.server_id, "persisting member failed: {e}");
        }
    }

    /// Apply one membership update and propagate its consequences.
    fn process_update(&self, update: &MemberUpdate) {
        let now = chrono::Utc::now().timestamp();
        match self.membership.apply(update, now) {
            ApplyOutcome::Applied(member) => {
                self.router
                    .member_changed(&member.server_id, &member.endpoint, member.status);
                self.persist(&MemberUpdate::of(&member));
                if member.status == MemberStatus::Alive {
                    self.dial(&member.endpoint);
                }
            }
            ApplyOutcome::SelfRefutation(refutation) => {
                tracing::info!(
                    incarnation = refutation.incarnation,
                    "refuting suspicion about ourselves"
                );
                self.broadcast_update_now(&refutation);
            }
            ApplyOutcome::Ignored => {}
        }
    }

    /// Push an update to a few random peers immediately (refutations and
    /// detector verdicts must not wait for piggyback opportunities).
    fn broadcast_update_now(&self, update: &MemberUpdate) {
        let payload = SuspectPayload {
            target: update.server_id.clone(),
            incarnation: update.incarnation,
        };
        let subtype = match update.status {
            MemberStatus::Suspect => Subtype::Suspect,
            MemberStatus::Failed => Subtype::Confirm,
            // Alive refutations ride as piggyback on a ping.
            _ => {
                for peer in self
                    .membership
                    .random_alive(BROADCAST_FANOUT, &[update.server_id.as_str()])
                {
                    let env = self.envelope(Subtype::Ping, serde_json::json!({}));
                    self.transport.send(&peer.server_id, env);
                }
                return;
            }
        };
        let Ok(payload) = serde_json::to_value(&payload) else {
            return;
        };
        for peer in self
            .membership
            .random_alive(BROADCAST_FANOUT, &[update.server_id.as_str()])
        {
            let env = self.envelope(subtype, payload.clone());
            self.transport.send(&peer.server_id, env);
        }
    }

    /// Send a ping and wait for its ack.
    async fn ping_and_wait(&self, target: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq();
        self.waiters.lock().insert(seq, AckWaiter::Local(tx));
        let env = Envelope::signed(
            &self.identity,
            Subtype::Ping,
            seq,
            chrono::Utc::now().timestamp(),
            serde_json::json!({}),
            self.membership.recent_updates(),
        );
        if !self.transport.send(target, env) {
            self.waiters.lock().remove(&seq);
            return false;
        }
        match tokio::time::timeout(self.config.ping_timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                self.waiters.lock().remove(&seq);
                false
            }
        }
    }

    /// Ask proxies to probe the target and wait for any relayed ack.
    async fn indirect_ping_and_wait(&self, target: &str) -> bool {
        let proxies = self
            .membership
            .random_alive(self.config.indirect_ping_count, &[target]);
        if proxies.is_empty() {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        let origin_seq = self.next_seq();
        self.waiters
            .lock()
            .insert(origin_seq, AckWaiter::Local(tx));
        let Ok(payload) = serde_json::to_value(PingReqPayload {
            target: target.to_string(),
            origin_seq,
        }) else {
            return false;
        };
        for proxy in &proxies {
            let env = self.envelope(Subtype::PingReq, payload.clone());
            self.transport.send(&proxy.server_id, env);
        }
        match tokio::time::timeout(self.config.ping_timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                self.waiters.lock().remove(&origin_seq);
                false
            }
        }
    }

    /// One SWIM probe round.
    pub async fn probe_round(self: &Arc<Self>) {
        let Some(target) = self.membership.random_alive(1, &[]).pop() else {
            return;
        };
        let target_id = target.server_id.clone();

        if self.ping_and_wait(&target_id).await {
            self.membership
                .touch(&target_id, chrono::Utc::now().timestamp());
            return;
        }
        if self.indirect_ping_and_wait(&target_id).await {
            self.membership
                .touch(&target_id, chrono::Utc::now().timestamp());
            return;
        }

        let now = chrono::Utc::now().timestamp();
        let Some(suspect) = self.membership.mark_suspect(&target_id, now) else {
            return;
        };
        tracing::info!(member = %target_id, incarnation = suspect.incarnation, "member suspected");
        self.router
            .member_changed(&target_id, &suspect.endpoint, MemberStatus::Suspect);
        self.persist(&suspect);
        self.broadcast_update_now(&suspect);

        // Suspicion timer: promote to failed unless a refutation bumps
        // the incarnation first.
        let gossip = Arc::clone(self);
        let suspected_incarnation = suspect.incarnation;
        tokio::spawn(async move {
            tokio::time::sleep(gossip.config.suspicion_timeout).await;
            let now = chrono::Utc::now().timestamp();
            let Some(failed) =
                gossip
                    .membership
                    .confirm_failed(&target_id, suspected_incarnation, now)
            else {
                return;
            };
            tracing::warn!(member = %target_id, "member failed (suspicion expired)");
            gossip
                .router
                .member_changed(&target_id, &failed.endpoint, MemberStatus::Failed);
            gossip.persist(&failed);
            gossip.broadcast_update_now(&failed);
        });
    }

    /// Periodic full-state exchange with one random peer, plus pruning of
    /// long-dead members.
    async fn state_exchange_round(&self) {
        let now = chrono::Utc::now().timestamp();
        for pruned in self
            .membership
            .prune(now, self.config.failure_timeout.as_secs() as i64)
        {
            self.router.member_pruned(&pruned);
            if let Some(ref db) = self.db {
                let _ = db.lock().delete_member(&pruned);
            }
        }

        let Some(peer) = self.membership.random_alive(1, &[]).pop() else {
            return;
        };
        let mut members = self.membership.snapshot();
        members.push(self.membership.self_member(now));
        let Ok(payload) = serde_json::to_value(StateSyncPayload { members }) else {
            return;
        };
        let env = self.envelope(Subtype::StateSync, payload);
        self.transport.send(&peer.server_id, env);
    }

    /// Process one authenticated inbound envelope.
    pub async fn handle(&self, inbound: InboundEnvelope) {
        let InboundEnvelope { from, envelope } = inbound;
        let now = chrono::Utc::now().timestamp();

        for update in &envelope.piggyback {
            self.process_update(update);
        }

        match envelope.subtype {
            Subtype::Hello => {
                // A new link: seed the member and offer our join.
                let endpoint = serde_json::from_value::<super::envelope::HelloPayload>(
                    envelope.payload.clone(),
                )
                .map(|p| p.endpoint)
                .unwrap_or_default();
                self.process_update(&MemberUpdate {
                    server_id: from.clone(),
                    status: MemberStatus::Alive,
                    incarnation: 0,
                    endpoint,
                    public_key: from.clone(),
                    node_id: String::new(),
                });
                let Ok(payload) = serde_json::to_value(JoinPayload {
                    member: self.membership.self_member(now),
                }) else {
                    return;
                };
                let env = self.envelope(Subtype::Join, payload);
                self.transport.send(&from, env);
            }
            Subtype::Ping => {
                self.membership.touch(&from, now);
                let Ok(payload) = serde_json::to_value(PingAckPayload {
                    ack_seq: envelope.sequence_number,
                }) else {
                    return;
                };
                let env = self.envelope(Subtype::PingAck, payload);
                self.transport.send(&from, env);
            }
            Subtype::PingAck => {
                let Ok(ack) =
                    serde_json::from_value::<PingAckPayload>(envelope.payload.clone())
                else {
                    return;
                };
                let waiter = self.waiters.lock().remove(&ack.ack_seq);
                match waiter {
                    Some(AckWaiter::Local(tx)) => {
                        let _ = tx.send(());
                    }
                    Some(AckWaiter::Proxy {
                        requester,
                        origin_seq,
                    }) => {
                        // Relay the good news to whoever asked us to probe.
                        if let Ok(payload) =
                            serde_json::to_value(PingAckPayload { ack_seq: origin_seq })
                        {
                            let env = self.envelope(Subtype::PingAck, payload);
                            self.transport.send(&requester, env);
                        }
                    }
                    None => {}
                }
            }
            Subtype::PingReq => {
                let Ok(req) =
                    serde_json::from_value::<PingReqPayload>(envelope.payload.clone())
                else {
                    return;
                };
                let seq = self.next_seq();
                self.waiters.lock().insert(
                    seq,
                    AckWaiter::Proxy {
                        requester: from.clone(),
                        origin_seq: req.origin_seq,
                    },
                );
                let env = Envelope::signed(
                    &self.identity,
                    Subtype::Ping,
                    seq,
                    now,
                    serde_json::json!({}),
                    self.membership.recent_updates(),
                );
                self.transport.send(&req.target, env);
            }
            Subtype::Suspect | Subtype::Confirm => {
                let Ok(claim) =
                    serde_json::from_value::<SuspectPayload>(envelope.payload.clone())
                else {
                    return;
                };
                let status = if envelope.subtype == Subtype::Suspect {
                    MemberStatus::Suspect
                } else {
                    MemberStatus::Failed
                };
                self.process_update(&MemberUpdate {
                    server_id: claim.target.clone(),
                    status,
                    incarnation: claim.incarnation,
                    endpoint: String::new(),
                    public_key: claim.target,
                    node_id: String::new(),
                });
            }
            Subtype::Join => {
                let Ok(join) = serde_json::from_value::<JoinPayload>(envelope.payload.clone())
                else {
                    return;
                };
                self.process_update(&MemberUpdate::of(&join.member));
                // Seed the joiner with our full view.
                let mut members = self.membership.snapshot();
                members.push(self.membership.self_member(now));
                if let Ok(payload) = serde_json::to_value(StateSyncPayload { members }) {
                    let env = self.envelope(Subtype::StateSync, payload);
                    self.transport.send(&from, env);
                }
            }
            Subtype::Leave => {
                let Ok(leave) =
                    serde_json::from_value::<LeavePayload>(envelope.payload.clone())
                else {
                    return;
                };
                self.process_update(&MemberUpdate {
                    server_id: leave.server_id.clone(),
                    status: MemberStatus::Left,
                    incarnation: leave.incarnation,
                    endpoint: String::new(),
                    public_key: leave.server_id,
                    node_id: String::new(),
                });
            }
            Subtype::StateSync => {
                let Ok(sync) =
                    serde_json::from_value::<StateSyncPayload>(envelope.payload.clone())
                else {
                    return;
                };
                for member in &sync.members {
                    if member.server_id == self.membership.self_id() {
                        continue;
                    }
                    self.process_update(&MemberUpdate::of(member));
                }
            }
        }
    }

    /// Announce a clean departure to everyone we know.
    pub fn announce_leave(&self) {
        let Ok(payload) = serde_json::to_value(LeavePayload {
            server_id: self.membership.self_id().to_string(),
            incarnation: self.membership.self_incarnation(),
        }) else {
            return;
        };
        for peer in self.membership.snapshot() {
            if peer.status == MemberStatus::Alive {
                let env = self.envelope(Subtype::Leave, payload.clone());
                self.transport.send(&peer.server_id, env);
            }
        }
    }
}
