//! Federation membership table and incarnation conflict resolution.
//!
//! Incarnation numbers are monotonic per member and only ever incremented
//! by their owner, to refute stale suspicion about itself. Merging two
//! views of a member:
//!
//! - higher incarnation always wins;
//! - at equal incarnation, status priority `alive > suspect > failed >
//!   left` decides;
//! - a `suspect`/`failed` claim about *ourselves* bumps our incarnation
//!   and is re-gossiped as `alive`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Suspect,
    Failed,
    Left,
    Unknown,
}

impl MemberStatus {
    /// Tie-break priority at equal incarnation.
    fn priority(self) -> u8 {
        match self {
            MemberStatus::Alive => 4,
            MemberStatus::Suspect => 3,
            MemberStatus::Failed => 2,
            MemberStatus::Left => 1,
            MemberStatus::Unknown => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Suspect => "suspect",
            MemberStatus::Failed => "failed",
            MemberStatus::Left => "left",
            MemberStatus::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for MemberStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "alive" => Ok(MemberStatus::Alive),
            "suspect" => Ok(MemberStatus::Suspect),
            "failed" => Ok(MemberStatus::Failed),
            "left" => Ok(MemberStatus::Left),
            "unknown" => Ok(MemberStatus::Unknown),
            _ => Err(()),
        }
    }
}

/// A federation member as known to this server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "serverId")]
    pub server_id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub endpoint: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub status: MemberStatus,
    pub incarnation: u64,
    #[serde(rename = "lastSeen")]
    pub last_seen: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A piggybacked membership update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberUpdate {
    #[serde(rename = "serverId")]
    pub server_id: String,
    pub status: MemberStatus,
    pub incarnation: u64,
    pub endpoint: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "nodeId", default)]
    pub node_id: String,
}

impl MemberUpdate {
    pub fn of(member: &Member) -> Self {
        Self {
            server_id: member.server_id.clone(),
            status: member.status,
            incarnation: member.incarnation,
            endpoint: member.endpoint.clone(),
            public_key: member.public_key.clone(),
            node_id: member.node_id.clone(),
        }
    }
}

/// What applying an update did.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// The table changed; the new state of the member is attached.
    Applied(Member),
    /// Stale or redundant; nothing changed.
    Ignored,
    /// The update slandered us; we bumped our incarnation and the caller
    /// must gossip the attached alive refutation.
    SelfRefutation(MemberUpdate),
}

/// How many recent updates are retained for piggybacking.
const RECENT_CAP: usize = 32;

/// Updates piggybacked on each outgoing envelope.
pub const PIGGYBACK_COUNT: usize = 5;

pub struct MembershipTable {
    self_id: String,
    self_node_id: String,
    self_endpoint: String,
    self_metadata: HashMap<String, String>,
    self_incarnation: AtomicU64,
    members: Mutex<HashMap<String, Member>>,
    recent: Mutex<VecDeque<MemberUpdate>>,
}

impl MembershipTable {
    pub fn new(
        self_id: String,
        self_node_id: String,
        self_endpoint: String,
        self_metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            self_id,
            self_node_id,
            self_endpoint,
            self_metadata,
            self_incarnation: AtomicU64::new(1),
            members: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn self_incarnation(&self) -> u64 {
        self.self_incarnation.load(Ordering::Relaxed)
    }

    pub fn self_endpoint(&self) -> &str {
        &self.self_endpoint
    }

    /// Our own membership entry, as gossiped to peers.
    pub fn self_member(&self, now: i64) -> Member {
        Member {
            server_id: self.self_id.clone(),
            node_id: self.self_node_id.clone(),
            endpoint: self.self_endpoint.clone(),
            public_key: self.self_id.clone(),
            status: MemberStatus::Alive,
            incarnation: self.self_incarnation(),
            last_seen: now,
            metadata: self.self_metadata.clone(),
        }
    }

    /// Merge one update into the table.
    pub fn apply(&self, update: &MemberUpdate, now: i64) -> ApplyOutcome {
        if update.server_id == self.self_id {
            // Someone suspects or has failed us: refute with a higher
            // incarnation. Only we may increment it.
            if matches!(update.status, MemberStatus::Suspect | MemberStatus::Failed)
                && update.incarnation >= self.self_incarnation()
            {
                let bumped = update.incarnation + 1;
                self.self_incarnation.store(bumped, Ordering::Relaxed);
                let refutation = MemberUpdate::of(&self.self_member(now));
                self.record(&refutation);
                return ApplyOutcome::SelfRefutation(refutation);
            }
            return ApplyOutcome::Ignored;
        }

        let mut members = self.members.lock();
        let outcome = match members.get_mut(&update.server_id) {
            None => {
                let member = Member {
                    server_id: update.server_id.clone(),
                    node_id: if update.node_id.is_empty() {
                        update.server_id.clone()
                    } else {
                        update.node_id.clone()
                    },
                    endpoint: update.endpoint.clone(),
                    public_key: update.public_key.clone(),
                    status: update.status,
                    incarnation: update.incarnation,
                    last_seen: now,
                    metadata: HashMap::new(),
                };
                members.insert(update.server_id.clone(), member.clone());
                ApplyOutcome::Applied(member)
            }
            Some(existing) => {
                let wins = update.incarnation > existing.incarnation
                    || (update.incarnation == existing.incarnation
                        && update.status.priority() > existing.status.priority());
                if !wins {
                    return ApplyOutcome::Ignored;
                }
                existing.status = update.status;
                existing.incarnation = update.incarnation;
                existing.last_seen = now;
                if !update.endpoint.is_empty() {
                    existing.endpoint = update.endpoint.clone();
                }
                ApplyOutcome::Applied(existing.clone())
            }
        };
        drop(members);
        if let ApplyOutcome::Applied(ref member) = outcome {
            self.record(&MemberUpdate::of(member));
        }
        outcome
    }

    /// Merge a full snapshot (state exchange / join response).
    pub fn merge_snapshot(&self, snapshot: &[Member], now: i64) -> Vec<Member> {
        let mut changed = Vec::new();
        for member in snapshot {
            if let ApplyOutcome::Applied(m) = self.apply(&MemberUpdate::of(member), now) {
                changed.push(m);
            }
        }
        changed
    }

    /// Local failure-detector transition: mark a member suspect. Returns
    /// the update to gossip, or None if the member is not currently alive.
    pub fn mark_suspect(&self, server_id: &str, now: i64) -> Option<MemberUpdate> {
        let mut members = self.members.lock();
        let member = members.get_mut(server_id)?;
        if member.status != MemberStatus::Alive {
            return None;
        }
        member.status = MemberStatus::Suspect;
        member.last_seen = now;
        let update = MemberUpdate::of(member);
        drop(members);
        self.record(&update);
        Some(update)
    }

    /// Promote a suspect to failed if its incarnation has not moved since
    /// the suspicion started (a refutation would have bumped it).
    pub fn confirm_failed(
        &self,
        server_id: &str,
        suspected_incarnation: u64,
        now: i64,
    ) -> Option<MemberUpdate> {
        let mut members = self.members.lock();
        let member = members.get_mut(server_id)?;
        if member.status != MemberStatus::Suspect || member.incarnation != suspected_incarnation {
            return None;
        }
        member.status = MemberStatus::Failed;
        member.last_seen = now;
        let update = MemberUpdate::of(member);
        drop(members);
        self.record(&update);
        Some(update)
    }

    /// Record a successful contact (ack received).
    pub fn touch(&self, server_id: &str, now: i64) {
        if let Some(member) = self.members.lock().get_mut(server_id) {
            member.last_seen = now;
        }
    }

    /// Drop failed/left members whose last activity is older than the
    /// failure timeout. Returns the pruned ids.
    pub fn prune(&self, now: i64, failure_timeout_secs: i64) -> Vec<String> {
        let mut members = self.members.lock();
        let stale: Vec<String> = members
            .iter()
            .filter(|(_, m)| {
                matches!(m.status, MemberStatus::Failed | MemberStatus::Left)
                    && now - m.last_seen >= failure_timeout_secs
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            members.remove(id);
        }
        stale
    }

    pub fn get(&self, server_id: &str) -> Option<Member> {
        self.members.lock().get(server_id).cloned()
    }

    /// All known members (not including ourselves).
    pub fn snapshot(&self) -> Vec<Member> {
        self.members.lock().values().cloned().collect()
    }

    /// Random alive members, excluding the listed ids.
    pub fn random_alive(&self, count: usize, exclude: &[&str]) -> Vec<Member> {
        let members = self.members.lock();
        let mut alive: Vec<Member> = members
            .values()
            .filter(|m| m.status == MemberStatus::Alive && !exclude.contains(&m.server_id.as_str()))
            .cloned()
            .collect();
        drop(members);
        alive.shuffle(&mut rand::thread_rng());
        alive.truncate(count);
        alive
    }

    pub fn alive_count(&self) -> usize {
        self.members
            .lock()
            .values()
            .filter(|m| m.status == MemberStatus::Alive)
            .count()
    }

    fn record(&self, update: &MemberUpdate) {
        let mut recent = self.recent.lock();
        recent.push_back(update.clone());
        while recent.len() > RECENT_CAP {
            recent.pop_front();
        }
    }

    /// The most recent updates for piggybacking.
    pub fn recent_updates(&self) -> Vec<MemberUpdate> {
        let recent = self.recent.lock();
        recent
            .iter()
            .rev()
            .take(PIGGYBACK_COUNT)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MembershipTable {
        MembershipTable::new(
            "self".into(),
            "self-node".into(),
            "127.0.0.1:7100".into(),
            HashMap::new(),
        )
    }

    fn update(id: &str, status: MemberStatus, incarnation: u64) -> MemberUpdate {
        MemberUpdate {
            server_id: id.into(),
            status,
            incarnation,
            endpoint: format!("{id}:7100"),
            public_key: id.into(),
            node_id: id.into(),
        }
    }

    #[test]
    fn higher_incarnation_always_wins() {
        let t = table();
        t.apply(&update("a", MemberStatus::Failed, 3), 0);
        // Alive report with higher incarnation revives a failed member.
        assert!(matches!(
            t.apply(&update("a", MemberStatus::Alive, 4), 1),
            ApplyOutcome::Applied(_)
        ));
        assert_eq!(t.get("a").unwrap().status, MemberStatus::Alive);

        // Stale lower-incarnation suspect is ignored.
        assert!(matches!(
            t.apply(&update("a", MemberStatus::Suspect, 2), 2),
            ApplyOutcome::Ignored
        ));
        assert_eq!(t.get("a").unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn equal_incarnation_resolves_by_priority() {
        let t = table();
        t.apply(&update("a", MemberStatus::Suspect, 5), 0);
        // alive > suspect at the same incarnation
        assert!(matches!(
            t.apply(&update("a", MemberStatus::Alive, 5), 1),
            ApplyOutcome::Applied(_)
        ));
        // and suspect does not beat alive back down
        assert!(matches!(
            t.apply(&update("a", MemberStatus::Suspect, 5), 2),
            ApplyOutcome::Ignored
        ));
        // failed < suspect
        assert!(matches!(
            t.apply(&update("a", MemberStatus::Failed, 5), 3),
            ApplyOutcome::Ignored
        ));
    }

    #[test]
    fn slander_about_self_is_refuted_with_a_bump() {
        let t = table();
        assert_eq!(t.self_incarnation(), 1);
        let outcome = t.apply(&update("self", MemberStatus::Suspect, 1), 0);
        let ApplyOutcome::SelfRefutation(refutation) = outcome else {
            panic!("expected refutation, got {outcome:?}");
        };
        assert_eq!(refutation.status, MemberStatus::Alive);
        assert_eq!(refutation.incarnation, 2);
        assert_eq!(t.self_incarnation(), 2);

        // Stale slander below our incarnation is simply ignored.
        assert!(matches!(
            t.apply(&update("self", MemberStatus::Failed, 1), 1),
            ApplyOutcome::Ignored
        ));
    }

    #[test]
    fn suspect_then_confirm_respects_refutation() {
        let t = table();
        t.apply(&update("a", MemberStatus::Alive, 7), 0);
        let suspect = t.mark_suspect("a", 1).unwrap();
        assert_eq!(suspect.status, MemberStatus::Suspect);

        // The member refutes with a higher incarnation before the
        // suspicion timer fires: confirmation must not promote it.
        t.apply(&update("a", MemberStatus::Alive, 8), 2);
        assert!(t.confirm_failed("a", suspect.incarnation, 3).is_none());
        assert_eq!(t.get("a").unwrap().status, MemberStatus::Alive);

        // Without a refutation the promotion goes through.
        let suspect = t.mark_suspect("a", 4).unwrap();
        let failed = t.confirm_failed("a", suspect.incarnation, 5).unwrap();
        assert_eq!(failed.status, MemberStatus::Failed);
    }

    #[test]
    fn convergence_is_order_independent() {
        // Two servers receiving the same updates in different orders
        // converge on the same final state for each member.
        let updates = [
            update("a", MemberStatus::Alive, 1),
            update("a", MemberStatus::Suspect, 1),
            update("a", MemberStatus::Alive, 2),
            update("a", MemberStatus::Failed, 2),
        ];
        let t1 = table();
        for u in &updates {
            t1.apply(u, 0);
        }
        let t2 = table();
        for u in updates.iter().rev() {
            t2.apply(u, 0);
        }
        let m1 = t1.get("a").unwrap();
        let m2 = t2.get("a").unwrap();
        assert_eq!(m1.incarnation, m2.incarnation);
        assert_eq!(m1.status, m2.status);
    }

    #[test]
    fn prune_drops_stale_failures_only() {
        let t = table();
        t.apply(&update("gone", MemberStatus::Failed, 1), 0);
        t.apply(&update("fresh", MemberStatus::Alive, 1), 0);
        let pruned = t.prune(100, 30);
        assert_eq!(pruned, vec!["gone".to_string()]);
        assert!(t.get("fresh").is_some());
    }

    #[test]
    fn piggyback_returns_most_recent_five() {
        let t = table();
        for i in 0..10 {
            t.apply(&update(&format!("m{i}"), MemberStatus::Alive, 1), 0);
        }
        let recent = t.recent_updates();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].server_id, "m9");
    }
}
