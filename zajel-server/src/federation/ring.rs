//! Consistent-hash ring with virtual nodes.
//!
//! Each server occupies [`VIRTUAL_NODES`] positions derived from
//! `SHA-256("{serverId}#{i}")`. A key is owned by the next
//! [`REPLICATION_FACTOR`] distinct servers clockwise from its hash whose
//! status is alive or suspect. Fewer than R available servers is
//! tolerated (under-replicated, heals as the membership grows).

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use super::membership::MemberStatus;

/// Ring positions per server.
pub const VIRTUAL_NODES: usize = 128;

/// Responsible servers per key.
pub const REPLICATION_FACTOR: usize = 3;

#[derive(Debug, Clone)]
pub struct RingNode {
    pub server_id: String,
    pub endpoint: String,
    pub status: MemberStatus,
}

/// First 8 bytes (big-endian) of SHA-256.
fn hash_position(input: &[u8]) -> u64 {
    let digest = Sha256::digest(input);
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[derive(Default)]
pub struct HashRing {
    /// position → server id. Virtual node collisions across servers are
    /// resolved last-writer-wins; at 2^64 positions they are negligible.
    positions: BTreeMap<u64, String>,
    nodes: HashMap<String, RingNode>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a server. Idempotent.
    pub fn upsert(&mut self, server_id: &str, endpoint: &str, status: MemberStatus) {
        if !self.nodes.contains_key(server_id) {
            for i in 0..VIRTUAL_NODES {
                let pos = hash_position(format!("{server_id}#{i}").as_bytes());
                self.positions.insert(pos, server_id.to_string());
            }
        }
        self.nodes.insert(
            server_id.to_string(),
            RingNode {
                server_id: server_id.to_string(),
                endpoint: endpoint.to_string(),
                status,
            },
        );
    }

    /// Remove a server and all its virtual nodes. Idempotent.
    pub fn remove(&mut self, server_id: &str) {
        if self.nodes.remove(server_id).is_none() {
            return;
        }
        self.positions.retain(|_, id| id != server_id);
    }

    fn is_available(&self, server_id: &str) -> bool {
        self.nodes
            .get(server_id)
            .is_some_and(|n| matches!(n.status, MemberStatus::Alive | MemberStatus::Suspect))
    }

    /// Servers whose status makes them eligible owners.
    pub fn available_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| matches!(n.status, MemberStatus::Alive | MemberStatus::Suspect))
            .count()
    }

    /// The responsible servers for a key: up to R distinct available
    /// servers clockwise from the key's position.
    pub fn responsible(&self, key: &[u8]) -> Vec<&RingNode> {
        if self.positions.is_empty() {
            return Vec::new();
        }
        let start = hash_position(key);
        let mut owners: Vec<&RingNode> = Vec::new();
        // Walk clockwise from the key position, wrapping once.
        for (_, server_id) in self
            .positions
            .range(start..)
            .chain(self.positions.range(..start))
        {
            if owners.len() >= REPLICATION_FACTOR {
                break;
            }
            if !self.is_available(server_id) {
                continue;
            }
            if owners.iter().any(|n| &n.server_id == server_id) {
                continue;
            }
            if let Some(node) = self.nodes.get(server_id) {
                owners.push(node);
            }
        }
        owners
    }

    /// Whether `server_id` is among the responsible servers for `key`.
    pub fn owns(&self, key: &[u8], server_id: &str) -> bool {
        self.responsible(key)
            .iter()
            .any(|n| n.server_id == server_id)
    }

    /// The first responsible server for a key (redirect target).
    pub fn primary(&self, key: &[u8]) -> Option<&RingNode> {
        self.responsible(key).into_iter().next()
    }
}
