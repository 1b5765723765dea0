//! File-chunk advertisement index.
//!
//! Peers announce which encrypted chunks they hold; requesters are routed
//! to an announcer. The server never sees chunk content — only ids.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use rand::seq::IteratorRandom;

#[derive(Default)]
pub struct ChunkIndex {
    /// chunk id → peers holding it.
    holders: Mutex<HashMap<String, HashSet<String>>>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer_id` holds each of `chunk_ids`.
    pub fn announce(&self, peer_id: &str, chunk_ids: &[String]) {
        let mut holders = self.holders.lock();
        for chunk in chunk_ids {
            holders
                .entry(chunk.clone())
                .or_default()
                .insert(peer_id.to_string());
        }
    }

    /// Pick one holder of a chunk, excluding the requester.
    pub fn pick_holder(&self, chunk_id: &str, exclude: &str) -> Option<String> {
        let holders = self.holders.lock();
        holders
            .get(chunk_id)?
            .iter()
            .filter(|p| p.as_str() != exclude)
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Forget everything a departing peer announced.
    pub fn unregister_peer(&self, peer_id: &str) {
        let mut holders = self.holders.lock();
        for set in holders.values_mut() {
            set.remove(peer_id);
        }
        holders.retain(|_, set| !set.is_empty());
    }

    pub fn chunk_count(&self) -> usize {
        self.holders.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_and_pick() {
        let index = ChunkIndex::new();
        index.announce("alice", &["c1".into(), "c2".into()]);
        assert_eq!(index.pick_holder("c1", "bob"), Some("alice".to_string()));
        // The requester is never routed to itself.
        assert_eq!(index.pick_holder("c1", "alice"), None);
        assert_eq!(index.pick_holder("missing", "bob"), None);
    }

    #[test]
    fn unregister_clears_empty_chunks() {
        let index = ChunkIndex::new();
        index.announce("alice", &["c1".into()]);
        index.announce("bob", &["c1".into()]);
        index.unregister_peer("alice");
        assert_eq!(index.pick_holder("c1", "x"), Some("bob".to_string()));
        index.unregister_peer("bob");
        assert_eq!(index.chunk_count(), 0);
    }
}
