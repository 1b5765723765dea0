//! Relay registry: peers volunteering to proxy traffic for others.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;

/// Default connection budget for a relay that doesn't announce one.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Relays at or above this load fraction are never handed out.
const LOAD_CUTOFF: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct RelayEntry {
    pub peer_id: String,
    pub public_key: String,
    pub relay_id: String,
    pub max_connections: u32,
    pub connected_count: u32,
    pub registered_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl RelayEntry {
    /// Load fraction in `[0, 1]`.
    pub fn capacity(&self) -> f64 {
        if self.max_connections == 0 {
            return 1.0;
        }
        f64::from(self.connected_count) / f64::from(self.max_connections)
    }
}

/// A relay offered to a client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelayOffer {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub capacity: f64,
}

#[derive(Default)]
pub struct RelayRegistry {
    inner: Mutex<HashMap<String, RelayEntry>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) a peer as a rendezvous relay host.
    pub fn register(&self, peer_id: &str, public_key: &str, relay_id: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner
            .entry(peer_id.to_string())
            .and_modify(|e| {
                e.relay_id = relay_id.to_string();
                e.public_key = public_key.to_string();
                e.last_update = now;
            })
            .or_insert_with(|| RelayEntry {
                peer_id: peer_id.to_string(),
                public_key: public_key.to_string(),
                relay_id: relay_id.to_string(),
                max_connections: DEFAULT_MAX_CONNECTIONS,
                connected_count: 0,
                registered_at: now,
                last_update: now,
            });
    }

    /// Update load telemetry from an `update_load` frame.
    pub fn update_load(&self, peer_id: &str, connected_count: u32, max_connections: Option<u32>) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(peer_id) {
            entry.connected_count = connected_count;
            if let Some(max) = max_connections {
                entry.max_connections = max;
            }
            entry.last_update = Utc::now();
        }
    }

    /// Refresh liveness without changing load.
    pub fn heartbeat(&self, peer_id: &str) {
        if let Some(entry) = self.inner.lock().get_mut(peer_id) {
            entry.last_update = Utc::now();
        }
    }

    pub fn unregister(&self, peer_id: &str) {
        self.inner.lock().remove(peer_id);
    }

    /// Low-load relays, shuffled, truncated to `count`, never including
    /// `exclude_peer_id`.
    pub fn available(&self, exclude_peer_id: &str, count: usize) -> Vec<RelayOffer> {
        let mut offers: Vec<RelayOffer> = {
            let inner = self.inner.lock();
            inner
                .values()
                .filter(|e| e.peer_id != exclude_peer_id && e.capacity() < LOAD_CUTOFF)
                .map(|e| RelayOffer {
                    peer_id: e.peer_id.clone(),
                    public_key: e.public_key.clone(),
                    capacity: e.capacity(),
                })
                .collect()
        };
        offers.shuffle(&mut rand::thread_rng());
        offers.truncate(count);
        offers
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Jittered fraction of a base value, ±`spread` (used by reconnect backoff).
pub fn jitter(base_ms: u64, spread: f64) -> u64 {
    let factor = 1.0 + rand::thread_rng().gen_range(-spread..spread);
    (base_ms as f64 * factor) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loaded_relays_are_filtered() {
        let reg = RelayRegistry::new();
        reg.register("light", "pk-light", "r1");
        reg.register("heavy", "pk-heavy", "r2");
        reg.update_load("heavy", 15, None); // 15/20 = 0.75

        let offers = reg.available("nobody", 10);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].peer_id, "light");
    }

    #[test]
    fn requester_is_excluded_and_count_respected() {
        let reg = RelayRegistry::new();
        for i in 0..8 {
            reg.register(&format!("relay-{i}"), "pk", "r");
        }
        let offers = reg.available("relay-0", 3);
        assert_eq!(offers.len(), 3);
        assert!(offers.iter().all(|o| o.peer_id != "relay-0"));
    }

    #[test]
    fn boundary_load_is_excluded() {
        let reg = RelayRegistry::new();
        reg.register("edge", "pk", "r");
        reg.update_load("edge", 10, None); // exactly 0.5
        assert!(reg.available("nobody", 10).is_empty());
    }

    #[test]
    fn jitter_stays_within_spread() {
        for _ in 0..100 {
            let v = jitter(1000, 0.2);
            assert!((800..=1200).contains(&v), "jitter out of range: {v}");
        }
    }
}
