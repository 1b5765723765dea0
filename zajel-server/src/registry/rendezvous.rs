//! Rendezvous registry: daily meeting points and hourly live tokens.
//!
//! Maps opaque hash bytes to peer entries, backed by SQLite so the
//! registry survives restarts. Daily points carry an encrypted dead drop
//! (TTL 48 h); hourly tokens carry only presence (TTL 3 h) and produce
//! real-time match notifications for peers already waiting on the token.
//!
//! All mutation serializes through the registry mutex, and a batch
//! registration is a single SQL transaction: callers observe entries that
//! existed strictly before their own write, and a batch either fully
//! commits or not at all.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;

use super::RegistryError;
use crate::db::{Db, PointRow};

/// Daily meeting point TTL: 48 hours.
pub const DAILY_TTL_SECS: i64 = 48 * 3600;

/// Hourly live token TTL: 3 hours.
pub const HOURLY_TTL_SECS: i64 = 3 * 3600;

/// A dead drop found for the caller during daily registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDeadDrop {
    pub peer_id: String,
    pub dead_drop: Vec<u8>,
    pub relay_id: String,
}

/// A live peer found on an hourly token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMatch {
    pub peer_id: String,
    pub relay_id: String,
    pub token_hash: Vec<u8>,
}

/// Result of an hourly registration: matches for the caller, plus the
/// notifications owed to peers that were already waiting.
#[derive(Debug, Clone, Default)]
pub struct HourlyRegistration {
    pub live_matches: Vec<LiveMatch>,
    /// (peer to notify, match describing the new arrival).
    pub notify: Vec<(String, LiveMatch)>,
}

pub struct RendezvousRegistry {
    db: Mutex<Db>,
    clock: AtomicI64,
    shutting_down: AtomicBool,
}

impl RendezvousRegistry {
    pub fn new(db: Db) -> Result<Self, RegistryError> {
        let clock = db.max_vector_clock()?;
        Ok(Self {
            db: Mutex::new(db),
            clock: AtomicI64::new(clock),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn next_clock(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_open(&self) -> Result<(), RegistryError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(RegistryError::ShuttingDown);
        }
        Ok(())
    }

    /// Register `peer_id` on a batch of daily points, returning the dead
    /// drops of every other live peer already on those points.
    pub fn register_daily_points(
        &self,
        peer_id: &str,
        points: &[Vec<u8>],
        dead_drop: &[u8],
        relay_id: &str,
        now: i64,
    ) -> Result<Vec<FoundDeadDrop>, RegistryError> {
        self.check_open()?;
        let clock = self.next_clock();
        let mut db = self.db.lock();
        let rows = db.register_daily_points(
            peer_id,
            points,
            dead_drop,
            relay_id,
            now,
            DAILY_TTL_SECS,
            clock,
        )?;
        Ok(rows
            .into_iter()
            .map(|r| FoundDeadDrop {
                peer_id: r.peer_id,
                dead_drop: r.dead_drop,
                relay_id: r.relay_id,
            })
            .collect())
    }

    /// Register `peer_id` on a batch of hourly tokens. Existing peers are
    /// returned as live matches for the caller and also listed in
    /// `notify` so the server can push a real-time `match` event to each.
    pub fn register_hourly_tokens(
        &self,
        peer_id: &str,
        tokens: &[Vec<u8>],
        relay_id: &str,
        now: i64,
    ) -> Result<HourlyRegistration, RegistryError> {
        self.check_open()?;
        let clock = self.next_clock();
        let mut db = self.db.lock();
        let rows =
            db.register_hourly_tokens(peer_id, tokens, relay_id, now, HOURLY_TTL_SECS, clock)?;

        let mut result = HourlyRegistration::default();
        for row in rows {
            let existing = LiveMatch {
                peer_id: row.peer_id.clone(),
                relay_id: row.relay_id.clone(),
                token_hash: row.hash.clone(),
            };
            // The waiting peer learns about the new arrival.
            result.notify.push((
                row.peer_id,
                LiveMatch {
                    peer_id: peer_id.to_string(),
                    relay_id: relay_id.to_string(),
                    token_hash: row.hash,
                },
            ));
            result.live_matches.push(existing);
        }
        Ok(result)
    }

    /// Live entries for one daily point.
    pub fn get_daily_point(&self, point: &[u8], now: i64) -> Result<Vec<PointRow>, RegistryError> {
        Ok(self.db.lock().get_daily_point(point, now)?)
    }

    /// Remove all entries owned by a peer (disconnect cleanup).
    pub fn unregister_peer(&self, peer_id: &str) -> Result<usize, RegistryError> {
        Ok(self.db.lock().unregister_peer(peer_id)?)
    }

    /// Evict expired entries. Called by the periodic sweeper.
    pub fn cleanup(&self, now: i64) -> Result<usize, RegistryError> {
        Ok(self.db.lock().cleanup_rendezvous(now)?)
    }

    /// Block new registrations; reads and cleanup continue during drain.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}
