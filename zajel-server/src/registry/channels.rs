//! Channel registry: owner/subscriber mesh and upstream queues.
//!
//! A channel has at most one owner (the fan-in authority) and any number
//! of subscribers. Upstream messages for an offline owner queue with a
//! bound of 100 (drop-oldest) and a per-item TTL of 5 minutes; the queue
//! is flushed FIFO when an owner registers and swept once a minute.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Upstream queue bound per channel.
pub const QUEUE_CAPACITY: usize = 100;

/// Per-item upstream TTL.
pub const QUEUE_TTL: Duration = Duration::from_secs(5 * 60);

/// How many active-stream announcements a late subscriber is told about.
const ACTIVE_STREAM_CAP: usize = 16;

/// A queued upstream frame awaiting the channel owner.
#[derive(Debug, Clone)]
pub struct QueuedUpstream {
    pub frame: serde_json::Value,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct ChannelState {
    owner: Option<String>,
    subscribers: HashSet<String>,
    queue: VecDeque<QueuedUpstream>,
    /// streamId → the stream-start frame, kept while the stream is live
    /// so late subscribers can attach. Frames are never replayed.
    active_streams: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
pub struct ChannelRegistry {
    inner: Mutex<HashMap<String, ChannelState>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── subscribers ────────────────────────────────────────────────

    /// Add a subscriber. Returns the active stream-start frames so the
    /// joiner knows which streams are in progress.
    pub fn subscribe(&self, channel: &str, peer_id: &str) -> Vec<serde_json::Value> {
        let mut inner = self.inner.lock();
        let state = inner.entry(channel.to_string()).or_default();
        state.subscribers.insert(peer_id.to_string());
        state.active_streams.values().cloned().collect()
    }

    pub fn unsubscribe(&self, channel: &str, peer_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.get_mut(channel) {
            state.subscribers.remove(peer_id);
        }
    }

    /// Subscribers of a channel, excluding `exclude`.
    pub fn subscribers(&self, channel: &str, exclude: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .get(channel)
            .map(|state| {
                state
                    .subscribers
                    .iter()
                    .filter(|p| p.as_str() != exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_known(&self, channel: &str) -> bool {
        self.inner.lock().contains_key(channel)
    }

    // ── streams ────────────────────────────────────────────────────

    /// Record a live stream so late subscribers can attach.
    pub fn stream_started(&self, channel: &str, stream_id: &str, start_frame: serde_json::Value) {
        let mut inner = self.inner.lock();
        let state = inner.entry(channel.to_string()).or_default();
        if state.active_streams.len() < ACTIVE_STREAM_CAP {
            state
                .active_streams
                .insert(stream_id.to_string(), start_frame);
        }
    }

    pub fn stream_ended(&self, channel: &str, stream_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.get_mut(channel) {
            state.active_streams.remove(stream_id);
        }
    }

    // ── owner and upstream queue ───────────────────────────────────

    /// Current owner, if online.
    pub fn owner(&self, channel: &str) -> Option<String> {
        self.inner.lock().get(channel).and_then(|s| s.owner.clone())
    }

    /// Queue an upstream frame for an offline owner. Drops the oldest
    /// entry when the bound is hit; returns true if something was dropped.
    pub fn enqueue_upstream(&self, channel: &str, frame: serde_json::Value, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let state = inner.entry(channel.to_string()).or_default();
        let mut dropped = false;
        while state.queue.len() >= QUEUE_CAPACITY {
            state.queue.pop_front();
            dropped = true;
        }
        state.queue.push_back(QueuedUpstream {
            frame,
            enqueued_at: now,
        });
        dropped
    }

    /// Claim channel ownership. Atomically evicts expired queue entries,
    /// returns the survivors in FIFO order, and deletes the queue.
    pub fn claim_owner(&self, channel: &str, peer_id: &str, now: Instant) -> Vec<serde_json::Value> {
        let mut inner = self.inner.lock();
        let state = inner.entry(channel.to_string()).or_default();
        state.owner = Some(peer_id.to_string());
        let queue = std::mem::take(&mut state.queue);
        queue
            .into_iter()
            .filter(|q| now.saturating_duration_since(q.enqueued_at) < QUEUE_TTL)
            .map(|q| q.frame)
            .collect()
    }

    /// Release ownership everywhere this peer holds it. The queues stay
    /// in place for the next owner. Returns the released channels.
    pub fn release_owner(&self, peer_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut released = Vec::new();
        for (name, state) in inner.iter_mut() {
            if state.owner.as_deref() == Some(peer_id) {
                state.owner = None;
                released.push(name.clone());
            }
        }
        released
    }

    /// Remove a peer from every subscriber set.
    pub fn remove_subscriber_everywhere(&self, peer_id: &str) {
        let mut inner = self.inner.lock();
        for state in inner.values_mut() {
            state.subscribers.remove(peer_id);
        }
        inner.retain(|_, s| {
            !s.subscribers.is_empty()
                || s.owner.is_some()
                || !s.queue.is_empty()
                || !s.active_streams.is_empty()
        });
    }

    /// Evict queue entries past TTL regardless of owner registration.
    /// Runs every minute from the sweeper task.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let mut evicted = 0;
        for state in inner.values_mut() {
            let before = state.queue.len();
            state
                .queue
                .retain(|q| now.saturating_duration_since(q.enqueued_at) < QUEUE_TTL);
            evicted += before - state.queue.len();
        }
        evicted
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Total queued upstream frames across channels (for stats).
    pub fn queued_total(&self) -> usize {
        self.inner.lock().values().map(|s| s.queue.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn queue_caps_at_100_drop_oldest() {
        let reg = ChannelRegistry::new();
        let now = Instant::now();
        for i in 0..150 {
            reg.enqueue_upstream("ch", json!({"n": i}), now);
        }
        assert_eq!(reg.queued_total(), QUEUE_CAPACITY);

        let flushed = reg.claim_owner("ch", "owner", now);
        assert_eq!(flushed.len(), QUEUE_CAPACITY);
        // Oldest 50 dropped: first survivor is n=50, FIFO order after.
        assert_eq!(flushed[0]["n"], 50);
        assert_eq!(flushed[99]["n"], 149);
    }

    #[test]
    fn owner_claim_skips_expired_and_clears_queue() {
        let reg = ChannelRegistry::new();
        let start = Instant::now();
        for i in 0..50 {
            reg.enqueue_upstream("ch", json!({"n": i}), start);
        }
        // 6 minutes pass; 50 more arrive.
        let later = start + Duration::from_secs(360);
        for i in 50..100 {
            reg.enqueue_upstream("ch", json!({"n": i}), later);
        }

        let flushed = reg.claim_owner("ch", "owner", later);
        assert_eq!(flushed.len(), 50);
        assert_eq!(flushed[0]["n"], 50);
        assert_eq!(flushed[49]["n"], 99);

        // And then nothing: the queue was deleted on claim.
        assert!(reg.claim_owner("ch", "owner", later).is_empty());
    }

    #[test]
    fn sweep_evicts_by_ttl() {
        let reg = ChannelRegistry::new();
        let start = Instant::now();
        reg.enqueue_upstream("ch", json!({"old": true}), start);
        let later = start + Duration::from_secs(200);
        reg.enqueue_upstream("ch", json!({"old": false}), later);

        let evicted = reg.sweep(start + Duration::from_secs(301));
        assert_eq!(evicted, 1);
        assert_eq!(reg.queued_total(), 1);
    }

    #[test]
    fn release_keeps_queue_for_next_owner() {
        let reg = ChannelRegistry::new();
        let now = Instant::now();
        reg.claim_owner("ch", "first", now);
        reg.enqueue_upstream("ch", json!({"n": 1}), now);
        let released = reg.release_owner("first");
        assert_eq!(released, vec!["ch".to_string()]);
        assert!(reg.owner("ch").is_none());

        let flushed = reg.claim_owner("ch", "second", now);
        assert_eq!(flushed.len(), 1);
    }

    #[test]
    fn late_subscriber_sees_active_streams_only() {
        let reg = ChannelRegistry::new();
        reg.stream_started("ch", "s1", json!({"type": "stream-start", "streamId": "s1"}));
        let replayed = reg.subscribe("ch", "late");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0]["streamId"], "s1");

        reg.stream_ended("ch", "s1");
        assert!(reg.subscribe("ch", "later").is_empty());
    }

    #[test]
    fn subscriber_fanout_excludes_sender() {
        let reg = ChannelRegistry::new();
        reg.subscribe("ch", "a");
        reg.subscribe("ch", "b");
        reg.subscribe("ch", "c");
        let mut targets = reg.subscribers("ch", "b");
        targets.sort();
        assert_eq!(targets, vec!["a".to_string(), "c".to_string()]);
    }
}
