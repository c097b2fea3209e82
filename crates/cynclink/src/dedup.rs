//! Deduplication of inbound packets by Full Fingerprint.

use cynclink_wire::Packet;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Derives the Full Fingerprint of a packet:
/// `hex(kind):hex(endpoint_or_zero):hex(msg_id_or_zero):first16_hex(sha256(payload))`.
///
/// Deterministic in the inputs; equal logical packets yield equal keys.
pub fn dedup_key(packet: &Packet) -> String {
    let endpoint = packet.endpoint.unwrap_or([0u8; 5]);
    let msg_id = packet.msg_id.unwrap_or(0).to_be_bytes();
    let digest = Sha256::digest(&packet.payload);
    format!(
        "{:02x}:{}:{}:{}",
        packet.kind,
        hex::encode(endpoint),
        hex::encode(msg_id),
        hex::encode(&digest[..8])
    )
}

#[derive(Debug)]
struct Entry {
    correlation_id: Uuid,
    inserted_at: Instant,
}

/// Insertion-ordered fingerprint set bounded by size and per-entry TTL.
///
/// Eviction pops the oldest live entry when full; expired entries are swept
/// by the transport's cleanup task. Accessed only from event-loop tasks on
/// one connection.
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, Entry>,
    // Insertion order; stale records (reinserted or swept keys) are skipped
    // during eviction by comparing timestamps.
    order: VecDeque<(String, Instant)>,
    max_entries: usize,
    ttl: Duration,
    evictions: u64,
}

impl DedupCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
            ttl,
            evictions: 0,
        }
    }

    fn is_live(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) < self.ttl
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => self.is_live(entry, Instant::now()),
            None => false,
        }
    }

    /// Records `key` if it is not already live. Returns `true` when the key
    /// was inserted (first sighting wins) and `false` on a duplicate.
    pub fn insert(&mut self, key: &str, correlation_id: Uuid) -> bool {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if self.is_live(entry, now) {
                return false;
            }
            // Expired but not yet swept; treat as fresh.
            self.entries.remove(key);
        }

        while self.entries.len() >= self.max_entries {
            match self.order.pop_front() {
                Some((old_key, inserted_at)) => {
                    // Only evict if the order record still describes the
                    // current entry for that key.
                    let matches = self
                        .entries
                        .get(&old_key)
                        .is_some_and(|e| e.inserted_at == inserted_at);
                    if matches {
                        self.entries.remove(&old_key);
                        self.evictions += 1;
                    }
                }
                None => break,
            }
        }

        self.entries.insert(
            key.to_string(),
            Entry {
                correlation_id,
                inserted_at: now,
            },
        );
        self.order.push_back((key.to_string(), now));
        true
    }

    /// Correlation id recorded at the first sighting of `key`, if live.
    pub fn correlation_of(&self, key: &str) -> Option<Uuid> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| self.is_live(e, now))
            .map(|e| e.correlation_id)
    }

    /// Drops expired entries; returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.inserted_at) < ttl);
        let entries = &self.entries;
        self.order.retain(|(key, inserted_at)| {
            entries
                .get(key)
                .is_some_and(|e| e.inserted_at == *inserted_at)
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
