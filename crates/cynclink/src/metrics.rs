//! Counters, gauges and the state-lock hold histogram.
//!
//! Plain atomics, one field per emitted label value; scrapers and tests read
//! a [`MetricsSnapshot`]. Each transport instance owns its metrics; nothing
//! here is process-global.

use crate::error::AbandonReason;
use crate::session::LinkState;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Bucket bounds of the lock-hold histogram, in nanoseconds.
const HOLD_BOUNDS: [u64; 3] = [1_000_000, 10_000_000, 100_000_000];

#[derive(Debug, Default)]
pub struct LockHoldHistogram {
    // <1 ms, <10 ms, <100 ms, >=100 ms
    buckets: [AtomicU64; 4],
    max_nanos: AtomicU64,
    count: AtomicU64,
}

impl LockHoldHistogram {
    pub fn record(&self, held: Duration) {
        let nanos = held.as_nanos().min(u64::MAX as u128) as u64;
        let idx = HOLD_BOUNDS.iter().position(|b| nanos < *b).unwrap_or(3);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed))
    }

    pub fn buckets(&self) -> [u64; 4] {
        [
            self.buckets[0].load(Ordering::Relaxed),
            self.buckets[1].load(Ordering::Relaxed),
            self.buckets[2].load(Ordering::Relaxed),
            self.buckets[3].load(Ordering::Relaxed),
        ]
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Observable state of one transport instance.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    acks_matched: AtomicU64,
    acks_late: AtomicU64,
    acks_orphan: AtomicU64,
    ack_timeouts: AtomicU64,
    idempotent_drops: AtomicU64,
    retry_attempts: AtomicU64,
    abandoned_ack_timeout: AtomicU64,
    abandoned_shutdown: AtomicU64,
    abandoned_cancelled: AtomicU64,
    abandoned_stale: AtomicU64,
    handshakes_ok: AtomicU64,
    handshakes_failed: AtomicU64,
    reconnections: AtomicU64,
    heartbeats_ok: AtomicU64,
    heartbeats_missed: AtomicU64,
    dedup_hits: AtomicU64,
    dedup_evictions: AtomicU64,
    connection_state: AtomicU8,
    dedup_size: AtomicUsize,
    pub lock_hold: LockHoldHistogram,
}

impl TransportMetrics {
    pub(crate) fn inc_ack_matched(&self) {
        self.acks_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_ack_late(&self) {
        self.acks_late.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_ack_orphan(&self) {
        self.acks_orphan.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_ack_timeout(&self) {
        self.ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_idempotent_drop(&self) {
        self.idempotent_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_retry_attempt(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_abandoned(&self, reason: AbandonReason) {
        let counter = match reason {
            AbandonReason::AckTimeout => &self.abandoned_ack_timeout,
            AbandonReason::Shutdown => &self.abandoned_shutdown,
            AbandonReason::Cancelled => &self.abandoned_cancelled,
            AbandonReason::Stale => &self.abandoned_stale,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_handshake(&self, ok: bool) {
        if ok {
            self.handshakes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn inc_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_heartbeat(&self, ok: bool) {
        if ok {
            self.heartbeats_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn inc_dedup_hit(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_dedup_evictions(&self, n: u64) {
        self.dedup_evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.connection_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.connection_state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_dedup_size(&self, size: usize) {
        self.dedup_size.store(size, Ordering::Relaxed);
    }

    /// Point-in-time copy of every series.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acks_matched: self.acks_matched.load(Ordering::Relaxed),
            acks_late: self.acks_late.load(Ordering::Relaxed),
            acks_orphan: self.acks_orphan.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            idempotent_drops: self.idempotent_drops.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            abandoned_ack_timeout: self.abandoned_ack_timeout.load(Ordering::Relaxed),
            abandoned_shutdown: self.abandoned_shutdown.load(Ordering::Relaxed),
            abandoned_cancelled: self.abandoned_cancelled.load(Ordering::Relaxed),
            abandoned_stale: self.abandoned_stale.load(Ordering::Relaxed),
            handshakes_ok: self.handshakes_ok.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            heartbeats_ok: self.heartbeats_ok.load(Ordering::Relaxed),
            heartbeats_missed: self.heartbeats_missed.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            dedup_evictions: self.dedup_evictions.load(Ordering::Relaxed),
            connection_state: self.state(),
            dedup_size: self.dedup_size.load(Ordering::Relaxed),
            lock_hold_buckets: self.lock_hold.buckets(),
            lock_hold_max: self.lock_hold.max(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub acks_matched: u64,
    pub acks_late: u64,
    pub acks_orphan: u64,
    pub ack_timeouts: u64,
    pub idempotent_drops: u64,
    pub retry_attempts: u64,
    pub abandoned_ack_timeout: u64,
    pub abandoned_shutdown: u64,
    pub abandoned_cancelled: u64,
    pub abandoned_stale: u64,
    pub handshakes_ok: u64,
    pub handshakes_failed: u64,
    pub reconnections: u64,
    pub heartbeats_ok: u64,
    pub heartbeats_missed: u64,
    pub dedup_hits: u64,
    pub dedup_evictions: u64,
    pub connection_state: LinkState,
    pub dedup_size: usize,
    pub lock_hold_buckets: [u64; 4],
    pub lock_hold_max: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let metrics = TransportMetrics::default();
        metrics.inc_ack_matched();
        metrics.inc_ack_matched();
        metrics.inc_ack_late();
        metrics.inc_abandoned(AbandonReason::Cancelled);
        metrics.inc_heartbeat(true);
        metrics.inc_heartbeat(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.acks_matched, 2);
        assert_eq!(snap.acks_late, 1);
        assert_eq!(snap.abandoned_cancelled, 1);
        assert_eq!(snap.heartbeats_ok, 1);
        assert_eq!(snap.heartbeats_missed, 1);
    }

    #[test]
    fn test_state_gauge_roundtrip() {
        let metrics = TransportMetrics::default();
        assert_eq!(metrics.state(), LinkState::Disconnected);
        metrics.set_state(LinkState::Connected);
        assert_eq!(metrics.state(), LinkState::Connected);
        metrics.set_state(LinkState::Reconnecting);
        assert_eq!(metrics.snapshot().connection_state, LinkState::Reconnecting);
    }

    #[test]
    fn test_lock_hold_buckets_and_max() {
        let hist = LockHoldHistogram::default();
        hist.record(Duration::from_micros(10));
        hist.record(Duration::from_millis(5));
        hist.record(Duration::from_millis(50));
        hist.record(Duration::from_millis(500));

        assert_eq!(hist.buckets(), [1, 1, 1, 1]);
        assert_eq!(hist.count(), 4);
        assert_eq!(hist.max(), Duration::from_millis(500));
    }
}
