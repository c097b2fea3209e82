//! The reliable transport: public send/receive API, correlation, hybrid ACK
//! matching, retries and cleanup.
//!
//! One instance owns one connection. All pending-request bookkeeping lives in
//! [`Shared`] behind a single short-lived lock; every mutation of the two
//! send indexes (`pending` by correlation id, `msg_index` by msg_id) happens
//! inside one [`Inner::with_shared`] closure so an entry is created and
//! destroyed exactly once. Network writes and awaits always happen after the
//! lock is released.

use crate::dedup::{DedupCache, dedup_key};
use crate::error::{AbandonReason, AckTimeoutReason, SendResult, TrackedPacket, TransportError};
use crate::link::Link;
use crate::metrics::TransportMetrics;
use crate::options::TransportOptions;
use crate::retry::RetryPolicy;
use crate::session::{self, LinkState};
use cynclink_wire::{Endpoint, Packet, WireError, codec, packet};
use log::{debug, error, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Resolution of a pending request's completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// The matching ACK arrived.
    Acked,
    /// The connection dropped; in-flight waiters were flushed.
    Reconnect,
    /// The transport was stopped.
    Shutdown,
    /// The cleanup sweep finalized the entry.
    Stale,
}

/// A 0x73 awaiting its 0x7B. Survives retry attempts so a late ACK from an
/// earlier attempt still matches; removed exactly once.
pub(crate) struct PendingSend {
    pub msg_id: u16,
    pub sent_at: Instant,
    pub retry_count: u16,
    pub signal: Option<oneshot::Sender<AckOutcome>>,
}

/// A request awaiting a FIFO-matched ACK (0x28/0x88/0xD8/0x48).
pub(crate) struct FifoPending {
    pub correlation_id: Uuid,
    pub sent_at: Instant,
    pub retry_count: u16,
    pub signal: Option<oneshot::Sender<AckOutcome>>,
}

/// Everything the state lock protects.
pub(crate) struct Shared {
    pub state: LinkState,
    pub endpoint: Option<Endpoint>,
    pub auth: Vec<u8>,
    pub next_msg_id: u16,
    pub pending: HashMap<Uuid, PendingSend>,
    pub msg_index: HashMap<u16, Uuid>,
    /// Per-ACK-kind queues; senders enqueue before the wire write, the router
    /// resolves by popping the head.
    pub fifo: HashMap<u8, VecDeque<FifoPending>>,
}

impl Shared {
    fn new(opts: &TransportOptions) -> Self {
        Self {
            state: LinkState::Disconnected,
            endpoint: None,
            auth: Vec::new(),
            next_msg_id: opts.initial_msg_id.unwrap_or_else(rand::random::<u16>),
            pending: HashMap::new(),
            msg_index: HashMap::new(),
            fifo: HashMap::new(),
        }
    }

    /// Next msg_id, monotonic mod 2^16, skipping ids still outstanding.
    pub(crate) fn alloc_msg_id(&mut self) -> u16 {
        loop {
            let id = self.next_msg_id;
            self.next_msg_id = self.next_msg_id.wrapping_add(1);
            if !self.msg_index.contains_key(&id) {
                return id;
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct TaskSet {
    pub router: Option<JoinHandle<()>>,
    pub heartbeat: Option<JoinHandle<()>>,
    pub reconnect: Option<JoinHandle<()>>,
    pub cleanup: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub opts: TransportOptions,
    pub policy: RetryPolicy,
    pub metrics: Arc<TransportMetrics>,
    pub link: Arc<dyn Link>,
    pub shared: StdMutex<Shared>,
    pub dedup: StdMutex<DedupCache>,
    pub data_tx: mpsc::UnboundedSender<Packet>,
    pub data_rx: AsyncMutex<mpsc::UnboundedReceiver<Packet>>,
    pub reconnect_tx: mpsc::UnboundedSender<&'static str>,
    pub reconnect_rx: StdMutex<Option<mpsc::UnboundedReceiver<&'static str>>>,
    pub shutdown_tx: watch::Sender<bool>,
    pub tasks: StdMutex<TaskSet>,
}

impl Inner {
    /// Runs `f` inside the state lock, recording hold time. The closure must
    /// not block; awaits are impossible by construction.
    pub(crate) fn with_shared<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut guard = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = Instant::now();
        let out = f(&mut guard);
        drop(guard);
        let held = start.elapsed();
        self.metrics.lock_hold.record(held);
        if held >= Duration::from_millis(100) {
            error!("state lock held for {held:?}; this is a bug");
        } else if held >= Duration::from_millis(10) {
            warn!("state lock held for {held:?}");
        }
        out
    }

    pub(crate) fn state(&self) -> LinkState {
        self.with_shared(|s| s.state)
    }

    pub(crate) fn trigger_reconnect(&self, reason: &'static str) {
        if self.reconnect_tx.send(reason).is_err() {
            debug!("reconnect manager gone; dropping trigger ({reason})");
        }
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn with_tasks<R>(&self, f: impl FnOnce(&mut TaskSet) -> R) -> R {
        let mut guard = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub(crate) fn set_router_task(&self, handle: JoinHandle<()>) {
        self.with_tasks(|t| t.router = Some(handle));
    }

    pub(crate) fn set_heartbeat_task(&self, handle: JoinHandle<()>) {
        self.with_tasks(|t| t.heartbeat = Some(handle));
    }

    pub(crate) fn set_reconnect_task(&self, handle: JoinHandle<()>) {
        self.with_tasks(|t| t.reconnect = Some(handle));
    }

    pub(crate) fn take_reconnect_rx(&self) -> Option<mpsc::UnboundedReceiver<&'static str>> {
        let mut guard = match self.reconnect_rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    }

    /// Cancels the per-connection tasks, router first.
    pub(crate) fn abort_session_tasks(&self) {
        let (router, heartbeat) = self.with_tasks(|t| (t.router.take(), t.heartbeat.take()));
        if let Some(handle) = router {
            handle.abort();
        }
        if let Some(handle) = heartbeat {
            handle.abort();
        }
    }

    /// Removes a 0x7B-discipline entry from both indexes.
    pub(crate) fn remove_pending_entry(&self, correlation_id: Uuid) -> bool {
        self.with_shared(|s| match s.pending.remove(&correlation_id) {
            Some(entry) => {
                s.msg_index.remove(&entry.msg_id);
                true
            }
            None => false,
        })
    }

    /// Removes a FIFO entry wherever it sits in its queue.
    pub(crate) fn remove_fifo_entry(&self, correlation_id: Uuid) -> bool {
        self.with_shared(|s| {
            for queue in s.fifo.values_mut() {
                let before = queue.len();
                queue.retain(|e| e.correlation_id != correlation_id);
                if queue.len() != before {
                    return true;
                }
            }
            false
        })
    }

    /// Completes every pending waiter (both disciplines) with `outcome` and
    /// empties the indexes.
    pub(crate) fn flush_in_flight(&self, outcome: AckOutcome) {
        let signals = self.with_shared(|s| {
            let mut signals = Vec::new();
            for (_, mut entry) in s.pending.drain() {
                if let Some(tx) = entry.signal.take() {
                    signals.push(tx);
                }
            }
            s.msg_index.clear();
            for queue in s.fifo.values_mut() {
                for mut entry in queue.drain(..) {
                    if let Some(tx) = entry.signal.take() {
                        signals.push(tx);
                    }
                }
            }
            signals
        });
        let count = signals.len();
        for tx in signals {
            let _ = tx.send(outcome);
        }
        if outcome == AckOutcome::Shutdown {
            for _ in 0..count {
                self.metrics.inc_abandoned(AbandonReason::Shutdown);
            }
        }
        if count > 0 {
            debug!("flushed {count} in-flight waiters ({outcome:?})");
        }
    }

    /// Hybrid ACK resolution, called by the packet router.
    ///
    /// 0x7B resolves in parallel through the msg_id reverse map; the FIFO
    /// kinds resolve by popping the head of their queue. Late 0x7Bs and
    /// empty-queue FIFO ACKs are dropped with a metric.
    pub(crate) fn resolve_ack(&self, pkt: &Packet) {
        match pkt.kind {
            packet::DATA_ACK => {
                let signal = self.with_shared(|s| {
                    let msg_id = pkt.msg_id?;
                    let correlation_id = s.msg_index.remove(&msg_id)?;
                    s.pending
                        .remove(&correlation_id)
                        .and_then(|mut e| e.signal.take())
                });
                match signal {
                    Some(tx) => {
                        if tx.send(AckOutcome::Acked).is_ok() {
                            self.metrics.inc_ack_matched();
                            trace!("matched 0x7B msg_id {:?}", pkt.msg_id);
                        } else {
                            // Waiter timed out between attempts.
                            self.metrics.inc_ack_late();
                        }
                    }
                    None => {
                        self.metrics.inc_ack_late();
                        debug!("late 0x7B (msg_id {:?}) dropped", pkt.msg_id);
                    }
                }
            }
            packet::HANDSHAKE_ACK
            | packet::STATUS_ACK
            | packet::HEARTBEAT_ACK
            | packet::BULK_STATUS_ACK => {
                let signal = self.with_shared(|s| {
                    s.fifo
                        .get_mut(&pkt.kind)
                        .and_then(|q| q.pop_front())
                        .and_then(|mut e| e.signal.take())
                });
                match signal {
                    Some(tx) => {
                        let delivered = tx.send(AckOutcome::Acked).is_ok();
                        if delivered {
                            self.metrics.inc_ack_matched();
                            if pkt.kind == packet::HEARTBEAT_ACK {
                                self.metrics.inc_heartbeat(true);
                            }
                        } else {
                            self.metrics.inc_ack_late();
                        }
                    }
                    None => {
                        self.metrics.inc_ack_orphan();
                        debug!("orphan {:#04x} with empty queue dropped", pkt.kind);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Removes the pending entry if the owning send future is dropped before it
/// resolves, so cancellation never leaks an index entry.
struct PendingGuard {
    inner: Arc<Inner>,
    correlation_id: Uuid,
    armed: bool,
}

impl PendingGuard {
    fn new(inner: Arc<Inner>, correlation_id: Uuid) -> Self {
        Self {
            inner,
            correlation_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self.inner.remove_pending_entry(self.correlation_id)
            || self.inner.remove_fifo_entry(self.correlation_id);
        if removed {
            self.inner.metrics.inc_abandoned(AbandonReason::Cancelled);
            debug!("send {} cancelled before resolution", self.correlation_id);
        }
    }
}

/// Reliable bidirectional transport over one injected [`Link`].
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(link: Arc<dyn Link>, opts: TransportOptions) -> Self {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Shared::new(&opts);
        let dedup = DedupCache::new(opts.dedup_max_entries, opts.dedup_ttl());
        let policy = RetryPolicy::from_options(&opts);
        Self {
            inner: Arc::new(Inner {
                opts,
                policy,
                metrics: Arc::new(TransportMetrics::default()),
                link,
                shared: StdMutex::new(shared),
                dedup: StdMutex::new(dedup),
                data_tx,
                data_rx: AsyncMutex::new(data_rx),
                reconnect_tx,
                reconnect_rx: StdMutex::new(Some(reconnect_rx)),
                shutdown_tx,
                tasks: StdMutex::new(TaskSet::default()),
            }),
        }
    }

    pub fn metrics(&self) -> Arc<TransportMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    /// Stores the endpoint and authorization bytes, establishes the link and
    /// completes the 0x23/0x28 handshake, retrying per the backoff policy.
    /// On success the packet router, heartbeat, reconnect manager and cleanup
    /// tasks are running.
    pub async fn connect(&self, endpoint: Endpoint, auth: &[u8]) -> Result<(), TransportError> {
        let inner = &self.inner;
        inner.with_shared(|s| {
            if s.state != LinkState::Disconnected {
                return Err(TransportError::Handshake {
                    reason: format!("transport already active ({:?})", s.state),
                });
            }
            s.endpoint = Some(endpoint);
            s.auth = auth.to_vec();
            s.state = LinkState::Connecting;
            Ok(())
        })?;
        inner.metrics.set_state(LinkState::Connecting);

        match session::establish_with_retries(inner).await {
            Ok(()) => {
                session::spawn_reconnect_manager(inner);
                spawn_cleanup(inner);
                Ok(())
            }
            Err(e) => {
                inner.with_shared(|s| s.state = LinkState::Disconnected);
                inner.metrics.set_state(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    /// Sends `payload` as a 0x73 and waits for the 0x7B echoing its msg_id.
    ///
    /// On timeout the same msg_id is re-sent up to `max_retries` times with
    /// jittered backoff. Always returns a [`SendResult`]; failures carry the
    /// reason and never leave an entry in the pending indexes.
    pub async fn send_reliable(&self, payload: &[u8]) -> SendResult {
        let inner = Arc::clone(&self.inner);
        let correlation_id = Uuid::now_v7();
        let ack_timeout = inner.opts.ack_timeout();
        let max_retries = inner.opts.max_retries;
        let mut retry_count: u16 = 0;
        let mut guard = PendingGuard::new(Arc::clone(&inner), correlation_id);

        loop {
            // Critical section: verify state, allocate the msg_id, encode,
            // and install the entry in both indexes. The write happens after.
            let armed = inner.with_shared(|s| {
                if s.state != LinkState::Connected {
                    return Err(TransportError::NotConnected);
                }
                let endpoint = s.endpoint.ok_or(TransportError::NotConnected)?;
                let (tx, rx) = oneshot::channel();
                if retry_count == 0 {
                    let msg_id = s.alloc_msg_id();
                    let frame =
                        codec::encode_data(endpoint, msg_id, payload).map_err(TransportError::Encode)?;
                    s.msg_index.insert(msg_id, correlation_id);
                    s.pending.insert(
                        correlation_id,
                        PendingSend {
                            msg_id,
                            sent_at: Instant::now(),
                            retry_count: 0,
                            signal: Some(tx),
                        },
                    );
                    Ok((frame, rx))
                } else {
                    // Re-arm the surviving entry; the msg_id is reused so a
                    // late ACK from an earlier attempt still matches.
                    let entry = s.pending.get_mut(&correlation_id).ok_or(
                        TransportError::AckTimeout {
                            reason: AckTimeoutReason::Elapsed,
                        },
                    )?;
                    entry.retry_count = retry_count;
                    entry.sent_at = Instant::now();
                    entry.signal = Some(tx);
                    let frame = codec::encode_data(endpoint, entry.msg_id, payload)
                        .map_err(TransportError::Encode)?;
                    Ok((frame, rx))
                }
            });

            let (frame, rx) = match armed {
                Ok(v) => v,
                Err(e @ TransportError::Encode(_)) => {
                    inner.remove_pending_entry(correlation_id);
                    guard.disarm();
                    return SendResult::failed(correlation_id, e, retry_count);
                }
                Err(e) => {
                    guard.disarm();
                    return SendResult::failed(correlation_id, e, retry_count);
                }
            };

            if let Err(e) = inner.link.send(&frame).await {
                warn!("data write failed ({e}); forcing reconnect");
                inner.trigger_reconnect("write_error");
                // The flush completes the waiter below with Reconnect.
            }

            match tokio::time::timeout(ack_timeout, rx).await {
                Ok(Ok(AckOutcome::Acked)) => {
                    guard.disarm();
                    return SendResult::ok(correlation_id, retry_count);
                }
                Ok(Ok(AckOutcome::Reconnect)) => {
                    guard.disarm();
                    return SendResult::failed(
                        correlation_id,
                        TransportError::AckTimeout {
                            reason: AckTimeoutReason::Reconnect,
                        },
                        retry_count,
                    );
                }
                Ok(Ok(AckOutcome::Shutdown)) => {
                    guard.disarm();
                    return SendResult::failed(
                        correlation_id,
                        TransportError::Abandoned {
                            reason: AbandonReason::Shutdown,
                        },
                        retry_count,
                    );
                }
                Ok(Ok(AckOutcome::Stale)) => {
                    guard.disarm();
                    return SendResult::failed(
                        correlation_id,
                        TransportError::Abandoned {
                            reason: AbandonReason::Stale,
                        },
                        retry_count,
                    );
                }
                Ok(Err(_)) => {
                    // Signal dropped without an outcome; the entry is gone.
                    guard.disarm();
                    return SendResult::failed(
                        correlation_id,
                        TransportError::AckTimeout {
                            reason: AckTimeoutReason::Elapsed,
                        },
                        retry_count,
                    );
                }
                Err(_elapsed) => {
                    inner.metrics.inc_ack_timeout();
                    if retry_count >= max_retries {
                        inner.remove_pending_entry(correlation_id);
                        inner.metrics.inc_abandoned(AbandonReason::AckTimeout);
                        guard.disarm();
                        return SendResult::failed(
                            correlation_id,
                            TransportError::AckTimeout {
                                reason: AckTimeoutReason::Elapsed,
                            },
                            retry_count,
                        );
                    }
                    retry_count += 1;
                    inner.metrics.inc_retry_attempt();
                    tokio::time::sleep(inner.policy.delay(retry_count as u32)).await;
                }
            }
        }
    }

    /// Sends a FIFO-acknowledged packet (0x83 status or 0x43 bulk status) and
    /// waits for its ACK in submission order. Higher-level device operations
    /// build on this primitive.
    pub async fn send_with_ack(&self, kind: u8, payload: &[u8]) -> SendResult {
        if !matches!(kind, packet::STATUS | packet::BULK_STATUS) {
            return SendResult::failed(
                Uuid::now_v7(),
                TransportError::Encode(WireError::UnknownKind(kind)),
                0,
            );
        }
        fifo_roundtrip(
            &self.inner,
            kind,
            payload,
            self.inner.opts.ack_timeout(),
            self.inner.opts.max_retries,
        )
        .await
    }

    /// Delivers the next inbound data packet.
    ///
    /// Emits the mapped ACK whether or not the packet is a duplicate (the
    /// responder is idempotent), then either returns the packet or raises
    /// [`TransportError::DuplicatePacket`]; callers iterate again for the
    /// next non-duplicate. Packet kinds without an ACK mapping are delivered
    /// as-is.
    pub async fn recv_reliable(&self) -> Result<TrackedPacket, TransportError> {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown_rx();
        if *shutdown.borrow() {
            return Err(TransportError::Closed);
        }

        let pkt = {
            let mut rx = inner.data_rx.lock().await;
            tokio::select! {
                maybe = rx.recv() => maybe.ok_or(TransportError::Closed)?,
                _ = shutdown.changed() => return Err(TransportError::Closed),
            }
        };

        let recv_time = Instant::now();
        let correlation_id = Uuid::now_v7();
        let key = dedup_key(&pkt);
        let fresh = {
            let mut cache = match inner.dedup.lock() {
                Ok(cache) => cache,
                Err(poisoned) => poisoned.into_inner(),
            };
            let evictions_before = cache.evictions();
            let inserted = cache.insert(&key, correlation_id);
            inner
                .metrics
                .add_dedup_evictions(cache.evictions() - evictions_before);
            inner.metrics.set_dedup_size(cache.len());
            inserted
        };

        if let Some(ack_kind) = packet::ack_for(pkt.kind) {
            let endpoint = pkt.endpoint.or_else(|| inner.with_shared(|s| s.endpoint));
            match endpoint {
                Some(endpoint) => match codec::encode_ack(ack_kind, endpoint, pkt.msg_id) {
                    Ok(frame) => {
                        if let Err(e) = inner.link.send(&frame).await {
                            warn!("failed to emit {ack_kind:#04x} ack: {e}");
                        }
                    }
                    Err(e) => warn!("could not encode {ack_kind:#04x} ack: {e}"),
                },
                None => warn!(
                    "no endpoint known for inbound {:#04x}; ack suppressed",
                    pkt.kind
                ),
            }
        }

        if !fresh {
            inner.metrics.inc_dedup_hit();
            inner.metrics.inc_idempotent_drop();
            trace!("duplicate inbound {:#04x} dropped ({key})", pkt.kind);
            return Err(TransportError::DuplicatePacket { key });
        }

        Ok(TrackedPacket {
            packet: pkt,
            correlation_id,
            recv_time,
            dedup_key: key,
        })
    }

    /// Stops the transport: cancels tasks in the documented order (router,
    /// then reconnect, then cleanup), fails in-flight waiters with
    /// `Abandoned{shutdown}` and closes the link.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let _ = inner.shutdown_tx.send(true);
        inner.abort_session_tasks();
        let (reconnect, cleanup) = inner.with_tasks(|t| (t.reconnect.take(), t.cleanup.take()));
        if let Some(handle) = reconnect {
            handle.abort();
        }
        if let Some(handle) = cleanup {
            handle.abort();
        }
        // State flips before the flush so a retrying waiter that re-arms
        // concurrently observes Disconnected instead of re-inserting.
        inner.with_shared(|s| s.state = LinkState::Disconnected);
        inner.metrics.set_state(LinkState::Disconnected);
        inner.flush_in_flight(AckOutcome::Shutdown);
        inner.link.close().await;
        debug!("transport stopped");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Same shutdown order as stop(), minus the async link close; dropping
        // the runtime's handles closes the socket.
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.abort_session_tasks();
        let (reconnect, cleanup) = self
            .inner
            .with_tasks(|t| (t.reconnect.take(), t.cleanup.take()));
        if let Some(handle) = reconnect {
            handle.abort();
        }
        if let Some(handle) = cleanup {
            handle.abort();
        }
        self.inner.with_shared(|s| s.state = LinkState::Disconnected);
        self.inner.metrics.set_state(LinkState::Disconnected);
        self.inner.flush_in_flight(AckOutcome::Shutdown);
    }
}

/// Sends one FIFO-acknowledged request and awaits its ACK, retrying like the
/// reliable path. The entry is enqueued before the wire write and keeps its
/// queue position across retries.
pub(crate) async fn fifo_roundtrip(
    inner: &Arc<Inner>,
    kind: u8,
    payload: &[u8],
    wait: Duration,
    max_retries: u16,
) -> SendResult {
    let correlation_id = Uuid::now_v7();
    let Some(ack_kind) = packet::ack_for(kind) else {
        return SendResult::failed(
            correlation_id,
            TransportError::Encode(WireError::UnknownKind(kind)),
            0,
        );
    };
    let mut retry_count: u16 = 0;
    let mut guard = PendingGuard::new(Arc::clone(inner), correlation_id);

    loop {
        let armed = inner.with_shared(|s| {
            if s.state != LinkState::Connected {
                return Err(TransportError::NotConnected);
            }
            let endpoint = s.endpoint.ok_or(TransportError::NotConnected)?;
            let frame = match kind {
                packet::HEARTBEAT => codec::encode_heartbeat(endpoint),
                packet::STATUS | packet::BULK_STATUS => {
                    codec::encode_payload_packet(kind, endpoint, payload)
                }
                other => Err(WireError::UnknownKind(other)),
            }
            .map_err(TransportError::Encode)?;
            let (tx, rx) = oneshot::channel();
            if retry_count == 0 {
                s.fifo.entry(ack_kind).or_default().push_back(FifoPending {
                    correlation_id,
                    sent_at: Instant::now(),
                    retry_count: 0,
                    signal: Some(tx),
                });
            } else {
                let entry = s
                    .fifo
                    .get_mut(&ack_kind)
                    .and_then(|q| q.iter_mut().find(|e| e.correlation_id == correlation_id))
                    .ok_or(TransportError::AckTimeout {
                        reason: AckTimeoutReason::Elapsed,
                    })?;
                entry.retry_count = retry_count;
                entry.sent_at = Instant::now();
                entry.signal = Some(tx);
            }
            Ok((frame, rx))
        });

        let (frame, rx) = match armed {
            Ok(v) => v,
            Err(e) => {
                guard.disarm();
                return SendResult::failed(correlation_id, e, retry_count);
            }
        };

        if let Err(e) = inner.link.send(&frame).await {
            warn!("{kind:#04x} write failed ({e}); forcing reconnect");
            inner.trigger_reconnect("write_error");
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(AckOutcome::Acked)) => {
                guard.disarm();
                return SendResult::ok(correlation_id, retry_count);
            }
            Ok(Ok(AckOutcome::Reconnect)) => {
                guard.disarm();
                return SendResult::failed(
                    correlation_id,
                    TransportError::AckTimeout {
                        reason: AckTimeoutReason::Reconnect,
                    },
                    retry_count,
                );
            }
            Ok(Ok(AckOutcome::Shutdown)) => {
                guard.disarm();
                return SendResult::failed(
                    correlation_id,
                    TransportError::Abandoned {
                        reason: AbandonReason::Shutdown,
                    },
                    retry_count,
                );
            }
            Ok(Ok(AckOutcome::Stale)) => {
                guard.disarm();
                return SendResult::failed(
                    correlation_id,
                    TransportError::Abandoned {
                        reason: AbandonReason::Stale,
                    },
                    retry_count,
                );
            }
            Ok(Err(_)) => {
                guard.disarm();
                return SendResult::failed(
                    correlation_id,
                    TransportError::AckTimeout {
                        reason: AckTimeoutReason::Elapsed,
                    },
                    retry_count,
                );
            }
            Err(_elapsed) => {
                inner.metrics.inc_ack_timeout();
                if retry_count >= max_retries {
                    inner.remove_fifo_entry(correlation_id);
                    inner.metrics.inc_abandoned(AbandonReason::AckTimeout);
                    guard.disarm();
                    return SendResult::failed(
                        correlation_id,
                        TransportError::AckTimeout {
                            reason: AckTimeoutReason::Elapsed,
                        },
                        retry_count,
                    );
                }
                retry_count += 1;
                inner.metrics.inc_retry_attempt();
                tokio::time::sleep(inner.policy.delay(retry_count as u32)).await;
            }
        }
    }
}

/// Spawns the safety-net sweep: finalizes pending entries that outlived their
/// whole retry budget and drops expired dedup entries. The waiter's own
/// timeout is authoritative; this only catches leaks.
pub(crate) fn spawn_cleanup(inner: &Arc<Inner>) {
    let already = inner.with_tasks(|t| t.cleanup.is_some());
    if already {
        return;
    }
    let inner = Arc::clone(inner);
    let mut shutdown = inner.shutdown_rx();
    let handle = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            let interval = inner.opts.cleanup_interval();
            let budget = inner.opts.ack_timeout() * (inner.opts.max_retries as u32 + 1)
                + inner.opts.backoff_cap();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                let stale = inner.with_shared(|s| {
                    let now = Instant::now();
                    let old: Vec<Uuid> = s
                        .pending
                        .iter()
                        .filter(|(_, e)| now.duration_since(e.sent_at) > budget)
                        .map(|(k, _)| *k)
                        .collect();
                    let mut signals = Vec::new();
                    for correlation_id in old {
                        if let Some(mut entry) = s.pending.remove(&correlation_id) {
                            s.msg_index.remove(&entry.msg_id);
                            if let Some(tx) = entry.signal.take() {
                                signals.push(tx);
                            }
                        }
                    }
                    for queue in s.fifo.values_mut() {
                        let mut kept = VecDeque::new();
                        while let Some(mut entry) = queue.pop_front() {
                            if now.duration_since(entry.sent_at) > budget {
                                if let Some(tx) = entry.signal.take() {
                                    signals.push(tx);
                                }
                            } else {
                                kept.push_back(entry);
                            }
                        }
                        *queue = kept;
                    }
                    signals
                });
                let count = stale.len();
                for tx in stale {
                    let _ = tx.send(AckOutcome::Stale);
                }
                for _ in 0..count {
                    inner.metrics.inc_abandoned(AbandonReason::Stale);
                }
                if count > 0 {
                    warn!("cleanup finalized {count} stale pending entries");
                }

                let (removed, size) = {
                    let mut cache = match inner.dedup.lock() {
                        Ok(cache) => cache,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    (cache.sweep_expired(), cache.len())
                };
                inner.metrics.set_dedup_size(size);
                if removed > 0 {
                    trace!("dedup sweep removed {removed} expired entries");
                }
            }
        }
    });
    inner.with_tasks(|t| t.cleanup = Some(handle));
}
