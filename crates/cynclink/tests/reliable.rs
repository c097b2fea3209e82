//! End-to-end transport scenarios against a scripted in-memory link.

use async_trait::async_trait;
use bytes::Bytes;
use cynclink::{
    AbandonReason, AckTimeoutReason, Link, LinkError, LinkState, Transport, TransportError,
    TransportOptions,
};
use cynclink_log::CyncLogger;
use cynclink_wire::{Endpoint, codec, packet};
use log::Level;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const ENDPOINT: Endpoint = [0x01, 0x02, 0x03, 0x04, 0x05];
const AUTH: [u8; 2] = [0xAA, 0xBB];

fn init_logging() {
    let _ = CyncLogger::init(Level::Warn);
}

/// How the scripted peer responds to what the transport writes.
#[derive(Debug, Clone)]
struct Behavior {
    /// ACK the nth 0x23 (1-based); `None` never acks the handshake.
    handshake_ack_on_attempt: Option<u32>,
    /// ACK the nth attempt of each msg_id (1-based); `None` never acks data.
    data_ack_on_attempt: Option<u32>,
    ack_heartbeat: bool,
    /// Auto-ACK outbound 0x83/0x43.
    ack_status: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            handshake_ack_on_attempt: Some(1),
            data_ack_on_attempt: Some(1),
            ack_heartbeat: true,
            ack_status: true,
        }
    }
}

/// In-memory scripted peer: captures outbound frames, auto-acks per the
/// behavior, lets tests inject inbound frames, and counts concurrent readers.
struct MockLink {
    open: AtomicBool,
    connects: AtomicU32,
    handshake_attempts: AtomicU32,
    data_attempts: Mutex<HashMap<u16, u32>>,
    behavior: Mutex<Behavior>,
    inbound: Mutex<Vec<Bytes>>,
    notify: Notify,
    sent: Mutex<Vec<Bytes>>,
    readers: AtomicUsize,
    max_readers: AtomicUsize,
}

impl MockLink {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(false),
            connects: AtomicU32::new(0),
            handshake_attempts: AtomicU32::new(0),
            data_attempts: Mutex::new(HashMap::new()),
            behavior: Mutex::new(behavior),
            inbound: Mutex::new(Vec::new()),
            notify: Notify::new(),
            sent: Mutex::new(Vec::new()),
            readers: AtomicUsize::new(0),
            max_readers: AtomicUsize::new(0),
        })
    }

    fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Queues an inbound frame as if the peer had sent it.
    fn inject(&self, frame: Bytes) {
        self.inbound.lock().unwrap().push(frame);
        self.notify.notify_one();
    }

    fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_of_kind(&self, kind: u8) -> Vec<Bytes> {
        self.sent_frames()
            .into_iter()
            .filter(|f| !f.is_empty() && f[0] == kind)
            .collect()
    }

    fn max_concurrent_readers(&self) -> usize {
        self.max_readers.load(Ordering::SeqCst)
    }

    fn respond(&self, frame: &[u8]) {
        let kind = frame[0];
        let behavior = self.behavior.lock().unwrap().clone();
        match kind {
            packet::HANDSHAKE => {
                let attempt = self.handshake_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if behavior.handshake_ack_on_attempt.is_some_and(|n| attempt >= n) {
                    self.inject(codec::encode_ack(packet::HANDSHAKE_ACK, ENDPOINT, None).unwrap());
                }
            }
            packet::DATA => {
                let msg_id = u16::from_be_bytes([frame[10], frame[11]]);
                let mut attempts = self.data_attempts.lock().unwrap();
                let count = attempts.entry(msg_id).or_insert(0);
                *count += 1;
                if behavior.data_ack_on_attempt.is_some_and(|n| *count >= n) {
                    self.inject(
                        codec::encode_ack(packet::DATA_ACK, ENDPOINT, Some(msg_id)).unwrap(),
                    );
                }
            }
            packet::HEARTBEAT => {
                if behavior.ack_heartbeat {
                    self.inject(codec::encode_ack(packet::HEARTBEAT_ACK, ENDPOINT, None).unwrap());
                }
            }
            packet::STATUS => {
                if behavior.ack_status {
                    self.inject(codec::encode_ack(packet::STATUS_ACK, ENDPOINT, None).unwrap());
                }
            }
            packet::BULK_STATUS => {
                if behavior.ack_status {
                    self.inject(
                        codec::encode_ack(packet::BULK_STATUS_ACK, ENDPOINT, None).unwrap(),
                    );
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Link for MockLink {
    async fn connect(&self) -> Result<(), LinkError> {
        self.open.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: &[u8]) -> Result<(), LinkError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(LinkError::NotOpen);
        }
        self.sent
            .lock()
            .unwrap()
            .push(Bytes::copy_from_slice(frame));
        self.respond(frame);
        Ok(())
    }

    async fn recv(&self, _max_len: usize, wait: Duration) -> Result<Bytes, LinkError> {
        let depth = self.readers.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_readers.fetch_max(depth, Ordering::SeqCst);
        let result = async {
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                if let Some(frame) = {
                    let mut queue = self.inbound.lock().unwrap();
                    if queue.is_empty() {
                        None
                    } else {
                        Some(queue.remove(0))
                    }
                } {
                    return Ok(frame);
                }
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Err(LinkError::Timeout);
                }
                let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
            }
        }
        .await;
        self.readers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Fast timeouts so scenarios finish in tens of milliseconds.
fn fast_options() -> TransportOptions {
    TransportOptions {
        measured_p99_ms: 20.0, // ack_timeout 50 ms
        max_retries: 3,
        heartbeat_interval_ms: 60_000,
        heartbeat_timeout_floor_ms: 100,
        read_poll_ms: 10,
        initial_msg_id: Some(0x1234),
        ..Default::default()
    }
}

async fn connected(behavior: Behavior, opts: TransportOptions) -> (Transport, Arc<MockLink>) {
    init_logging();
    let link = MockLink::new(behavior);
    let transport = Transport::new(link.clone(), opts);
    transport.connect(ENDPOINT, &AUTH).await.unwrap();
    assert_eq!(transport.state(), LinkState::Connected);
    (transport, link)
}

async fn wait_until(mut probe: impl FnMut() -> bool, patience: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + patience;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    probe()
}

// --- Scenarios ---

#[tokio::test]
async fn test_single_send_ack() {
    let (transport, link) = connected(Behavior::default(), fast_options()).await;

    let result = transport.send_reliable(&[0x01, 0x00]).await;
    assert!(result.success);
    assert_eq!(result.retry_count, 0);
    assert!(result.reason.is_none());

    // The wire frame carries the seeded msg_id at bytes [10..12].
    let data = link.sent_of_kind(packet::DATA);
    assert_eq!(data.len(), 1);
    assert_eq!(&data[0][10..12], &[0x12, 0x34]);
    assert_eq!(&data[0][12..], &[0x01, 0x00]);

    let snap = transport.metrics().snapshot();
    assert_eq!(snap.acks_matched, 1);
    assert_eq!(snap.ack_timeouts, 0);

    transport.stop().await;
}

#[tokio::test]
async fn test_retry_then_ack() {
    let behavior = Behavior {
        data_ack_on_attempt: Some(3),
        ..Default::default()
    };
    let (transport, link) = connected(behavior, fast_options()).await;

    let result = transport.send_reliable(&[0x02]).await;
    assert!(result.success);
    assert_eq!(result.retry_count, 2);

    // All three attempts reuse the same msg_id.
    let data = link.sent_of_kind(packet::DATA);
    assert_eq!(data.len(), 3);
    assert!(data.iter().all(|f| &f[10..12] == &data[0][10..12]));

    let snap = transport.metrics().snapshot();
    assert_eq!(snap.retry_attempts, 2);
    assert_eq!(snap.ack_timeouts, 2);
    assert_eq!(snap.acks_matched, 1);

    transport.stop().await;
}

#[tokio::test]
async fn test_abandon_after_retries_and_late_ack() {
    let behavior = Behavior {
        data_ack_on_attempt: None,
        ..Default::default()
    };
    let (transport, link) = connected(behavior, fast_options()).await;

    let result = transport.send_reliable(&[0x03]).await;
    assert!(!result.success);
    assert_eq!(result.retry_count, 3);
    assert!(matches!(
        result.reason,
        Some(TransportError::AckTimeout {
            reason: AckTimeoutReason::Elapsed
        })
    ));

    let snap = transport.metrics().snapshot();
    assert_eq!(snap.abandoned_ack_timeout, 1);
    assert_eq!(snap.ack_timeouts, 4);

    // An ACK arriving after abandonment no longer matches anything.
    let msg_id = {
        let data = link.sent_of_kind(packet::DATA);
        u16::from_be_bytes([data[0][10], data[0][11]])
    };
    link.inject(codec::encode_ack(packet::DATA_ACK, ENDPOINT, Some(msg_id)).unwrap());
    assert!(
        wait_until(
            || transport.metrics().snapshot().acks_late == 1,
            Duration::from_secs(1)
        )
        .await
    );

    transport.stop().await;
}

#[tokio::test]
async fn test_reconnect_fails_in_flight_send() {
    let behavior = Behavior {
        data_ack_on_attempt: None,
        ..Default::default()
    };
    let mut opts = fast_options();
    opts.measured_p99_ms = 80.0; // ack_timeout 200 ms: the fault lands mid-attempt
    opts.max_retries = 0;
    let (transport, link) = connected(behavior, opts).await;

    let send = tokio::spawn({
        let transport = Arc::new(transport);
        let t = Arc::clone(&transport);
        async move { (t.send_reliable(&[0x04]).await, transport) }
    });

    // Give the send time to hit the wire, then break the stream: an oversize
    // header is a fatal framing error and forces reconnect.
    assert!(
        wait_until(
            || !link.sent_of_kind(packet::DATA).is_empty(),
            Duration::from_secs(1)
        )
        .await
    );
    link.inject(Bytes::from_static(&[0x99, 0, 0, 0xFF, 0xFF]));

    let (result, transport) = send.await.unwrap();
    assert!(!result.success);
    assert!(matches!(
        result.reason,
        Some(TransportError::AckTimeout {
            reason: AckTimeoutReason::Reconnect
        })
    ));

    // The transport recovers on its own and a fresh send goes through.
    link.set_behavior(Behavior::default());
    assert!(
        wait_until(
            || transport.state() == LinkState::Connected,
            Duration::from_secs(2)
        )
        .await
    );
    let result = transport.send_reliable(&[0x05]).await;
    assert!(result.success);

    let snap = transport.metrics().snapshot();
    assert!(snap.reconnections >= 1);
    assert!(snap.handshakes_ok >= 2);

    transport.stop().await;
}

#[tokio::test]
async fn test_heartbeat_miss_triggers_reconnect() {
    let behavior = Behavior {
        ack_heartbeat: false,
        ..Default::default()
    };
    let mut opts = fast_options();
    opts.measured_p99_ms = 4.0; // ack_timeout 10 ms
    opts.heartbeat_interval_ms = 25;
    opts.heartbeat_timeout_floor_ms = 40;
    let (transport, link) = connected(behavior, opts).await;

    assert!(
        wait_until(
            || transport.metrics().snapshot().heartbeats_missed >= 1,
            Duration::from_secs(2)
        )
        .await
    );

    // Let the peer behave again; the reconnect loop should land Connected.
    link.set_behavior(Behavior::default());
    assert!(
        wait_until(
            || transport.state() == LinkState::Connected,
            Duration::from_secs(2)
        )
        .await
    );
    let snap = transport.metrics().snapshot();
    assert!(snap.reconnections >= 1);

    let result = transport.send_reliable(&[0x06]).await;
    assert!(result.success);

    transport.stop().await;
}

#[tokio::test]
async fn test_duplicate_receive() {
    let (transport, link) = connected(Behavior::default(), fast_options()).await;
    let endpoint = [0x0A, 0x0B, 0x0C, 0x0D, 0x0E];
    let status = codec::encode_payload_packet(packet::STATUS, endpoint, &[0x11, 0x22]).unwrap();

    let acks_before = link.sent_of_kind(packet::STATUS_ACK).len();
    link.inject(status.clone());
    link.inject(status);

    let first = transport.recv_reliable().await.unwrap();
    assert_eq!(first.packet.kind, packet::STATUS);
    assert_eq!(first.packet.endpoint, Some(endpoint));
    assert_eq!(&first.packet.payload[..], &[0x11, 0x22]);

    let second = transport.recv_reliable().await;
    assert!(matches!(
        second,
        Err(TransportError::DuplicatePacket { .. })
    ));

    // Both copies were ACKed: the responder is idempotent.
    assert_eq!(link.sent_of_kind(packet::STATUS_ACK).len(), acks_before + 2);
    let snap = transport.metrics().snapshot();
    assert_eq!(snap.dedup_hits, 1);
    assert_eq!(snap.idempotent_drops, 1);

    transport.stop().await;
}

#[tokio::test]
async fn test_replay_idempotence() {
    let (transport, link) = connected(Behavior::default(), fast_options()).await;
    let status = codec::encode_payload_packet(packet::STATUS, ENDPOINT, &[0x77]).unwrap();

    for _ in 0..3 {
        link.inject(status.clone());
    }
    let mut delivered = 0;
    let mut duplicates = 0;
    for _ in 0..3 {
        match transport.recv_reliable().await {
            Ok(_) => delivered += 1,
            Err(TransportError::DuplicatePacket { .. }) => duplicates += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(delivered, 1);
    assert_eq!(duplicates, 2);
    assert_eq!(link.sent_of_kind(packet::STATUS_ACK).len(), 3);

    transport.stop().await;
}

#[tokio::test]
async fn test_fifo_ack_ordering_across_kinds() {
    let behavior = Behavior {
        ack_status: false,
        ..Default::default()
    };
    let (transport, link) = connected(behavior, fast_options()).await;
    let transport = Arc::new(transport);

    let status = tokio::spawn({
        let t = Arc::clone(&transport);
        async move { t.send_with_ack(packet::STATUS, &[0x01]).await }
    });
    let bulk = tokio::spawn({
        let t = Arc::clone(&transport);
        async move { t.send_with_ack(packet::BULK_STATUS, &[0x02]).await }
    });

    assert!(
        wait_until(
            || {
                !link.sent_of_kind(packet::STATUS).is_empty()
                    && !link.sent_of_kind(packet::BULK_STATUS).is_empty()
            },
            Duration::from_secs(1)
        )
        .await
    );

    // ACKs arrive in the reverse of the send order; each request still
    // completes because the queues are per ACK kind.
    link.inject(codec::encode_ack(packet::BULK_STATUS_ACK, ENDPOINT, None).unwrap());
    link.inject(codec::encode_ack(packet::STATUS_ACK, ENDPOINT, None).unwrap());

    assert!(status.await.unwrap().success);
    assert!(bulk.await.unwrap().success);

    transport.stop().await;
}

#[tokio::test]
async fn test_fifo_same_kind_resolves_in_order() {
    let behavior = Behavior {
        ack_status: false,
        ..Default::default()
    };
    let (transport, link) = connected(behavior, fast_options()).await;
    let transport = Arc::new(transport);

    // Identify each request on the wire by its payload byte so retries of
    // the first request cannot be mistaken for the second one.
    let on_wire = |link: &MockLink, marker: u8| {
        link.sent_of_kind(packet::STATUS)
            .iter()
            .any(|f| f.last() == Some(&marker))
    };

    let first = tokio::spawn({
        let t = Arc::clone(&transport);
        async move { t.send_with_ack(packet::STATUS, &[0x01]).await }
    });
    assert!(wait_until(|| on_wire(link.as_ref(), 0x01), Duration::from_secs(1)).await);
    let second = tokio::spawn({
        let t = Arc::clone(&transport);
        async move { t.send_with_ack(packet::STATUS, &[0x02]).await }
    });
    assert!(wait_until(|| on_wire(link.as_ref(), 0x02), Duration::from_secs(1)).await);

    // One ACK resolves only the head of the queue.
    link.inject(codec::encode_ack(packet::STATUS_ACK, ENDPOINT, None).unwrap());
    let first_result = first.await.unwrap();
    assert!(first_result.success);
    assert!(!second.is_finished());

    link.inject(codec::encode_ack(packet::STATUS_ACK, ENDPOINT, None).unwrap());
    assert!(second.await.unwrap().success);

    transport.stop().await;
}

// --- Properties ---

#[tokio::test]
async fn test_concurrent_sends_distinct_msg_ids() {
    let mut opts = fast_options();
    opts.initial_msg_id = Some(0);
    let (transport, link) = connected(Behavior::default(), opts).await;
    let transport = Arc::new(transport);

    let mut handles = Vec::new();
    for i in 0..10u8 {
        let t = Arc::clone(&transport);
        handles.push(tokio::spawn(async move { t.send_reliable(&[i]).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    let mut msg_ids: Vec<u16> = link
        .sent_of_kind(packet::DATA)
        .iter()
        .map(|f| u16::from_be_bytes([f[10], f[11]]))
        .collect();
    msg_ids.sort_unstable();
    msg_ids.dedup();
    assert_eq!(msg_ids, (0..10).collect::<Vec<u16>>());

    // The packet router is the sole reader of the link.
    assert_eq!(link.max_concurrent_readers(), 1);

    // Critical sections stay far under the 100 ms budget.
    let snap = transport.metrics().snapshot();
    assert!(snap.lock_hold_max < Duration::from_millis(100));

    transport.stop().await;
}

#[tokio::test]
async fn test_msg_id_wraparound() {
    let mut opts = fast_options();
    opts.initial_msg_id = Some(0xFFFF);
    let (transport, link) = connected(Behavior::default(), opts).await;

    assert!(transport.send_reliable(&[0x01]).await.success);
    assert!(transport.send_reliable(&[0x02]).await.success);

    let ids: Vec<u16> = link
        .sent_of_kind(packet::DATA)
        .iter()
        .map(|f| u16::from_be_bytes([f[10], f[11]]))
        .collect();
    assert_eq!(ids, vec![0xFFFF, 0x0000]);

    transport.stop().await;
}

#[tokio::test]
async fn test_unknown_kind_forwarded_without_ack() {
    let (transport, link) = connected(Behavior::default(), fast_options()).await;

    let frames_before = link.sent_frames().len();
    link.inject(Bytes::from_static(&[0x99, 0, 0, 0, 2, 0xCA, 0xFE]));

    let tracked = transport.recv_reliable().await.unwrap();
    assert_eq!(tracked.packet.kind, 0x99);
    assert_eq!(&tracked.packet.payload[..], &[0xCA, 0xFE]);

    // No ACK mapping for 0x99: nothing new was written.
    assert_eq!(link.sent_frames().len(), frames_before);

    transport.stop().await;
}

#[tokio::test]
async fn test_inbound_data_acked_with_echoed_msg_id() {
    let (transport, link) = connected(Behavior::default(), fast_options()).await;

    link.inject(codec::encode_data(ENDPOINT, 0x4242, &[0x0F]).unwrap());
    let tracked = transport.recv_reliable().await.unwrap();
    assert_eq!(tracked.packet.msg_id, Some(0x4242));

    assert!(
        wait_until(
            || !link.sent_of_kind(packet::DATA_ACK).is_empty(),
            Duration::from_secs(1)
        )
        .await
    );
    let acks = link.sent_of_kind(packet::DATA_ACK);
    assert_eq!(&acks[0][10..12], &[0x42, 0x42]);

    transport.stop().await;
}

#[tokio::test]
async fn test_send_before_connect_returns_not_connected() {
    init_logging();
    let link = MockLink::new(Behavior::default());
    let transport = Transport::new(link, fast_options());

    let result = transport.send_reliable(&[0x01]).await;
    assert!(!result.success);
    assert!(matches!(result.reason, Some(TransportError::NotConnected)));
    assert_eq!(result.retry_count, 0);
}

#[tokio::test]
async fn test_handshake_retry_after_failure() {
    init_logging();
    let behavior = Behavior {
        handshake_ack_on_attempt: Some(2),
        ..Default::default()
    };
    let link = MockLink::new(behavior);
    let transport = Transport::new(link.clone(), fast_options());

    transport.connect(ENDPOINT, &AUTH).await.unwrap();
    assert_eq!(transport.state(), LinkState::Connected);

    let snap = transport.metrics().snapshot();
    assert_eq!(snap.handshakes_failed, 1);
    assert_eq!(snap.handshakes_ok, 1);

    // The handshake frame carries endpoint then the auth bytes.
    let hs = link.sent_of_kind(packet::HANDSHAKE);
    assert_eq!(hs.len(), 2);
    assert_eq!(&hs[0][5..10], &ENDPOINT);
    assert_eq!(&hs[0][10..], &AUTH);

    transport.stop().await;
}

#[tokio::test]
async fn test_handshake_gives_up_past_cap() {
    init_logging();
    let behavior = Behavior {
        handshake_ack_on_attempt: None,
        ..Default::default()
    };
    let mut opts = fast_options();
    opts.measured_p99_ms = 8.0; // handshake_timeout 50 ms
    opts.max_retries = 1;
    let link = MockLink::new(behavior);
    let transport = Transport::new(link, opts);

    let result = transport.connect(ENDPOINT, &AUTH).await;
    assert!(matches!(result, Err(TransportError::Handshake { .. })));
    assert_eq!(transport.state(), LinkState::Disconnected);
    assert_eq!(transport.metrics().snapshot().handshakes_failed, 2);
}

#[tokio::test]
async fn test_stop_abandons_in_flight_send() {
    let behavior = Behavior {
        data_ack_on_attempt: None,
        ..Default::default()
    };
    let mut opts = fast_options();
    opts.max_retries = 20;
    let (transport, link) = connected(behavior, opts).await;
    let transport = Arc::new(transport);

    let send = tokio::spawn({
        let t = Arc::clone(&transport);
        async move { t.send_reliable(&[0x08]).await }
    });
    assert!(
        wait_until(
            || !link.sent_of_kind(packet::DATA).is_empty(),
            Duration::from_secs(1)
        )
        .await
    );

    transport.stop().await;
    let result = send.await.unwrap();
    assert!(!result.success);
    assert!(matches!(
        result.reason,
        Some(TransportError::Abandoned {
            reason: AbandonReason::Shutdown
        }) | Some(TransportError::NotConnected)
    ));
    assert!(transport.metrics().snapshot().abandoned_shutdown >= 1);
}

#[tokio::test]
async fn test_cancelled_send_cleans_up() {
    let behavior = Behavior {
        data_ack_on_attempt: None,
        ..Default::default()
    };
    let mut opts = fast_options();
    opts.measured_p99_ms = 200.0; // long ack window so the drop hits mid-wait
    let (transport, link) = connected(behavior, opts).await;

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        transport.send_reliable(&[0x09]),
    )
    .await;
    assert!(result.is_err());

    assert!(
        wait_until(
            || transport.metrics().snapshot().abandoned_cancelled == 1,
            Duration::from_secs(1)
        )
        .await
    );

    // The entry is gone: the ACK for the cancelled msg_id is late.
    let msg_id = {
        let data = link.sent_of_kind(packet::DATA);
        u16::from_be_bytes([data[0][10], data[0][11]])
    };
    link.inject(codec::encode_ack(packet::DATA_ACK, ENDPOINT, Some(msg_id)).unwrap());
    assert!(
        wait_until(
            || transport.metrics().snapshot().acks_late == 1,
            Duration::from_secs(1)
        )
        .await
    );

    transport.stop().await;
}

#[tokio::test]
async fn test_orphan_fifo_ack_dropped_with_metric() {
    let (transport, link) = connected(Behavior::default(), fast_options()).await;

    link.inject(codec::encode_ack(packet::STATUS_ACK, ENDPOINT, None).unwrap());
    assert!(
        wait_until(
            || transport.metrics().snapshot().acks_orphan == 1,
            Duration::from_secs(1)
        )
        .await
    );

    transport.stop().await;
}

#[tokio::test]
async fn test_send_with_ack_rejects_unmapped_kind() {
    let (transport, _link) = connected(Behavior::default(), fast_options()).await;

    let result = transport.send_with_ack(packet::DATA, &[0x01]).await;
    assert!(!result.success);
    assert!(matches!(result.reason, Some(TransportError::Encode(_))));

    transport.stop().await;
}
