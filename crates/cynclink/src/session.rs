//! Connection lifecycle: handshake, single-reader packet router, heartbeat
//! and reconnection.
//!
//! Each long-lived concern runs as an independent task with explicit
//! cancellation through the transport's shutdown signal plus abortable join
//! handles. The packet router is the sole reader of the link for the lifetime
//! of a connection; its reads are bounded by a short poll timeout so
//! cancellation is honored within one poll period.

use crate::error::TransportError;
use crate::link::LinkError;
use crate::transport::{AckOutcome, Inner, fifo_roundtrip};
use cynclink_wire::{Endpoint, Framer, Packet, codec, packet};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::Instant;

/// Connection state, serialized by the state lock and mirrored into the
/// `connection_state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl LinkState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::Reconnecting,
            _ => LinkState::Disconnected,
        }
    }
}

/// Drives the full establish sequence for the initial connect, retrying per
/// the backoff policy up to `max_retries` before surfacing the last error.
pub(crate) async fn establish_with_retries(inner: &Arc<Inner>) -> Result<(), TransportError> {
    let max_retries = inner.opts.max_retries;
    let mut attempt: u16 = 0;
    loop {
        attempt += 1;
        match establish_once(inner).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("connect attempt {attempt} failed: {e}");
                inner.link.close().await;
                if attempt > max_retries {
                    return Err(e);
                }
                tokio::time::sleep(inner.policy.delay(attempt as u32)).await;
            }
        }
    }
}

/// One establish pass: open the link, run the raw handshake, transition to
/// Connected and spawn the router and heartbeat tasks.
pub(crate) async fn establish_once(inner: &Arc<Inner>) -> Result<(), TransportError> {
    let (endpoint, auth) = inner.with_shared(|s| (s.endpoint, s.auth.clone()));
    let endpoint = endpoint.ok_or(TransportError::NotConnected)?;

    inner.link.connect().await?;
    let framer = handshake(inner, endpoint, &auth).await?;

    inner.with_shared(|s| s.state = LinkState::Connected);
    inner.metrics.set_state(LinkState::Connected);
    spawn_router(inner, framer);
    spawn_heartbeat(inner);
    info!("connected to endpoint {}", hex::encode(endpoint));
    Ok(())
}

/// Raw 0x23/0x28 exchange on the bare connection, before the router runs.
///
/// Returns the framer so buffered bytes past the 0x28 are not lost; packets
/// decoded from the same chunk are dispatched before the router takes over.
async fn handshake(
    inner: &Arc<Inner>,
    endpoint: Endpoint,
    auth: &[u8],
) -> Result<Framer, TransportError> {
    let frame = codec::encode_handshake(endpoint, auth).map_err(TransportError::Encode)?;
    inner.link.send(&frame).await?;
    trace!("sent 0x23 handshake ({} auth bytes)", auth.len());

    let deadline = Instant::now() + inner.opts.handshake_timeout();
    let mut framer = Framer::new();
    let mut trailing: Vec<Packet> = Vec::new();

    loop {
        let now = Instant::now();
        if now >= deadline {
            inner.metrics.inc_handshake(false);
            return Err(TransportError::Handshake {
                reason: "timed out waiting for 0x28".to_string(),
            });
        }
        let wait = (deadline - now).min(inner.opts.read_poll());

        match inner.link.recv(inner.opts.recv_buffer_len, wait).await {
            Ok(chunk) => {
                let frames = framer.feed(&chunk).map_err(|e| {
                    inner.metrics.inc_handshake(false);
                    TransportError::Framing(e)
                })?;
                let mut acked = false;
                for raw in frames {
                    match codec::decode_packet(raw) {
                        Ok(pkt) if !acked && pkt.kind == packet::HANDSHAKE_ACK => acked = true,
                        Ok(pkt) => trailing.push(pkt),
                        Err(e) => {
                            inner.metrics.inc_handshake(false);
                            return Err(TransportError::Decode(e));
                        }
                    }
                }
                if acked {
                    inner.metrics.inc_handshake(true);
                    debug!("handshake complete for endpoint {}", hex::encode(endpoint));
                    for pkt in trailing {
                        route_packet(inner, pkt);
                    }
                    return Ok(framer);
                }
            }
            Err(LinkError::Timeout) => continue,
            Err(e) => {
                inner.metrics.inc_handshake(false);
                return Err(TransportError::Link(e));
            }
        }
    }
}

/// Routes one decoded packet: ACK kinds to the resolver, everything else
/// (data and unknown kinds alike) to the consumer mailbox.
fn route_packet(inner: &Arc<Inner>, pkt: Packet) {
    if packet::is_ack(pkt.kind) {
        inner.resolve_ack(&pkt);
        return;
    }
    if !packet::is_known(pkt.kind) {
        debug!("unknown packet kind {:#04x}; forwarding opaquely", pkt.kind);
    }
    if inner.data_tx.send(pkt).is_err() {
        warn!("data queue closed; dropping inbound packet");
    }
}

/// Spawns the packet router: the single reader of the link.
///
/// Framing or decode failures are fatal to the connection and trigger
/// reconnect; read timeouts just re-poll so cancellation stays prompt.
pub(crate) fn spawn_router(inner: &Arc<Inner>, mut framer: Framer) {
    let inner = Arc::clone(inner);
    let mut shutdown = inner.shutdown_rx();
    let handle = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            let poll = inner.opts.read_poll();
            let max_len = inner.opts.recv_buffer_len;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = inner.link.recv(max_len, poll) => match result {
                        Ok(chunk) => {
                            let frames = match framer.feed(&chunk) {
                                Ok(frames) => frames,
                                Err(e) => {
                                    error!("framing failure: {e}");
                                    inner.trigger_reconnect("framing_error");
                                    break;
                                }
                            };
                            let mut fatal = false;
                            for raw in frames {
                                match codec::decode_packet(raw) {
                                    Ok(pkt) => route_packet(&inner, pkt),
                                    Err(e) => {
                                        error!("fatal decode failure: {e}");
                                        inner.trigger_reconnect("decode_error");
                                        fatal = true;
                                        break;
                                    }
                                }
                            }
                            if fatal {
                                break;
                            }
                        }
                        Err(LinkError::Timeout) => continue,
                        Err(e) => {
                            warn!("link read failed: {e}");
                            inner.trigger_reconnect("read_error");
                            break;
                        }
                    }
                }
            }
            trace!("packet router stopped");
        }
    });
    inner.set_router_task(handle);
}

/// Spawns the heartbeat: emit 0xD3 every interval and await the FIFO 0xD8
/// within the heartbeat timeout. A miss forces reconnect.
pub(crate) fn spawn_heartbeat(inner: &Arc<Inner>) {
    let inner = Arc::clone(inner);
    let mut shutdown = inner.shutdown_rx();
    let handle = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            let interval = inner.opts.heartbeat_interval();
            let wait = inner.opts.heartbeat_timeout();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                let result = fifo_roundtrip(&inner, packet::HEARTBEAT, &[], wait, 0).await;
                if !result.success {
                    inner.metrics.inc_heartbeat(false);
                    warn!("heartbeat ack missed; forcing reconnect");
                    inner.trigger_reconnect("heartbeat_miss");
                    break;
                }
            }
            trace!("heartbeat task stopped");
        }
    });
    inner.set_heartbeat_task(handle);
}

/// Spawns the reconnect manager. On a trigger it tears the session down
/// (router and heartbeat cancelled, link closed, in-flight waiters flushed
/// with the reconnect outcome) and re-runs the establish sequence under
/// backoff until it succeeds or the transport shuts down.
pub(crate) fn spawn_reconnect_manager(inner: &Arc<Inner>) {
    let Some(mut triggers) = inner.take_reconnect_rx() else {
        return;
    };
    let inner = Arc::clone(inner);
    let mut shutdown = inner.shutdown_rx();
    let handle = tokio::spawn({
        let inner = Arc::clone(&inner);
        async move {
            loop {
                let reason = tokio::select! {
                    _ = shutdown.changed() => break,
                    trigger = triggers.recv() => match trigger {
                        Some(reason) => reason,
                        None => break,
                    },
                };
                if *shutdown.borrow() {
                    break;
                }

                let proceed = inner.with_shared(|s| {
                    if matches!(s.state, LinkState::Connected | LinkState::Connecting) {
                        s.state = LinkState::Reconnecting;
                        true
                    } else {
                        false
                    }
                });
                if !proceed {
                    continue;
                }
                inner.metrics.set_state(LinkState::Reconnecting);
                inner.metrics.inc_reconnection();
                info!("reconnecting (reason: {reason})");

                inner.abort_session_tasks();
                inner.link.close().await;
                inner.flush_in_flight(AckOutcome::Reconnect);

                let mut attempt: u32 = 0;
                loop {
                    if *shutdown.borrow() {
                        return;
                    }
                    attempt += 1;
                    let delay = inner.policy.delay(attempt);
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    inner.with_shared(|s| s.state = LinkState::Connecting);
                    inner.metrics.set_state(LinkState::Connecting);
                    match establish_once(&inner).await {
                        Ok(()) => {
                            info!("reconnected after {attempt} attempt(s)");
                            break;
                        }
                        Err(e) => {
                            warn!("reconnect attempt {attempt} failed: {e}");
                            inner.link.close().await;
                            inner.with_shared(|s| s.state = LinkState::Reconnecting);
                            inner.metrics.set_state(LinkState::Reconnecting);
                        }
                    }
                }

                // Stale triggers from the torn-down session would bounce the
                // fresh connection; drop them.
                while triggers.try_recv().is_ok() {}
            }
            trace!("reconnect manager stopped");
        }
    });
    inner.set_reconnect_task(handle);
}
