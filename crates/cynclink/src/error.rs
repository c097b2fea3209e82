use crate::link::LinkError;
use cynclink_wire::{Packet, WireError};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

/// Why an acknowledgement wait ended without the ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTimeoutReason {
    /// The wait simply elapsed.
    Elapsed,
    /// The connection dropped and in-flight waiters were flushed.
    Reconnect,
}

impl fmt::Display for AckTimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckTimeoutReason::Elapsed => write!(f, "timeout"),
            AckTimeoutReason::Reconnect => write!(f, "reconnect"),
        }
    }
}

/// Why a pending request was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// Every retry timed out.
    AckTimeout,
    /// The transport was stopped.
    Shutdown,
    /// The caller dropped the send future before resolution.
    Cancelled,
    /// The cleanup sweep finalized a stale entry.
    Stale,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::AckTimeout => write!(f, "ack_timeout"),
            AbandonReason::Shutdown => write!(f, "shutdown"),
            AbandonReason::Cancelled => write!(f, "cancelled"),
            AbandonReason::Stale => write!(f, "stale"),
        }
    }
}

/// Errors surfaced by the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport has no established connection.
    #[error("transport is not connected")]
    NotConnected,

    /// The 0x23/0x28 exchange failed past the retry cap.
    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    /// The byte stream could not be framed; fatal to the connection.
    #[error("framing failure: {0}")]
    Framing(#[source] WireError),

    /// A frame could not be decoded; fatal to the connection.
    #[error("packet decode failure: {0}")]
    Decode(#[source] WireError),

    /// No acknowledgement arrived in time.
    #[error("acknowledgement timed out ({reason})")]
    AckTimeout { reason: AckTimeoutReason },

    /// An identical packet was already received and delivered.
    #[error("duplicate packet ({key})")]
    DuplicatePacket { key: String },

    /// The request was abandoned before resolution.
    #[error("request abandoned ({reason})")]
    Abandoned { reason: AbandonReason },

    /// The packet could not be encoded; deterministic, never retried.
    #[error("packet encode failure: {0}")]
    Encode(#[source] WireError),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying link failed.
    #[error("link failure: {0}")]
    Link(#[from] LinkError),

    /// The transport was stopped and its receive queue closed.
    #[error("transport closed")]
    Closed,
}

/// Outcome of a reliable or FIFO-acknowledged send.
#[derive(Debug)]
pub struct SendResult {
    pub success: bool,
    pub correlation_id: Uuid,
    pub reason: Option<TransportError>,
    pub retry_count: u16,
}

impl SendResult {
    pub(crate) fn ok(correlation_id: Uuid, retry_count: u16) -> Self {
        Self {
            success: true,
            correlation_id,
            reason: None,
            retry_count,
        }
    }

    pub(crate) fn failed(correlation_id: Uuid, reason: TransportError, retry_count: u16) -> Self {
        Self {
            success: false,
            correlation_id,
            reason: Some(reason),
            retry_count,
        }
    }
}

/// A decoded inbound packet with its receive-side bookkeeping.
#[derive(Debug)]
pub struct TrackedPacket {
    pub packet: Packet,
    pub correlation_id: Uuid,
    pub recv_time: Instant,
    pub dedup_key: String,
}
