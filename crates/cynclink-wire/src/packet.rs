//! Packet kinds and the decoded packet model.

use bytes::Bytes;

/// Opaque 5-byte identity of a mesh gateway.
pub type Endpoint = [u8; 5];

// --- Packet kinds ---
pub const HANDSHAKE: u8 = 0x23;
pub const HANDSHAKE_ACK: u8 = 0x28;
pub const BULK_STATUS: u8 = 0x43;
pub const BULK_STATUS_ACK: u8 = 0x48;
pub const DATA: u8 = 0x73;
pub const DATA_ACK: u8 = 0x7B;
pub const STATUS: u8 = 0x83;
pub const STATUS_ACK: u8 = 0x88;
pub const HEARTBEAT: u8 = 0xD3;
pub const HEARTBEAT_ACK: u8 = 0xD8;

/// The ACK kind a request kind expects, if one is defined.
pub fn ack_for(kind: u8) -> Option<u8> {
    match kind {
        HANDSHAKE => Some(HANDSHAKE_ACK),
        BULK_STATUS => Some(BULK_STATUS_ACK),
        DATA => Some(DATA_ACK),
        STATUS => Some(STATUS_ACK),
        HEARTBEAT => Some(HEARTBEAT_ACK),
        _ => None,
    }
}

/// Whether `kind` is one of the five ACK kinds.
pub fn is_ack(kind: u8) -> bool {
    matches!(
        kind,
        HANDSHAKE_ACK | BULK_STATUS_ACK | DATA_ACK | STATUS_ACK | HEARTBEAT_ACK
    )
}

/// Only the data pair carries a msg_id (frame bytes [10..12]).
pub fn carries_msg_id(kind: u8) -> bool {
    matches!(kind, DATA | DATA_ACK)
}

/// Whether this codec knows the body layout of `kind`. Unknown kinds still
/// decode, but opaquely (whole body as payload).
pub fn is_known(kind: u8) -> bool {
    is_ack(kind) || ack_for(kind).is_some()
}

/// A decoded wire packet.
///
/// `endpoint` and `msg_id` are `None` for zero-body frames and for kinds that
/// do not carry them; `raw` keeps the full frame as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: u8,
    pub endpoint: Option<Endpoint>,
    pub msg_id: Option<u16>,
    pub payload: Bytes,
    pub raw: Bytes,
}
