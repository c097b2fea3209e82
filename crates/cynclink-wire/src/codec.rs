//! Encode/decode for the typed Cync packets.
//!
//! Frame layout: 5-byte header (`kind | 00 00 len_hi | len_lo`), then for
//! known kinds an endpoint at frame bytes [5..10], a big-endian msg_id at
//! [10..12] for the 0x73/0x7B pair only, and the application payload after.
//! Payloads that carry the wire format's inline 0x7E envelope
//! (`7E | inner.. | sum | 7E`) are checksum-verified on decode; the codec
//! never adds the envelope itself.

use crate::error::WireError;
use crate::framer::{HEADER_LEN, MAX_FRAME_BODY};
use crate::packet::{self, Endpoint, Packet};
use bytes::{BufMut, Bytes, BytesMut};

/// Delimiter byte of the inline checksum envelope.
pub const INLINE_MARKER: u8 = 0x7E;

const ENDPOINT_LEN: usize = 5;
const MSG_ID_LEN: usize = 2;

fn frame(kind: u8, body: &BytesMut) -> Result<Bytes, WireError> {
    if body.len() > MAX_FRAME_BODY {
        return Err(WireError::Oversize {
            declared: body.len(),
            ceiling: MAX_FRAME_BODY,
        });
    }
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_u8(kind);
    out.put_u8(0);
    out.put_u8(0);
    out.put_u8((body.len() / 256) as u8);
    out.put_u8((body.len() % 256) as u8);
    out.extend_from_slice(body);
    Ok(out.freeze())
}

/// Encodes a 0x23 handshake carrying the opaque authorization bytes.
pub fn encode_handshake(endpoint: Endpoint, auth_code: &[u8]) -> Result<Bytes, WireError> {
    let mut body = BytesMut::with_capacity(ENDPOINT_LEN + auth_code.len());
    body.extend_from_slice(&endpoint);
    body.extend_from_slice(auth_code);
    frame(packet::HANDSHAKE, &body)
}

/// Encodes a 0x73 data packet; `msg_id` lands at frame bytes [10..12].
pub fn encode_data(endpoint: Endpoint, msg_id: u16, payload: &[u8]) -> Result<Bytes, WireError> {
    let mut body = BytesMut::with_capacity(ENDPOINT_LEN + MSG_ID_LEN + payload.len());
    body.extend_from_slice(&endpoint);
    body.put_u16(msg_id);
    body.extend_from_slice(payload);
    frame(packet::DATA, &body)
}

/// Encodes a payload-bearing packet without a msg_id (0x83 status, 0x43 bulk
/// status).
pub fn encode_payload_packet(
    kind: u8,
    endpoint: Endpoint,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    if !matches!(kind, packet::STATUS | packet::BULK_STATUS) {
        return Err(WireError::UnknownKind(kind));
    }
    let mut body = BytesMut::with_capacity(ENDPOINT_LEN + payload.len());
    body.extend_from_slice(&endpoint);
    body.extend_from_slice(payload);
    frame(kind, &body)
}

/// Encodes one of the five ACK kinds. `msg_id` is required for 0x7B and
/// ignored for the FIFO kinds.
pub fn encode_ack(kind: u8, endpoint: Endpoint, msg_id: Option<u16>) -> Result<Bytes, WireError> {
    if !packet::is_ack(kind) {
        return Err(WireError::UnknownKind(kind));
    }
    let mut body = BytesMut::with_capacity(ENDPOINT_LEN + MSG_ID_LEN);
    body.extend_from_slice(&endpoint);
    if kind == packet::DATA_ACK {
        let id = msg_id.ok_or(WireError::Truncated {
            needed: MSG_ID_LEN,
            remaining: 0,
        })?;
        body.put_u16(id);
    }
    frame(kind, &body)
}

/// Encodes a 0xD3 heartbeat.
pub fn encode_heartbeat(endpoint: Endpoint) -> Result<Bytes, WireError> {
    let mut body = BytesMut::with_capacity(ENDPOINT_LEN);
    body.extend_from_slice(&endpoint);
    frame(packet::HEARTBEAT, &body)
}

/// Sum of the inner bytes of a 0x7E envelope, mod 256.
pub fn inline_checksum(inner: &[u8]) -> u8 {
    inner.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Verifies the inline checksum if `payload` carries the 0x7E envelope.
/// Payloads without the envelope pass untouched.
pub fn verify_inline_checksum(payload: &[u8]) -> Result<(), WireError> {
    if payload.len() < 3
        || payload[0] != INLINE_MARKER
        || payload[payload.len() - 1] != INLINE_MARKER
    {
        return Ok(());
    }
    let inner = &payload[1..payload.len() - 2];
    let expected = payload[payload.len() - 2];
    let actual = inline_checksum(inner);
    if expected != actual {
        return Err(WireError::BadChecksum { expected, actual });
    }
    Ok(())
}

/// Decodes one complete frame as produced by the framer.
///
/// Zero-body frames are accepted for any kind. Unknown kinds decode opaquely:
/// the whole body becomes the payload so opaque consumers can still see it.
pub fn decode_packet(raw: Bytes) -> Result<Packet, WireError> {
    if raw.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN,
            remaining: raw.len(),
        });
    }
    let kind = raw[0];
    let declared = (raw[3] as usize) * 256 + raw[4] as usize;
    if raw.len() < HEADER_LEN + declared {
        return Err(WireError::Truncated {
            needed: HEADER_LEN + declared,
            remaining: raw.len(),
        });
    }

    let body = raw.slice(HEADER_LEN..HEADER_LEN + declared);
    if body.is_empty() || !packet::is_known(kind) {
        return Ok(Packet {
            kind,
            endpoint: None,
            msg_id: None,
            payload: body,
            raw,
        });
    }

    let with_msg_id = packet::carries_msg_id(kind);
    let min = if with_msg_id {
        ENDPOINT_LEN + MSG_ID_LEN
    } else {
        ENDPOINT_LEN
    };
    if body.len() < min {
        return Err(WireError::Truncated {
            needed: min,
            remaining: body.len(),
        });
    }

    let mut endpoint = [0u8; ENDPOINT_LEN];
    endpoint.copy_from_slice(&body[..ENDPOINT_LEN]);
    let msg_id = if with_msg_id {
        Some(u16::from_be_bytes([body[5], body[6]]))
    } else {
        None
    };
    let payload = body.slice(min..);

    if matches!(kind, packet::DATA | packet::STATUS | packet::BULK_STATUS) {
        verify_inline_checksum(&payload)?;
    }

    Ok(Packet {
        kind,
        endpoint: Some(endpoint),
        msg_id,
        payload,
        raw,
    })
}
