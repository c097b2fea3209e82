//! Length-delimited frame extraction from a TCP byte stream.

use crate::error::WireError;
use bytes::{Bytes, BytesMut};

/// Frame header: `kind:u8 | 00 00 len_hi:u8 | len_lo:u8`.
pub const HEADER_LEN: usize = 5;

/// Ceiling for the declared body length. The length field tops out at 65535,
/// so the ceiling sits below it to stay observable; real Cync frames are far
/// smaller.
pub const MAX_FRAME_BODY: usize = 32 * 1024;

/// Stateful byte buffer that accepts arbitrary TCP chunks and yields zero or
/// more complete frames. One framer per connection, fed by the single reader
/// only.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Appends `chunk` and extracts every complete frame now available.
    ///
    /// A header declaring a body larger than [`MAX_FRAME_BODY`] fails the
    /// whole stream; the connection cannot be resynchronized past it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, WireError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let declared = (self.buf[3] as usize) * 256 + self.buf[4] as usize;
            if declared > MAX_FRAME_BODY {
                return Err(WireError::Oversize {
                    declared,
                    ceiling: MAX_FRAME_BODY,
                });
            }
            let total = HEADER_LEN + declared;
            if self.buf.len() < total {
                break;
            }
            frames.push(self.buf.split_to(total).freeze());
        }

        Ok(frames)
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
