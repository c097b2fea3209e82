use thiserror::Error;

/// Errors that can occur while framing or (de)coding wire packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A frame or body ended before the bytes its header promised.
    #[error("truncated frame: needed {needed} bytes, had {remaining}")]
    Truncated { needed: usize, remaining: usize },

    /// The inline checksum of a 0x7E-framed payload did not match.
    #[error("checksum mismatch: expected {expected:#04x}, computed {actual:#04x}")]
    BadChecksum { expected: u8, actual: u8 },

    /// The packet kind has no encoding defined in this codec.
    #[error("unknown packet kind: {0:#04x}")]
    UnknownKind(u8),

    /// A frame header declared a body larger than the implementation ceiling.
    #[error("oversize frame: declared {declared} bytes, ceiling {ceiling}")]
    Oversize { declared: usize, ceiling: usize },
}

pub type Result<T> = std::result::Result<T, WireError>;
