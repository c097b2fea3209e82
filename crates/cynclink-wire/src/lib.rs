//! # Cynclink Wire Format
//!
//! Framing and codec for the Cync bridge protocol: length-delimited frames
//! over a TCP byte stream, and the small fixed set of typed packets the
//! transport exchanges with a mesh gateway.

pub mod codec;
pub mod error;
pub mod framer;
pub mod packet;

pub use error::WireError;
pub use framer::{Framer, HEADER_LEN, MAX_FRAME_BODY};
pub use packet::{Endpoint, Packet};
