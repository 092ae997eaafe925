//! Implementation of the Jaguar serial bridge framing protocol in Rust.
//!
//! The bridge tunnels CAN messages over a plain serial line. Every message is
//! sent as a single frame:
//!
//! | Offset | Field               | Encoding |
//! |--------|---------------------|----------|
//! | 0      | Frame start         | [`FRAME_START`] |
//! | 1      | Length              | raw byte, `4 + payload length` (4–12) |
//! | 2..    | Identifier, payload | little-endian `u32` identifier then 0–8 payload bytes, byte-stuffed |
//!
//! Byte stuffing guarantees that [`FRAME_START`] only ever appears on the wire
//! at a real frame boundary, which lets the [`Decoder`] resynchronize after
//! line noise or a dropped byte.

#![no_std]

extern crate alloc;

mod decode;
mod encode;
mod message;

pub use decode::{Decoder, DecoderState, ProtocolError};
pub use encode::{Encode, EncodeError, encode};
pub use message::{CanMessage, MAX_IDENTIFIER, MAX_PAYLOAD_LEN};

/// Marks the start of every frame.
pub const FRAME_START: u8 = 0xFF;

/// Introduces a two-byte escape sequence.
pub const ESCAPE: u8 = 0xFE;

/// Second byte of the escape sequence standing in for [`FRAME_START`].
pub const ESCAPED_START: u8 = 0xFE;

/// Second byte of the escape sequence standing in for [`ESCAPE`].
pub const ESCAPED_ESCAPE: u8 = 0xFD;

/// Number of bytes used by the identifier on the wire.
pub const IDENTIFIER_LEN: usize = 4;

/// Smallest legal value of the length byte (identifier, empty payload).
pub const MIN_FRAME_LEN: u8 = IDENTIFIER_LEN as u8;

/// Largest legal value of the length byte (identifier, full payload).
pub const MAX_FRAME_LEN: u8 = (IDENTIFIER_LEN + MAX_PAYLOAD_LEN) as u8;

/// Worst-case size of an encoded frame: two framing bytes plus every
/// identifier and payload byte escaped.
pub const MAX_ENCODED_LEN: usize = 2 + 2 * MAX_FRAME_LEN as usize;
