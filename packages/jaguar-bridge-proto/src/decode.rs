use thiserror::Error;

use crate::{
    CanMessage, ESCAPE, ESCAPED_ESCAPE, ESCAPED_START, FRAME_START, IDENTIFIER_LEN, MAX_FRAME_LEN,
    MIN_FRAME_LEN,
};

/// Malformed data seen on the wire.
///
/// The offending frame is discarded and the decoder waits for the next
/// [`FRAME_START`], so none of these are fatal.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame length byte {length} is outside of the valid range 4..=12.")]
    BadLength { length: u8 },

    #[error("Invalid escape sequence. Found {byte:#x} after the escape marker.")]
    BadEscape { byte: u8 },

    #[error("Decoded identifier {id:#x} does not fit in 29 bits.")]
    BadIdentifier { id: u32 },
}

/// Where the decoder is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    /// Between frames, discarding everything until a frame start.
    #[default]
    Waiting,
    /// A frame start was seen and the length byte comes next.
    ExpectLength,
    /// Accumulating identifier and payload bytes.
    InPayload,
}

/// Reassembles [`CanMessage`]s from a byte stream, one byte at a time.
///
/// The decoder holds no assumption about how bytes are batched: a frame, or an
/// escape sequence within it, may be spread across any number of calls to
/// [`Decoder::feed`]. It has no internal synchronization and must be driven by
/// a single reader.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    state: DecoderState,
    buffer: [u8; MAX_FRAME_LEN as usize],
    filled: usize,
    target: usize,
    escape: bool,
}

impl Decoder {
    /// Creates a decoder waiting for the first frame start.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state of the decoder.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Discards any partially received frame.
    pub fn reset(&mut self) {
        self.state = DecoderState::Waiting;
        self.filled = 0;
        self.target = 0;
        self.escape = false;
    }

    /// Feeds a single received byte into the decoder.
    ///
    /// Returns `None` for bytes that neither complete a frame nor violate the
    /// protocol, which is the case for most of them.
    pub fn feed(&mut self, byte: u8) -> Option<Result<CanMessage, ProtocolError>> {
        // Escaping guarantees a raw frame start is always a frame boundary.
        if byte == FRAME_START {
            self.reset();
            self.state = DecoderState::ExpectLength;
            return None;
        }

        match self.state {
            DecoderState::Waiting => None,
            // The length byte can never collide with a marker, so it is not escaped.
            DecoderState::ExpectLength => {
                if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&byte) {
                    self.reset();
                    return Some(Err(ProtocolError::BadLength { length: byte }));
                }
                self.target = byte as usize;
                self.state = DecoderState::InPayload;
                None
            }
            DecoderState::InPayload if self.escape => {
                self.escape = false;
                match byte {
                    ESCAPED_START => self.push(FRAME_START),
                    ESCAPED_ESCAPE => self.push(ESCAPE),
                    _ => {
                        self.reset();
                        Some(Err(ProtocolError::BadEscape { byte }))
                    }
                }
            }
            DecoderState::InPayload if byte == ESCAPE => {
                self.escape = true;
                None
            }
            DecoderState::InPayload => self.push(byte),
        }
    }

    /// Feeds every byte of `bytes` in order, yielding each completed message
    /// or protocol error.
    pub fn feed_slice<'a>(
        &'a mut self,
        bytes: &'a [u8],
    ) -> impl Iterator<Item = Result<CanMessage, ProtocolError>> + 'a {
        bytes.iter().filter_map(move |&byte| self.feed(byte))
    }

    fn push(&mut self, byte: u8) -> Option<Result<CanMessage, ProtocolError>> {
        self.buffer[self.filled] = byte;
        self.filled += 1;

        if self.filled < self.target {
            return None;
        }

        let (id, payload) = self.buffer[..self.filled].split_at(IDENTIFIER_LEN);
        let id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
        // The length byte already bounds the payload, so only the identifier can be invalid.
        let result =
            CanMessage::new(id, payload).map_err(|_| ProtocolError::BadIdentifier { id });

        self.reset();
        Some(result)
    }
}
