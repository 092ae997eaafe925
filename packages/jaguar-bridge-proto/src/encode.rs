use alloc::{vec, vec::Vec};
use thiserror::Error;

use crate::{CanMessage, ESCAPE, ESCAPED_ESCAPE, ESCAPED_START, FRAME_START, IDENTIFIER_LEN};

/// Returned when a message cannot be represented on the wire.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("CAN identifier {id:#x} does not fit in 29 bits.")]
    IdentifierOutOfRange { id: u32 },

    #[error("Payload of {len} bytes exceeds the 8 byte limit.")]
    PayloadTooLong { len: usize },
}

/// A type that can be encoded into a sequence of bytes.
pub trait Encode {
    /// Returns the number of bytes this value will take when encoded.
    fn size(&self) -> usize;

    /// Encodes this instance into the provided byte slice.
    ///
    /// `data` must be at least [`Encode::size`] bytes long.
    fn encode(&self, data: &mut [u8]);

    /// Encodes this instance into a freshly allocated buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0; self.size()];
        self.encode(&mut data);
        data
    }
}

impl Encode for CanMessage {
    fn size(&self) -> usize {
        2 + escaped_len(&self.id().to_le_bytes()) + escaped_len(self.payload())
    }

    fn encode(&self, data: &mut [u8]) {
        data[0] = FRAME_START;
        data[1] = (IDENTIFIER_LEN + self.payload().len()) as u8;

        let written = escape_into(&self.id().to_le_bytes(), &mut data[2..]);
        escape_into(self.payload(), &mut data[2 + written..]);
    }
}

/// Encodes a CAN identifier and payload into a complete, byte-stuffed frame.
///
/// # Errors
///
/// Fails before producing any output if `id` does not fit in 29 bits or the
/// payload is longer than [`MAX_PAYLOAD_LEN`](crate::MAX_PAYLOAD_LEN).
pub fn encode(id: u32, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    Ok(CanMessage::new(id, payload)?.to_bytes())
}

fn escaped_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .map(|&b| if b == FRAME_START || b == ESCAPE { 2 } else { 1 })
        .sum()
}

/// Writes `bytes` into `data` with markers escaped, returning the number of
/// bytes written.
fn escape_into(bytes: &[u8], data: &mut [u8]) -> usize {
    let mut written = 0;
    for &byte in bytes {
        let substitute = match byte {
            FRAME_START => Some(ESCAPED_START),
            ESCAPE => Some(ESCAPED_ESCAPE),
            _ => None,
        };

        if let Some(substitute) = substitute {
            data[written] = ESCAPE;
            data[written + 1] = substitute;
            written += 2;
        } else {
            data[written] = byte;
            written += 1;
        }
    }
    written
}
