use alloc::vec::Vec;
use core::fmt;

use crate::encode::EncodeError;

/// Largest identifier representable by a 29-bit extended CAN id.
pub const MAX_IDENTIFIER: u32 = 0x1FFF_FFFF;

/// Maximum number of data bytes in a classic CAN frame.
pub const MAX_PAYLOAD_LEN: usize = 8;

/// A single CAN message carried by the bridge.
///
/// # Invariants
///
/// - `id <= MAX_IDENTIFIER` (the top three bits are clear).
/// - `payload.len() <= MAX_PAYLOAD_LEN`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CanMessage {
    id: u32,
    payload: Vec<u8>,
}

impl CanMessage {
    /// Creates a new message after validating the identifier and payload length.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::IdentifierOutOfRange`] if `id` has any bit above
    /// bit 28 set, and [`EncodeError::PayloadTooLong`] if the payload is longer
    /// than [`MAX_PAYLOAD_LEN`].
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, EncodeError> {
        check(id, payload)?;
        Ok(Self {
            id,
            payload: payload.to_vec(),
        })
    }

    /// The 29-bit CAN identifier.
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// The data bytes of the message.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the message, returning the identifier and payload.
    pub fn into_parts(self) -> (u32, Vec<u8>) {
        (self.id, self.payload)
    }
}

impl fmt::Debug for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanMessage {{ id: {:#010x}, payload: {:02x?} }}", self.id, self.payload)
    }
}

fn check(id: u32, payload: &[u8]) -> Result<(), EncodeError> {
    if id > MAX_IDENTIFIER {
        return Err(EncodeError::IdentifierOutOfRange { id });
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLong {
            len: payload.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wide_identifier() {
        assert_eq!(
            CanMessage::new(0x2000_0000, &[]),
            Err(EncodeError::IdentifierOutOfRange { id: 0x2000_0000 })
        );
        assert!(CanMessage::new(MAX_IDENTIFIER, &[]).is_ok());
    }

    #[test]
    fn rejects_long_payload() {
        assert_eq!(
            CanMessage::new(1, &[0; 9]),
            Err(EncodeError::PayloadTooLong { len: 9 })
        );
        assert_eq!(CanMessage::new(1, &[0; 8]).unwrap().payload().len(), 8);
    }
}
