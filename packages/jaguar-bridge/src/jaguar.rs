//! Commands for Jaguar motor controllers.
//!
//! Jaguars use 29-bit extended CAN identifiers laid out as:
//!
//! | Bits  | Field         |
//! |-------|---------------|
//! | 24–28 | Device type   |
//! | 16–23 | Manufacturer  |
//! | 10–15 | API class     |
//! | 6–9   | API index     |
//! | 0–5   | Device number |
//!
//! System commands are broadcast (device type and manufacturer zero) and
//! reach every controller on the bus.

use jaguar_bridge_proto::CanMessage;
use log::debug;

use crate::link::{LinkError, SerialLink};

/// Identifier field masks and well known values.
pub mod ids {
    pub const DEVICE_NUMBER_MASK: u32 = 0x0000_003F;
    pub const API_MASK: u32 = 0x0000_FFC0;
    pub const MANUFACTURER_MASK: u32 = 0x00FF_0000;
    pub const DEVICE_TYPE_MASK: u32 = 0x1F00_0000;

    pub const MANUFACTURER_NI: u32 = 0x0001_0000;
    pub const MANUFACTURER_LM: u32 = 0x0002_0000;

    pub const DEVICE_TYPE_BROADCAST: u32 = 0x0000_0000;
    pub const DEVICE_TYPE_ROBOT: u32 = 0x0100_0000;
    pub const DEVICE_TYPE_MOTOR: u32 = 0x0200_0000;
}

/// Broadcast system API values.
pub mod system {
    pub const HALT: u32 = 0x0000_0000;
    pub const RESET: u32 = 0x0000_0040;
    pub const DEVICE_ASSIGN: u32 = 0x0000_0080;
    pub const DEVICE_QUERY: u32 = 0x0000_00C0;
    pub const HEARTBEAT: u32 = 0x0000_0140;
    pub const SYNC: u32 = 0x0000_0180;
    pub const ENUMERATE: u32 = 0x0000_0240;
    pub const RESUME: u32 = 0x0000_0280;
}

/// Voltage control mode API values for Luminary Micro motor controllers.
pub mod voltage {
    use super::ids::{DEVICE_TYPE_MOTOR, MANUFACTURER_LM};

    const CLASS: u32 = MANUFACTURER_LM | DEVICE_TYPE_MOTOR;

    pub const ENABLE: u32 = CLASS;
    pub const DISABLE: u32 = CLASS | (1 << 6);
    pub const SET: u32 = CLASS | (2 << 6);
}

/// The fields of a Jaguar CAN identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JaguarId(u32);

impl JaguarId {
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    pub const fn into_raw(self) -> u32 {
        self.0
    }

    pub const fn device_type(self) -> u8 {
        ((self.0 & ids::DEVICE_TYPE_MASK) >> 24) as u8
    }

    pub const fn manufacturer(self) -> u8 {
        ((self.0 & ids::MANUFACTURER_MASK) >> 16) as u8
    }

    /// The API class and index, still shifted into place.
    pub const fn api(self) -> u32 {
        self.0 & ids::API_MASK
    }

    pub const fn device_number(self) -> u8 {
        (self.0 & ids::DEVICE_NUMBER_MASK) as u8
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 & (ids::DEVICE_TYPE_MASK | ids::MANUFACTURER_MASK) == 0
    }
}

impl From<&CanMessage> for JaguarId {
    fn from(message: &CanMessage) -> Self {
        Self(message.id())
    }
}

/// A single Jaguar on the bus, addressed through a bridge link.
#[derive(Debug, Clone, Copy)]
pub struct Jaguar<'a> {
    link: &'a SerialLink,
    device: u8,
}

impl<'a> Jaguar<'a> {
    /// Addresses the Jaguar with the given device number.
    ///
    /// # Errors
    ///
    /// Device number 0 is reserved for broadcasts and numbers above 63 do not
    /// fit the identifier, so both are rejected.
    pub fn new(link: &'a SerialLink, device: u8) -> Result<Self, LinkError> {
        if !(1..=63).contains(&device) {
            return Err(LinkError::InvalidDeviceNumber { device });
        }
        Ok(Self { link, device })
    }

    pub fn device_number(&self) -> u8 {
        self.device
    }

    fn addressed(&self, api: u32) -> u32 {
        api | self.device as u32
    }

    /// Assigns `new_id` to whichever Jaguar has its button pressed next.
    ///
    /// An id of 0 clears the assignment.
    pub async fn device_assignment(&self, new_id: u8) -> Result<(), LinkError> {
        if new_id > 63 {
            return Err(LinkError::InvalidDeviceNumber { device: new_id });
        }
        debug!("Requesting device assignment to id {}", new_id);
        self.link.send(system::DEVICE_ASSIGN, &[new_id]).await
    }

    /// Halts every controller on the bus.
    pub async fn system_halt(&self) -> Result<(), LinkError> {
        self.link.send(system::HALT, &[]).await
    }

    /// Resumes every controller on the bus after a halt.
    pub async fn system_resume(&self) -> Result<(), LinkError> {
        self.link.send(system::RESUME, &[]).await
    }

    /// Resets every controller on the bus.
    pub async fn system_reset(&self) -> Result<(), LinkError> {
        self.link.send(system::RESET, &[]).await
    }

    /// Keeps the controllers from timing out and disabling their outputs.
    pub async fn heartbeat(&self) -> Result<(), LinkError> {
        self.link.send(system::HEARTBEAT, &[]).await
    }

    /// Switches this Jaguar into voltage control mode.
    pub async fn voltage_enable(&self) -> Result<(), LinkError> {
        self.link.send(self.addressed(voltage::ENABLE), &[]).await
    }

    pub async fn voltage_disable(&self) -> Result<(), LinkError> {
        self.link.send(self.addressed(voltage::DISABLE), &[]).await
    }

    /// Sets the output voltage as a signed fraction of the bus voltage, where
    /// `i16::MAX` is full forward and `-i16::MAX` full reverse.
    pub async fn set_voltage(&self, fraction: i16) -> Result<(), LinkError> {
        self.link
            .send(self.addressed(voltage::SET), &fraction.to_le_bytes())
            .await
    }
}
