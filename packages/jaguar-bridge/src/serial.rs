//! Implements discovering and opening serial CAN bridges.

use log::{debug, trace};
use serialport::SerialPortType;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortInfo, StopBits};

use crate::link::{LinkError, SerialLink};

/// Baud rate the bridge firmware runs its UART at.
pub const BRIDGE_BAUD_RATE: u32 = 115200;

/// Port used by the command line tools when none is given or discovered.
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// A USB serial port that may have a bridge behind it.
#[derive(Clone, Debug)]
pub struct BridgePort {
    pub port_info: SerialPortInfo,
}

impl BridgePort {
    /// The OS name of the port, e.g. `/dev/ttyUSB0` or `COM3`.
    pub fn name(&self) -> &str {
        &self.port_info.port_name
    }

    /// The USB vendor and product id of the adapter.
    pub fn usb_ids(&self) -> Option<(u16, u16)> {
        match &self.port_info.port_type {
            SerialPortType::UsbPort(info) => Some((info.vid, info.pid)),
            _ => None,
        }
    }

    /// The product string reported by the adapter, if any.
    pub fn product(&self) -> Option<&str> {
        match &self.port_info.port_type {
            SerialPortType::UsbPort(info) => info.product.as_deref(),
            _ => None,
        }
    }

    pub fn open(&self) -> Result<SerialLink, LinkError> {
        SerialLink::open(self.name())
    }
}

/// Finds all USB serial ports that a bridge could be connected to.
///
/// Bridges are built from generic USB-to-serial adapters, so every USB port is
/// a candidate.
pub fn find_ports() -> Result<Vec<BridgePort>, LinkError> {
    let ports = tokio_serial::available_ports()?;

    let mut bridge_ports = Vec::new();
    for port in ports {
        let SerialPortType::UsbPort(ref info) = port.port_type else {
            trace!("Skipping non-USB port {:?}", port.port_name);
            continue;
        };

        if cfg!(target_os = "macos") && port.port_name.starts_with("/dev/tty.") {
            // https://pbxbook.com/other/mac-tty.html
            debug!(
                "Ignoring port named {:?} because it is a call-in device",
                port.port_name
            );
            continue;
        }

        debug!(
            "Found USB serial port {:?} ({:04x}:{:04x})",
            port.port_name, info.vid, info.pid
        );
        bridge_ports.push(BridgePort { port_info: port });
    }

    Ok(bridge_ports)
}

impl SerialLink {
    /// Opens the named serial port at [`BRIDGE_BAUD_RATE`], 8 data bits, one
    /// stop bit and no parity, and starts reading from it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(port: &str) -> Result<Self, LinkError> {
        let stream = tokio_serial::SerialStream::open(
            &tokio_serial::new(port, BRIDGE_BAUD_RATE)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None),
        )?;

        debug!("Opened serial port {:?} at {} baud", port, BRIDGE_BAUD_RATE);

        Ok(Self::new(stream))
    }
}
