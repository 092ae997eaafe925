//! Crate for talking to CAN devices, such as Jaguar motor controllers, through a serial CAN bridge.
//!
//! The framing itself lives in [`protocol`]. This crate owns the transport: a
//! [`SerialLink`] reads and decodes frames in the background and hands
//! completed messages to whoever calls [`SerialLink::receive`].
//!
//! ```no_run
//! # async fn run() -> Result<(), jaguar_bridge::LinkError> {
//! let link = jaguar_bridge::SerialLink::open("/dev/ttyUSB0")?;
//! link.send(0x0000_0140, &[]).await?;
//! let reply = link.receive().await?;
//! println!("{:?}", reply);
//! link.close().await;
//! # Ok(())
//! # }
//! ```

pub use jaguar_bridge_proto as protocol;
pub use jaguar_bridge_proto::CanMessage;

pub mod jaguar;
pub mod link;
#[cfg(feature = "serial")]
pub mod serial;

pub use link::{LinkError, SerialLink};
