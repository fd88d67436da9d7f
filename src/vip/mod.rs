//! VIP protocol types shared by the transport, the Core and subsystems.

pub mod message;

pub use message::{subsystems, Message, DEFAULT_SIGNATURE};
