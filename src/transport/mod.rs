//! Transport seam between the Core and the message bus.
//!
//! The Core never talks to sockets directly. It owns one `Connection` and
//! drives it through the lifecycle:
//!
//! ```text
//! ┌──────────────┐  send_vip_message   ┌──────────────┐
//! │     Core     │────────────────────>│  Connection  │────> router
//! │ (VipLoop)    │<────────────────────│  (transport) │<──── router
//! └──────────────┘ receive_vip_message └──────────────┘
//! ```
//!
//! # Implementing a Transport
//!
//! ```ignore
//! use async_trait::async_trait;
//! use vipcore::transport::Connection;
//! use vipcore::vip::Message;
//! use vipcore::error::Result;
//!
//! struct ZmqConnection { /* socket, state */ }
//!
//! #[async_trait]
//! impl Connection for ZmqConnection {
//!     async fn connect(&self) -> Result<()> { Ok(()) }
//!     async fn disconnect(&self) -> Result<()> { Ok(()) }
//!     fn is_connected(&self) -> bool { true }
//!     async fn send_vip_message(&self, message: Message) -> Result<()> { Ok(()) }
//!     async fn receive_vip_message(&self) -> Result<Option<Message>> { Ok(None) }
//! }
//! ```

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::Result;
use crate::vip::Message;

pub use memory::{MemoryConnection, MemoryConnectionFactory, MemoryPeer};

/// A persistent session with the router.
///
/// Implementations must allow `send_vip_message` to be called while another
/// task is parked in `receive_vip_message`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establishes the session.
    async fn connect(&self) -> Result<()>;

    /// Tears the session down. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Returns whether the session is currently established.
    fn is_connected(&self) -> bool;

    /// Sends one envelope.
    ///
    /// # Errors
    ///
    /// Returns an error when the session is down or the peer is gone.
    async fn send_vip_message(&self, message: Message) -> Result<()>;

    /// Waits for the next inbound envelope.
    ///
    /// Returns `Ok(None)` once the transport is closed for good.
    async fn receive_vip_message(&self) -> Result<Option<Message>>;
}

/// Builds connections from parameters, for Cores constructed without a
/// ready-made `Connection`.
pub trait ConnectionFactory: Send + Sync {
    /// Address the built connections talk to.
    fn address(&self) -> &str;

    /// Builds a fresh, not yet connected, connection for `credentials`.
    fn build(&self, credentials: &Credentials) -> Result<Arc<dyn Connection>>;
}
