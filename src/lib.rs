//! vipcore - agent runtime core for the VIP message bus
//!
//! Drives an agent's lifecycle (setup, start, stop, finish), runs callbacks
//! at deadlines, lets foreign threads hand work to the agent's context,
//! performs the hello/welcome handshake and routes inbound envelopes to
//! subsystems.

pub mod config;
pub mod core;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod scheduler;
pub mod signal;
pub mod transport;
pub mod utils;
pub mod vip;

pub use crate::core::{BasicLoop, Bindings, Core, CoreBuilder, CoreLoop, CoreState, VipLoop};
pub use config::Config;
pub use credentials::Credentials;
pub use error::{CoreError, Result, VipError, VipErrorKind};
pub use heartbeat::Heartbeat;
pub use scheduler::{ScheduledEvent, Scheduler};
pub use signal::Signal;
pub use vip::Message;
