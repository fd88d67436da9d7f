//! Heartbeat subsystem
//!
//! Publishes `heartbeat/<identity>` on the pubsub subsystem every period,
//! driven by the Core's deadline scheduler.

mod service;

pub use service::{
    heartbeat_topic, Heartbeat, HeartbeatResult, StatusSource, DEFAULT_STATUS, HEARTBEAT_OWNER,
    TIMESTAMP_HEADER,
};
