//! Configuration type definitions for vipcore
//!
//! All types implement serde traits for JSON serialization and have sensible
//! defaults, so a partial config file only overrides what it names.

use serde::{Deserialize, Serialize};

/// Main configuration struct for vipcore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent identity; a random UUID is used when unset
    pub identity: Option<String>,
    /// Router address handed to the connection factory
    pub address: Option<String>,
    /// Lifecycle driver settings
    pub core: CoreConfig,
    /// Heartbeat subsystem settings
    pub heartbeat: HeartbeatConfig,
    /// Log output settings
    pub logging: LoggingConfig,
}

// ============================================================================
// Core Configuration
// ============================================================================

/// Lifecycle driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// How long to wait for the router's welcome before shutting down.
    pub handshake_timeout_ms: u64,
    /// Upper bound on a single scheduler wait.
    pub scheduler_hard_cap_ms: u64,
    /// Bound used by callers that stop the Core without their own timeout.
    pub stop_timeout_ms: u64,
    /// Message bus name, reported in handshake diagnostics.
    pub messagebus: String,
    /// Agent protocol version.
    pub version: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            scheduler_hard_cap_ms: 5_000,
            stop_timeout_ms: 10_000,
            messagebus: "zmq".to_string(),
            version: "0.1".to_string(),
        }
    }
}

// ============================================================================
// Heartbeat Configuration
// ============================================================================

/// Heartbeat subsystem settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Start publishing as soon as the agent starts.
    pub autostart: bool,
    /// Seconds between heartbeats.
    pub period_secs: u64,
    /// Consecutive failed publishes before the heartbeat reports unhealthy.
    pub failure_alert_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            period_secs: 60,
            failure_alert_threshold: 3,
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line output with the component tag
    #[default]
    Component,
    /// One JSON object per line
    Json,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Append logs to this file instead of stderr
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_config_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.handshake_timeout_ms, 10_000);
        assert_eq!(cfg.scheduler_hard_cap_ms, 5_000);
        assert_eq!(cfg.messagebus, "zmq");
        assert_eq!(cfg.version, "0.1");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"core":{"handshake_timeout_ms":250},"heartbeat":{"autostart":false}}"#)
                .unwrap();
        assert_eq!(cfg.core.handshake_timeout_ms, 250);
        assert_eq!(cfg.core.stop_timeout_ms, 10_000);
        assert!(!cfg.heartbeat.autostart);
        assert_eq!(cfg.heartbeat.period_secs, 60);
        assert!(cfg.identity.is_none());
    }

    #[test]
    fn test_empty_object_is_default() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.core, CoreConfig::default());
        assert_eq!(cfg.heartbeat, HeartbeatConfig::default());
        assert_eq!(cfg.logging.format, LogFormat::Component);
    }
}
