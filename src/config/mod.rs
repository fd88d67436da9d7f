//! Configuration management for vipcore
//!
//! Configuration is loaded from `~/.vipcore/config.json` with environment
//! variable overrides. There is no process-wide instance: callers load a
//! `Config` and pass the relevant section to the component that needs it.

mod types;

pub use types::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};

impl Config {
    /// Returns the vipcore configuration directory path (~/.vipcore)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vipcore")
    }

    /// Returns the path to the config file (~/.vipcore/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    /// Environment variables override config values using the pattern
    /// `VIPCORE_SECTION_KEY`.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies `VIPCORE_*` overrides read through `lookup`. Values that fail
    /// to parse are ignored.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("VIPCORE_IDENTITY") {
            self.identity = Some(val);
        }
        if let Some(val) = lookup("VIPCORE_ADDRESS") {
            self.address = Some(val);
        }

        // Core
        if let Some(v) = lookup("VIPCORE_CORE_HANDSHAKE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.core.handshake_timeout_ms = v;
        }
        if let Some(v) = lookup("VIPCORE_CORE_SCHEDULER_HARD_CAP_MS").and_then(|v| v.parse().ok()) {
            self.core.scheduler_hard_cap_ms = v;
        }
        if let Some(v) = lookup("VIPCORE_CORE_STOP_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.core.stop_timeout_ms = v;
        }
        if let Some(val) = lookup("VIPCORE_CORE_MESSAGEBUS") {
            self.core.messagebus = val;
        }
        if let Some(val) = lookup("VIPCORE_CORE_VERSION") {
            self.core.version = val;
        }

        // Heartbeat
        if let Some(v) = lookup("VIPCORE_HEARTBEAT_AUTOSTART").and_then(|v| v.parse().ok()) {
            self.heartbeat.autostart = v;
        }
        if let Some(v) = lookup("VIPCORE_HEARTBEAT_PERIOD_SECS").and_then(|v| v.parse().ok()) {
            self.heartbeat.period_secs = v;
        }
        if let Some(v) =
            lookup("VIPCORE_HEARTBEAT_FAILURE_ALERT_THRESHOLD").and_then(|v| v.parse().ok())
        {
            self.heartbeat.failure_alert_threshold = v;
        }

        // Logging
        if let Some(val) = lookup("VIPCORE_LOGGING_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = lookup("VIPCORE_LOGGING_FORMAT") {
            match val.to_ascii_lowercase().as_str() {
                "pretty" => self.logging.format = LogFormat::Pretty,
                "component" => self.logging.format = LogFormat::Component,
                "json" => self.logging.format = LogFormat::Json,
                _ => {}
            }
        }
        if let Some(val) = lookup("VIPCORE_LOGGING_FILE") {
            self.logging.file = Some(val);
        }
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.core.handshake_timeout_ms == 0 {
            return Err(CoreError::Config(
                "core.handshake_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.core.scheduler_hard_cap_ms == 0 {
            return Err(CoreError::Config(
                "core.scheduler_hard_cap_ms must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat.period_secs == 0 {
            return Err(CoreError::Config(
                "heartbeat.period_secs must be greater than 0".to_string(),
            ));
        }
        if matches!(self.identity.as_deref(), Some(id) if id.trim().is_empty()) {
            return Err(CoreError::Config("identity must not be empty".to_string()));
        }
        Ok(())
    }
}

impl CoreConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn scheduler_hard_cap(&self) -> Duration {
        Duration::from_millis(self.scheduler_hard_cap_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl HeartbeatConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_path_under_home() {
        assert!(Config::path().ends_with(".vipcore/config.json"));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config.core.messagebus, "zmq");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.identity = Some("platform.historian".to_string());
        config.core.handshake_timeout_ms = 2_500;
        config.heartbeat.period_secs = 15;
        config.save_to_path(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let restored: Config = serde_json::from_str(&content).unwrap();
        assert_eq!(restored.identity.as_deref(), Some("platform.historian"));
        assert_eq!(restored.core.handshake_timeout_ms, 2_500);
        assert_eq!(restored.heartbeat.period_secs, 15);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Config::load_from_path(&path),
            Err(CoreError::Json(_))
        ));
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup(&[
            ("VIPCORE_IDENTITY", "agent-7"),
            ("VIPCORE_ADDRESS", "inproc://bus"),
            ("VIPCORE_CORE_HANDSHAKE_TIMEOUT_MS", "500"),
            ("VIPCORE_HEARTBEAT_PERIOD_SECS", "5"),
            ("VIPCORE_HEARTBEAT_AUTOSTART", "false"),
            ("VIPCORE_LOGGING_LEVEL", "debug"),
            ("VIPCORE_LOGGING_FORMAT", "JSON"),
        ]));
        assert_eq!(config.identity.as_deref(), Some("agent-7"));
        assert_eq!(config.address.as_deref(), Some("inproc://bus"));
        assert_eq!(config.core.handshake_timeout(), Duration::from_millis(500));
        assert_eq!(config.heartbeat.period(), Duration::from_secs(5));
        assert!(!config.heartbeat.autostart);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unparseable_overrides_ignored() {
        let mut config = Config::default();
        config.apply_overrides_from(lookup(&[
            ("VIPCORE_CORE_HANDSHAKE_TIMEOUT_MS", "soon"),
            ("VIPCORE_LOGGING_FORMAT", "fancy"),
        ]));
        assert_eq!(config.core.handshake_timeout_ms, 10_000);
        assert_eq!(config.logging.format, LogFormat::Component);
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.core.handshake_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.heartbeat.period_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.identity = Some("  ".to_string());
        assert!(config.validate().is_err());
    }
}
