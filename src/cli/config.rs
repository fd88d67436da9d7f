//! Config command handler.

use std::path::Path;

use anyhow::{Context, Result};

use vipcore::config::Config;

use super::ConfigAction;

pub(crate) fn cmd_config(path: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Check => {
            println!("Config file: {}", path.display());
            if !path.exists() {
                println!("[OK] No config file found (using defaults)");
                return Ok(());
            }
            match Config::load_from_path(path) {
                Ok(config) => {
                    println!("[OK] identity:          {}", config.identity.as_deref().unwrap_or("(random)"));
                    println!("[OK] handshake timeout: {} ms", config.core.handshake_timeout_ms);
                    println!("[OK] heartbeat period:  {} s", config.heartbeat.period_secs);
                    println!("\nConfiguration looks good!");
                }
                Err(e) => println!("[ERROR] {}", e),
            }
        }
        ConfigAction::Show => {
            let config = Config::load_from_path(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
