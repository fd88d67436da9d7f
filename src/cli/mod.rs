//! CLI module: command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod config;
pub mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vipcore")]
#[command(version)]
#[command(about = "Agent runtime core for the VIP message bus", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.vipcore/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo agent against an in-process loopback router
    Run {
        /// Agent identity (overrides config)
        #[arg(long)]
        identity: Option<String>,
        /// Handshake timeout in milliseconds (overrides config)
        #[arg(long)]
        handshake_timeout_ms: Option<u64>,
        /// Never answer the hello, to exercise the handshake timeout
        #[arg(long)]
        no_welcome: bool,
        /// Stop at this time (RFC 3339 or `YYYY-MM-DD HH:MM:SS` UTC)
        #[arg(long, value_name = "TIME")]
        run_until: Option<String>,
        /// Heartbeat period in seconds (overrides config)
        #[arg(long)]
        heartbeat_secs: Option<u64>,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file
    Check,
    /// Print the effective configuration (file plus environment)
    Show,
}

/// Options for `vipcore run`.
pub struct RunOptions {
    pub identity: Option<String>,
    pub handshake_timeout_ms: Option<u64>,
    pub no_welcome: bool,
    pub run_until: Option<String>,
    pub heartbeat_secs: Option<u64>,
}

/// Entry point for the CLI, called from main().
pub async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(vipcore::Config::path);

    // Respect the configured logging settings; fall back to defaults if the
    // config file is missing or unreadable.
    let logging_cfg = vipcore::Config::load_from_path(&config_path)
        .map(|c| c.logging)
        .unwrap_or_default();
    vipcore::utils::logging::init_logging(&logging_cfg)?;

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Version) => {
            cmd_version();
        }
        Some(Commands::Run {
            identity,
            handshake_timeout_ms,
            no_welcome,
            run_until,
            heartbeat_secs,
        }) => {
            let options = RunOptions {
                identity,
                handshake_timeout_ms,
                no_welcome,
                run_until,
                heartbeat_secs,
            };
            run::cmd_run(&config_path, options).await?;
        }
        Some(Commands::Config { action }) => {
            config::cmd_config(&config_path, action)?;
        }
    }

    Ok(())
}

/// Display version information
fn cmd_version() {
    println!("vipcore {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Agent runtime core for the VIP message bus");
}
