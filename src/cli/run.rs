//! Demo agent command handler.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{info, warn};

use vipcore::config::Config;
use vipcore::core::HandshakeState;
use vipcore::transport::MemoryConnectionFactory;
use vipcore::utils::time::parse_deadline;
use vipcore::{Core, CoreError, Heartbeat};

use super::RunOptions;

const LOOPBACK_ADDRESS: &str = "inproc://vipcore-loopback";
const LOOPBACK_ROUTER: &str = "loopback";

/// Runs one agent with a heartbeat until Ctrl-C, `--run-until`, or a
/// handshake timeout.
pub(crate) async fn cmd_run(config_path: &Path, options: RunOptions) -> Result<()> {
    let mut config = Config::load_from_path(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(identity) = options.identity {
        config.identity = Some(identity);
    }
    if let Some(ms) = options.handshake_timeout_ms {
        config.core.handshake_timeout_ms = ms;
    }
    if let Some(secs) = options.heartbeat_secs {
        config.heartbeat.period_secs = secs;
    }
    config.validate()?;

    let deadline = options
        .run_until
        .as_deref()
        .map(parse_deadline)
        .transpose()
        .context("Invalid --run-until")?;

    let factory = Arc::new(MemoryConnectionFactory::new(
        config.address.as_deref().unwrap_or(LOOPBACK_ADDRESS),
    ));
    let mut builder = Core::builder()
        .connection_factory(factory.clone())
        .config(config.core.clone());
    if let Some(identity) = &config.identity {
        builder = builder.identity(identity);
    }
    let core = builder.build()?;
    let _heartbeat = Heartbeat::attach(&core, &config.heartbeat);

    let peer = factory
        .take_peer()
        .context("connection factory kept no router side")?;
    if options.no_welcome {
        info!(identity = %core.identity(), "Router will not answer the hello");
        tokio::spawn(async move { while peer.recv().await.is_some() {} });
    } else {
        let (_router, mut observed) = peer.serve_hello(&config.core.version, LOOPBACK_ROUTER);
        tokio::spawn(async move {
            while let Some(msg) = observed.recv().await {
                info!(
                    subsystem = %msg.subsystem,
                    sender = %msg.sender,
                    topic = %msg.arg_string(1),
                    "Router received envelope"
                );
            }
        });
    }

    if let Some(deadline) = deadline {
        let c = Arc::clone(&core);
        let stop_timeout = config.core.stop_timeout();
        core.schedule_once(deadline, move || {
            let c = Arc::clone(&c);
            async move {
                info!(identity = %c.identity(), "Run deadline reached");
                // Shutdown aborts this callback; the stop runs detached.
                tokio::spawn(async move { c.stop(Some(stop_timeout)).await });
                Ok(())
            }
        });
    }

    let (ready_tx, ready_rx) = oneshot::channel();
    let runner = Arc::clone(&core);
    let mut run = tokio::spawn(async move { runner.run(Some(ready_tx)).await });

    let c = Arc::clone(&core);
    tokio::spawn(async move {
        if ready_rx.await.is_ok() {
            println!("Agent '{}' is running. Press Ctrl-C to stop.", c.identity());
        }
    });

    let outcome = tokio::select! {
        joined = &mut run => joined,
        _ = tokio::signal::ctrl_c() => {
            println!("\nStopping agent...");
            if !core.stop(Some(config.core.stop_timeout())).await {
                warn!(identity = %core.identity(), "Agent did not finish within the stop timeout");
            }
            run.await
        }
    };

    match outcome.context("agent task failed")? {
        Ok(()) => {}
        Err(CoreError::MainLoopEnded) => warn!("Router went away"),
        Err(e) => return Err(e.into()),
    }

    if core.handshake_state() == HandshakeState::TimedOut {
        anyhow::bail!(
            "no welcome from the router within {} ms",
            config.core.handshake_timeout_ms
        );
    }
    println!("Agent '{}' stopped.", core.identity());
    Ok(())
}
