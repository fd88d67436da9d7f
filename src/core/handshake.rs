//! Hello/welcome handshake.
//!
//! ```text
//!  NotSent ──send_hello──> Sent ──welcome (matching id)──> Confirmed
//!                           │
//!                           └──no welcome within timeout──> TimedOut ──> stop()
//! ```
//!
//! `onstart`, `configuration` and the ready signal are held back until the
//! router answers, so start-up code only ever sees a connected Core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::subsystems::{subsystem_handler, SubsystemHandler};
use super::{lock, Core};
use crate::error::Result;
use crate::vip::{subsystems, Message};

/// Progress of the handshake for one Core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    NotSent,
    Sent,
    Confirmed,
    TimedOut,
}

/// What the router reported in its welcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub router: String,
    /// Identity the router assigned to this agent.
    pub identity: String,
}

pub(crate) struct Handshake {
    state: watch::Sender<HandshakeState>,
    counter: AtomicU64,
    ident: Mutex<Option<String>>,
    server: Mutex<Option<ServerInfo>>,
}

impl Handshake {
    pub(crate) fn new() -> Self {
        Self {
            state: watch::Sender::new(HandshakeState::NotSent),
            counter: AtomicU64::new(0),
            ident: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    pub(crate) fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.server).clone()
    }

    fn transition(&self, from: HandshakeState, to: HandshakeState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }
}

/// Handler registered under the `hello` subsystem.
pub(crate) fn hello_handler() -> SubsystemHandler {
    subsystem_handler(|core: Arc<Core>, message: Message| async move {
        core.handle_welcome(message).await;
        Ok(())
    })
}

impl Core {
    /// Current handshake progress.
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Router details from the welcome, once the handshake is confirmed.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.handshake.server_info()
    }

    /// Sends a `hello` with a fresh `connect.hello.<n>` id and arms the
    /// watchdog.
    pub(crate) async fn send_hello(self: &Arc<Self>) -> Result<()> {
        let n = self.handshake.counter.fetch_add(1, Ordering::Relaxed);
        let ident = format!("connect.hello.{}", n);
        *lock(&self.handshake.ident) = Some(ident.clone());
        self.handshake.state.send_replace(HandshakeState::Sent);

        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let core = Arc::clone(self);
        self.spawn(async move { core.watch_handshake(timeout).await });

        debug!(component = "handshake", identity = %self.identity, id = %ident, "Sending hello");
        let hello = Message::new("", subsystems::HELLO)
            .with_sender(&self.identity)
            .with_id(&ident)
            .with_arg("hello");
        self.connection.send_vip_message(hello).await
    }

    async fn watch_handshake(self: Arc<Self>, timeout: Duration) {
        let mut rx = self.handshake.state.subscribe();
        let confirmed = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == HandshakeState::Confirmed)).await,
            Ok(Ok(_))
        );
        if confirmed {
            return;
        }
        if !self
            .handshake
            .transition(HandshakeState::Sent, HandshakeState::TimedOut)
        {
            return;
        }

        error!(
            component = "handshake",
            identity = %self.identity,
            messagebus = %self.config.messagebus,
            timeout_ms = timeout.as_millis() as u64,
            "No response to hello message, shutting down agent"
        );
        error!(
            component = "handshake",
            identity = %self.identity,
            "A common cause is a conflicting identity or a missing auth entry on the target instance"
        );
        self.stop(Some(timeout)).await;
    }

    /// Processes a `hello` envelope; only a welcome answering the current
    /// hello id confirms the handshake.
    pub(crate) async fn handle_welcome(self: &Arc<Self>, message: Message) {
        if message.first_arg_str() != Some("welcome") {
            debug!(component = "handshake", id = %message.id, "Ignoring non-welcome hello envelope");
            return;
        }
        let expected = lock(&self.handshake.ident).clone();
        if expected.as_deref() != Some(message.id.as_str()) {
            debug!(
                component = "handshake",
                id = %message.id,
                expected = ?expected,
                "Ignoring welcome for unknown hello id"
            );
            return;
        }
        if !self
            .handshake
            .transition(HandshakeState::Sent, HandshakeState::Confirmed)
        {
            debug!(component = "handshake", id = %message.id, "Ignoring duplicate or late welcome");
            return;
        }

        let info = ServerInfo {
            version: message.arg_string(1),
            router: message.arg_string(2),
            identity: message.arg_string(3),
        };
        info!(
            component = "handshake",
            identity = %info.identity,
            version = %info.version,
            router = %info.router,
            "Connected to platform"
        );
        *lock(&self.handshake.server) = Some(info);
        self.set_connected(true);

        self.onconnected.send(Arc::clone(self)).await;
        debug!(component = "handshake", "Running onstart receivers");
        self.begin_running();
        self.configuration
            .send_by(|f| self.spawn(f), Arc::clone(self));
        self.fire_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_only_from_expected_state() {
        let hs = Handshake::new();
        assert_eq!(hs.state(), HandshakeState::NotSent);
        assert!(!hs.transition(HandshakeState::Sent, HandshakeState::Confirmed));
        hs.state.send_replace(HandshakeState::Sent);
        assert!(hs.transition(HandshakeState::Sent, HandshakeState::Confirmed));
        assert!(!hs.transition(HandshakeState::Sent, HandshakeState::TimedOut));
        assert_eq!(hs.state(), HandshakeState::Confirmed);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&HandshakeState::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
