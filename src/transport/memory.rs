//! In-process transport.
//!
//! `MemoryConnection` is the agent side of a pair of bounded MPSC queues;
//! `MemoryPeer` is the router side. It backs the demo binary and the tests,
//! and is a reference for real transports.
//!
//! ```text
//! ┌──────────────────┐   outbound    ┌──────────────┐
//! │ MemoryConnection │──────────────>│  MemoryPeer  │
//! │   (agent side)   │<──────────────│ (router side)│
//! └──────────────────┘   inbound     └──────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Connection, ConnectionFactory};
use crate::credentials::Credentials;
use crate::error::{CoreError, Result};
use crate::vip::{subsystems, Message};

/// Default buffer size for both directions
const DEFAULT_BUFFER_SIZE: usize = 100;

/// Agent side of an in-process session.
pub struct MemoryConnection {
    address: String,
    connected: AtomicBool,
    inbound_rx: Mutex<mpsc::Receiver<Message>>,
    outbound_tx: mpsc::Sender<Message>,
}

/// Router side of an in-process session.
///
/// Dropping the peer closes the agent's inbound queue, which ends the
/// agent's receive loop.
pub struct MemoryPeer {
    inbound_tx: mpsc::Sender<Message>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl MemoryConnection {
    /// Creates a connected pair with the default buffer size.
    ///
    /// # Example
    /// ```
    /// use vipcore::transport::MemoryConnection;
    ///
    /// let (conn, peer) = MemoryConnection::pair("inproc://test");
    /// # drop((conn, peer));
    /// ```
    pub fn pair(address: &str) -> (MemoryConnection, MemoryPeer) {
        Self::with_buffer_size(address, DEFAULT_BUFFER_SIZE)
    }

    /// Creates a pair with a custom buffer size for each direction.
    pub fn with_buffer_size(address: &str, buffer_size: usize) -> (MemoryConnection, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);
        let conn = MemoryConnection {
            address: address.to_string(),
            connected: AtomicBool::new(false),
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
        };
        let peer = MemoryPeer {
            inbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
        };
        (conn, peer)
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn connect(&self) -> Result<()> {
        if self.outbound_tx.is_closed() {
            return Err(CoreError::Transport(format!(
                "no router listening at {}",
                self.address
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(address = %self.address, "Memory connection established");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_vip_message(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(CoreError::Transport("not connected".to_string()));
        }
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| CoreError::BusClosed)
    }

    async fn receive_vip_message(&self) -> Result<Option<Message>> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }
}

impl MemoryPeer {
    /// Delivers an envelope to the agent.
    ///
    /// # Errors
    /// Returns `CoreError::BusClosed` if the agent side has been dropped.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| CoreError::BusClosed)
    }

    /// Tries to deliver an envelope without waiting for buffer space.
    pub fn try_send(&self, msg: Message) -> Result<()> {
        self.inbound_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CoreError::Transport("inbound buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => CoreError::BusClosed,
        })
    }

    /// Waits for the next envelope sent by the agent.
    ///
    /// Returns `None` once the agent side has been dropped.
    pub async fn recv(&self) -> Option<Message> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Returns a clone of the sender feeding the agent's inbound queue.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.inbound_tx.clone()
    }

    /// Runs a minimal router: every `hello` is answered with a `welcome`
    /// carrying `version`, `router` and the sender's identity; every other
    /// envelope is forwarded to the returned receiver.
    ///
    /// The task ends when the agent side is dropped.
    pub fn serve_hello(
        self,
        version: &str,
        router: &str,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<Message>) {
        let (observed_tx, observed_rx) = mpsc::unbounded_channel();
        let version = version.to_string();
        let router = router.to_string();
        let handle = tokio::spawn(async move {
            while let Some(msg) = self.recv().await {
                if msg.subsystem == subsystems::HELLO && msg.first_arg_str() == Some("hello") {
                    let welcome = Message::reply_to(&msg, subsystems::HELLO).with_args(vec![
                        Value::from("welcome"),
                        Value::from(version.clone()),
                        Value::from(router.clone()),
                        Value::from(msg.sender.clone()),
                    ]);
                    if self.send(welcome).await.is_err() {
                        break;
                    }
                } else if observed_tx.send(msg).is_err() {
                    debug!("Loopback router observer dropped");
                }
            }
        });
        (handle, observed_rx)
    }
}

/// Factory handing out one in-process pair per `build` call.
///
/// The router side of the most recent pair is kept until taken with
/// [`MemoryConnectionFactory::take_peer`].
pub struct MemoryConnectionFactory {
    address: String,
    peer: std::sync::Mutex<Option<MemoryPeer>>,
}

impl MemoryConnectionFactory {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            peer: std::sync::Mutex::new(None),
        }
    }

    /// Takes the router side of the last built connection.
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

impl ConnectionFactory for MemoryConnectionFactory {
    fn address(&self) -> &str {
        &self.address
    }

    fn build(&self, credentials: &Credentials) -> Result<Arc<dyn Connection>> {
        debug!(identity = %credentials.identity, address = %self.address, "Building memory connection");
        let (conn, peer) = MemoryConnection::pair(&self.address);
        *self
            .peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(peer);
        Ok(Arc::new(conn))
    }
}
