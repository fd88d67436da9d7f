//! Signal bus
//!
//! A `Signal` is a named broadcast point. Receivers are connected in order
//! and every emission runs all of them:
//!
//! - [`Signal::send`] awaits each receiver in-line, in connection order.
//! - [`Signal::send_by`] hands each receiver to a spawner and returns the
//!   task handles so the caller can wait for all of them.
//!
//! A receiver that fails (returns `Err` or panics) is logged; the remaining
//! receivers still run and the signal itself never fails.
//!
//! Signals are owned by their `Core`. Receivers stay connected until they
//! are explicitly removed with [`Signal::disconnect`] or
//! [`Signal::disconnect_owner`].
//!
//! # Example
//!
//! ```
//! use vipcore::signal::Signal;
//!
//! # tokio_test::block_on(async {
//! let onstart: Signal<String> = Signal::new("onstart");
//! onstart.connect_fn(Some("historian"), |name: String| async move {
//!     println!("{} started", name);
//!     Ok(())
//! });
//! onstart.send("agent-1".to_string()).await;
//! # })
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::{panic_message, Result};

/// Future returned by a signal receiver.
pub type SignalFuture = BoxFuture<'static, Result<()>>;

/// A connected receiver. Cloning shares the allocation, which is what the
/// duplicate-connect check compares.
pub type SignalHandler<T> = Arc<dyn Fn(T) -> SignalFuture + Send + Sync>;

/// Wraps an async closure into a [`SignalHandler`].
pub fn handler<T, F, Fut>(f: F) -> SignalHandler<T>
where
    T: 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: T| -> SignalFuture { Box::pin(f(ctx)) })
}

/// Identifies one connection on one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

struct Receiver<T> {
    id: ReceiverId,
    owner: Option<String>,
    handler: SignalHandler<T>,
}

/// Named broadcast channel with ordered receivers.
pub struct Signal<T> {
    name: &'static str,
    receivers: RwLock<Vec<Receiver<T>>>,
    next_id: AtomicU64,
}

fn same_handler<T>(a: &SignalHandler<T>, b: &SignalHandler<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl<T> Signal<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            receivers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Connects `handler` under `owner`.
    ///
    /// Connecting the same handler allocation under the same owner again is
    /// a no-op returning the original id; anything else is appended.
    pub fn connect(&self, handler: SignalHandler<T>, owner: Option<&str>) -> ReceiverId {
        let mut receivers = self
            .receivers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = receivers
            .iter()
            .find(|r| r.owner.as_deref() == owner && same_handler(&r.handler, &handler))
        {
            return existing.id;
        }
        let id = ReceiverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        receivers.push(Receiver {
            id,
            owner: owner.map(str::to_string),
            handler,
        });
        id
    }

    /// Connects an async closure under `owner`.
    pub fn connect_fn<F, Fut>(&self, owner: Option<&str>, f: F) -> ReceiverId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.connect(handler(f), owner)
    }

    /// Removes one receiver. Returns `false` if it was not connected.
    pub fn disconnect(&self, id: ReceiverId) -> bool {
        let mut receivers = self
            .receivers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = receivers.len();
        receivers.retain(|r| r.id != id);
        receivers.len() < before
    }

    /// Removes every receiver connected under `owner`, returning how many.
    pub fn disconnect_owner(&self, owner: &str) -> usize {
        let mut receivers = self
            .receivers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = receivers.len();
        receivers.retain(|r| r.owner.as_deref() != Some(owner));
        before - receivers.len()
    }

    pub fn len(&self) -> usize {
        self.receivers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(ReceiverId, SignalHandler<T>)> {
        self.receivers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|r| (r.id, Arc::clone(&r.handler)))
            .collect()
    }

    /// Runs every receiver in connection order, one after the other.
    pub async fn send(&self, ctx: T) {
        for (id, handler) in self.snapshot() {
            let ctx = ctx.clone();
            let outcome = AssertUnwindSafe(async move { handler(ctx).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(signal = self.name, receiver = id.0, error = %e, "Signal receiver failed");
                }
                Err(payload) => {
                    error!(
                        signal = self.name,
                        receiver = id.0,
                        panic = %panic_message(payload.as_ref()),
                        "Signal receiver panicked"
                    );
                }
            }
        }
    }

    /// Submits every receiver to `spawner` instead of running it in-line.
    ///
    /// Receiver errors and panics are logged inside the spawned task, so the
    /// returned handles only ever resolve to `Ok(())` unless aborted.
    pub fn send_by<S>(&self, spawner: S, ctx: T) -> Vec<JoinHandle<()>>
    where
        S: Fn(BoxFuture<'static, ()>) -> JoinHandle<()>,
    {
        let name = self.name;
        self.snapshot()
            .into_iter()
            .map(|(id, handler)| {
                let ctx = ctx.clone();
                spawner(Box::pin(async move {
                    let outcome = AssertUnwindSafe(async move { handler(ctx).await })
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(signal = name, receiver = id.0, error = %e, "Signal receiver failed");
                        }
                        Err(payload) => {
                            error!(
                                signal = name,
                                receiver = id.0,
                                panic = %panic_message(payload.as_ref()),
                                "Signal receiver panicked"
                            );
                        }
                    }
                }))
            })
            .collect()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .receivers
            .read()
            .map(|r| r.len())
            .unwrap_or_default();
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("receivers", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> SignalHandler<u32>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |tag: &str| {
            let log = Arc::clone(&log2);
            let tag = tag.to_string();
            handler(move |n: u32| {
                let log = Arc::clone(&log);
                let tag = tag.clone();
                async move {
                    log.lock().unwrap().push(format!("{}:{}", tag, n));
                    Ok(())
                }
            })
        };
        (log, make)
    }

    #[tokio::test]
    async fn test_send_in_connection_order() {
        let signal = Signal::new("onstart");
        let (log, make) = recorder();
        signal.connect(make("a"), None);
        signal.connect(make("b"), None);
        signal.connect(make("c"), Some("owner"));

        signal.send(7).await;
        assert_eq!(*log.lock().unwrap(), vec!["a:7", "b:7", "c:7"]);
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let signal = Signal::new("onstop");
        let (log, make) = recorder();
        signal.connect(make("first"), None);
        signal.connect_fn(None, |_n: u32| async move {
            Err(CoreError::Config("broken receiver".into()))
        });
        signal.connect_fn(None, |n: u32| async move {
            assert_eq!(n, u32::MAX, "receiver blew up");
            Ok(())
        });
        signal.connect(make("last"), None);

        signal.send(1).await;
        assert_eq!(*log.lock().unwrap(), vec!["first:1", "last:1"]);
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_noop() {
        let signal = Signal::new("onsetup");
        let (log, make) = recorder();
        let h = make("dup");

        let id1 = signal.connect(Arc::clone(&h), Some("agent"));
        let id2 = signal.connect(Arc::clone(&h), Some("agent"));
        assert_eq!(id1, id2);
        assert_eq!(signal.len(), 1);

        // Same handler under a different owner is a separate receiver.
        let id3 = signal.connect(Arc::clone(&h), Some("other"));
        assert_ne!(id1, id3);
        assert_eq!(signal.len(), 2);

        signal.send(3).await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_and_disconnect_owner() {
        let signal = Signal::new("onfinish");
        let (log, make) = recorder();
        let a = signal.connect(make("a"), Some("x"));
        signal.connect(make("b"), Some("y"));
        signal.connect(make("c"), Some("y"));

        assert!(signal.disconnect(a));
        assert!(!signal.disconnect(a));
        assert_eq!(signal.disconnect_owner("y"), 2);
        assert!(signal.is_empty());

        signal.send(0).await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_by_returns_handles() {
        let signal = Signal::new("onstop");
        let (log, make) = recorder();
        signal.connect(make("a"), None);
        signal.connect(make("b"), None);

        let handles = signal.send_by(tokio::spawn, 5);
        assert_eq!(handles.len(), 2);
        for h in handles {
            h.await.unwrap();
        }
        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a:5", "b:5"]);
    }

    #[tokio::test]
    async fn test_send_by_contains_panics() {
        let signal: Signal<u32> = Signal::new("onstart");
        signal.connect_fn(None, |n: u32| async move {
            assert_eq!(n, u32::MAX, "boom");
            Ok(())
        });
        let (log, make) = recorder();
        signal.connect(make("after"), None);

        let handles = signal.send_by(tokio::spawn, 0);
        assert_eq!(handles.len(), 2);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec!["after:0"]);
    }
}
