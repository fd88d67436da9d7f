//! Cross-context dispatcher
//!
//! Lets foreign OS threads (and other tasks) run closures on the Core's own
//! execution context. Calls are queued FIFO on an unbounded channel and
//! drained by [`Dispatcher::run`], which the Core drives for as long as it
//! runs.
//!
//! ```text
//! foreign thread ── post / post_and_wait ──┐
//! async task ────── call ──────────────────┼──> queue ──> run() (Core context)
//! worker thread ─── run_in_background ─────┘                  │
//!                                                  oneshot <──┘ result / panic
//! ```
//!
//! A panicking call is captured and reported to whoever waits for it as
//! `CoreError::CallPanicked`; the drain loop keeps going.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, error};

use crate::error::{panic_message, CoreError, Result};

type Call = Box<dyn FnOnce() + Send>;
type Outcome<T> = std::result::Result<T, String>;

/// Sending half of the queue; cheap to clone into worker threads.
#[derive(Clone)]
struct Queue {
    tx: mpsc::UnboundedSender<Call>,
    closed: Arc<AtomicBool>,
}

impl Queue {
    fn post(&self, call: Call) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::DispatcherClosed);
        }
        self.tx.send(call).map_err(|_| CoreError::DispatcherClosed)
    }
}

fn run_captured<T, F>(f: F) -> Outcome<T>
where
    F: FnOnce() -> T,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn discard(rx: &mut mpsc::UnboundedReceiver<Call>) {
    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(component = "dispatch", dropped, "Dropped queued calls on close");
    }
}

fn into_result<T>(received: std::result::Result<Outcome<T>, oneshot::error::RecvError>) -> Result<T> {
    match received {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(panic)) => Err(CoreError::CallPanicked(panic)),
        Err(_) => Err(CoreError::DispatcherClosed),
    }
}

/// Queue of calls to run on the Core's execution context.
pub struct Dispatcher {
    queue: Queue,
    rx: Mutex<mpsc::UnboundedReceiver<Call>>,
    closing: Notify,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            queue: Queue {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx: Mutex::new(rx),
            closing: Notify::new(),
        }
    }

    /// Enqueues `f` without waiting. It runs later on the draining context.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.post(Box::new(f))
    }

    /// Runs `f` on the draining context and blocks this thread for the result.
    ///
    /// The return type of `f` is passed through untouched, so a fallible
    /// closure yields `Ok(Err(e))` with its own error type. A panic in `f`
    /// becomes `CoreError::CallPanicked`.
    ///
    /// # Panics
    /// Must be called from a thread outside the async runtime; blocking a
    /// runtime worker panics inside tokio. Async callers use [`Dispatcher::call`].
    pub fn post_and_wait<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(run_captured(f));
        })?;
        into_result(rx.blocking_recv())
    }

    /// Async form of [`Dispatcher::post_and_wait`].
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(run_captured(f));
        })?;
        into_result(rx.await)
    }

    /// Runs `f` on a new OS thread and delivers the outcome back through the
    /// queue.
    pub fn run_in_background_thread<T, F>(&self, f: F) -> BackgroundTask<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Outcome<T>>();
        let queue = self.queue.clone();
        let spawned = std::thread::Builder::new()
            .name("vipcore-background".to_string())
            .spawn(move || {
                let outcome = run_captured(f);
                if queue
                    .post(Box::new(move || {
                        let _ = tx.send(outcome);
                    }))
                    .is_err()
                {
                    debug!(component = "dispatch", "Background result dropped: dispatcher closed");
                }
            });

        match spawned {
            Ok(_) => BackgroundTask {
                inner: Box::pin(async move { into_result(rx.await) }),
            },
            Err(e) => BackgroundTask {
                inner: Box::pin(async move { Err(CoreError::Io(e)) }),
            },
        }
    }

    /// Drains the queue until the dispatcher is closed or the surrounding
    /// task is aborted.
    pub async fn run(&self) {
        let mut rx = self.rx.lock().await;
        while !self.is_closed() {
            let next = tokio::select! {
                call = rx.recv() => call,
                _ = self.closing.notified() => None,
            };
            let Some(call) = next else { break };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(call)) {
                error!(
                    component = "dispatch",
                    panic = %panic_message(payload.as_ref()),
                    "Posted call panicked"
                );
            }
        }
        discard(&mut rx);
    }

    /// Stops accepting calls and drops everything still queued; anyone
    /// waiting on a dropped call gets `CoreError::DispatcherClosed`.
    pub fn close(&self) {
        self.queue.closed.store(true, Ordering::SeqCst);
        self.closing.notify_one();
        if let Ok(mut rx) = self.rx.try_lock() {
            discard(&mut rx);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outcome of [`Dispatcher::run_in_background_thread`].
pub struct BackgroundTask<T> {
    inner: BoxFuture<'static, Result<T>>,
}

impl<T> Future for BackgroundTask<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn start(dispatcher: &Arc<Dispatcher>) -> tokio::task::JoinHandle<()> {
        let d = Arc::clone(dispatcher);
        tokio::spawn(async move { d.run().await })
    }

    #[tokio::test]
    async fn test_post_runs_in_fifo_order() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            dispatcher.post(move || log.lock().unwrap().push(i)).unwrap();
        }
        // Queued before draining starts.
        assert!(log.lock().unwrap().is_empty());

        let handle = start(&dispatcher);
        let last = dispatcher.call(|| 99).await.unwrap();
        assert_eq!(last, 99);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cross_thread_panic_then_value() {
        let dispatcher = Arc::new(Dispatcher::new());
        let handle = start(&dispatcher);

        let d = Arc::clone(&dispatcher);
        let (first, second) = std::thread::spawn(move || {
            let first = d.post_and_wait(|| -> i32 { panic!("attempt to divide by zero") });
            let second = d.post_and_wait(|| 42);
            (first, second)
        })
        .join()
        .unwrap();

        match first {
            Err(CoreError::CallPanicked(msg)) => assert!(msg.contains("divide by zero")),
            other => panic!("expected CallPanicked, got {:?}", other),
        }
        assert_eq!(second.unwrap(), 42);
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_error_type_is_preserved() {
        let dispatcher = Arc::new(Dispatcher::new());
        let handle = start(&dispatcher);

        let d = Arc::clone(&dispatcher);
        let result = std::thread::spawn(move || d.post_and_wait(|| "nope".parse::<i32>()))
            .join()
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        handle.abort();
    }

    #[tokio::test]
    async fn test_background_thread_result() {
        let dispatcher = Arc::new(Dispatcher::new());
        let handle = start(&dispatcher);

        let value = dispatcher
            .run_in_background_thread(|| {
                std::thread::sleep(Duration::from_millis(20));
                std::thread::current().name().map(str::to_string)
            })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("vipcore-background"));

        let failed = dispatcher
            .run_in_background_thread(|| -> u32 { panic!("worker failed") })
            .await;
        assert!(matches!(failed, Err(CoreError::CallPanicked(_))));
        handle.abort();
    }

    #[tokio::test]
    async fn test_panicking_post_does_not_stop_drain() {
        let dispatcher = Arc::new(Dispatcher::new());
        let handle = start(&dispatcher);
        dispatcher.post(|| panic!("posted call failed")).unwrap();
        assert_eq!(dispatcher.call(|| "still draining").await.unwrap(), "still draining");
        handle.abort();
    }

    #[tokio::test]
    async fn test_close_rejects_and_releases_waiters() {
        let dispatcher = Arc::new(Dispatcher::new());
        let d = Arc::clone(&dispatcher);
        let waiter = tokio::spawn(async move { d.call(|| 1).await });
        tokio::task::yield_now().await;

        dispatcher.close();
        assert!(dispatcher.is_closed());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(CoreError::DispatcherClosed)
        ));
        assert!(matches!(
            dispatcher.post(|| {}),
            Err(CoreError::DispatcherClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_ends_running_drain() {
        let dispatcher = Arc::new(Dispatcher::new());
        let handle = start(&dispatcher);
        tokio::task::yield_now().await;

        dispatcher.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            dispatcher.call(|| 1).await,
            Err(CoreError::DispatcherClosed)
        ));
    }
}
