//! Deadline scheduler
//!
//! A min-heap of `(deadline, tie_breaker, callback)` entries drained by a
//! single loop:
//!
//! ```text
//!  schedule_once / schedule_iter
//!            │ push + notify
//!            ▼
//!   ┌─────────────────┐   pop due    ┌──────────────┐
//!   │ BinaryHeap<Entry>│────────────>│ JoinSet task │  (one per firing)
//!   └─────────────────┘              └──────────────┘
//!            ▲   wait: min(hard_cap, next_deadline - now)
//!            └── run() loop
//! ```
//!
//! Cancellation is lazy: the entry stays in the heap and is skipped when it
//! is popped. Iterator-driven schedules pull their next deadline when the
//! current one is popped, before the callback runs, so a late wake-up never
//! shifts the rest of the grid.
//!
//! The loop owns the `JoinSet` of in-flight callbacks. Aborting the task
//! that runs [`Scheduler::run`] aborts every in-flight callback and fires
//! nothing further.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::{panic_message, Result};
pub use crate::utils::time::IntoDeadline;
use crate::utils::time::until;

/// Default upper bound on a single wait of the loop.
pub const DEFAULT_HARD_CAP: Duration = Duration::from_secs(5);

/// A callback the scheduler can fire, possibly many times.
pub type ScheduledCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps an async closure into a [`ScheduledCallback`].
pub fn callback<F, Fut>(f: F) -> ScheduledCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(f()) })
}

type DeadlineIter = Box<dyn Iterator<Item = DateTime<Utc>> + Send>;

// ============================================================================
// ScheduledEvent
// ============================================================================

#[derive(Debug, Default)]
struct EventFlags {
    canceled: AtomicBool,
    finished: AtomicBool,
}

/// Handle to one scheduled callback (or one chain of iterator deadlines).
///
/// Clones share the same flags.
#[derive(Debug, Clone, Default)]
pub struct ScheduledEvent {
    flags: Arc<EventFlags>,
}

impl ScheduledEvent {
    /// Suppresses the pending firing. For iterator schedules the whole chain
    /// stops; the event becomes finished when the scheduler skips it.
    pub fn cancel(&self) {
        self.flags.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flags.canceled.load(Ordering::SeqCst)
    }

    /// True once the callback ran for the last time or a canceled entry was
    /// skipped.
    pub fn is_finished(&self) -> bool {
        self.flags.finished.load(Ordering::SeqCst)
    }

    fn finish(&self) {
        self.flags.finished.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Heap entries
// ============================================================================

struct Entry {
    deadline: DateTime<Utc>,
    seq: u64,
    event: ScheduledEvent,
    callback: ScheduledCallback,
    rest: Option<DeadlineIter>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so `BinaryHeap` pops the earliest deadline, then the lowest seq.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Deadline scheduler owned by a `Core`.
pub struct Scheduler {
    heap: Mutex<BinaryHeap<Entry>>,
    counter: AtomicU64,
    wake: Notify,
    hard_cap: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_HARD_CAP)
    }
}

impl Scheduler {
    pub fn new(hard_cap: Duration) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            counter: AtomicU64::new(0),
            wake: Notify::new(),
            hard_cap: hard_cap.max(Duration::from_millis(1)),
        }
    }

    pub fn hard_cap(&self) -> Duration {
        self.hard_cap
    }

    /// Fires `callback` once at `deadline`.
    pub fn schedule_once(
        &self,
        deadline: impl IntoDeadline,
        callback: ScheduledCallback,
    ) -> ScheduledEvent {
        let event = ScheduledEvent::default();
        self.push(deadline.into_deadline(), event.clone(), callback, None);
        event
    }

    /// Fires `callback` at every deadline the iterator yields.
    ///
    /// Only the next deadline is ever in the heap; an iterator that is empty
    /// from the start finishes the event without calling `callback`.
    pub fn schedule_iter<I>(&self, deadlines: I, callback: ScheduledCallback) -> ScheduledEvent
    where
        I: IntoIterator,
        I::Item: IntoDeadline + 'static,
        I::IntoIter: Send + 'static,
    {
        let event = ScheduledEvent::default();
        let mut rest: DeadlineIter =
            Box::new(deadlines.into_iter().map(IntoDeadline::into_deadline));
        match rest.next() {
            Some(first) => self.push(first, event.clone(), callback, Some(rest)),
            None => event.finish(),
        }
        event
    }

    /// Number of heap entries, including canceled ones not yet skipped.
    pub fn len(&self) -> usize {
        self.lock_heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline in the heap.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.lock_heap().peek().map(|e| e.deadline)
    }

    fn lock_heap(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Entry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(
        &self,
        deadline: DateTime<Utc>,
        event: ScheduledEvent,
        callback: ScheduledCallback,
        rest: Option<DeadlineIter>,
    ) {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        self.lock_heap().push(Entry {
            deadline,
            seq,
            event,
            callback,
            rest,
        });
        self.wake.notify_one();
    }

    /// Pops every entry due at `now`, in (deadline, seq) order.
    fn pop_due(&self, now: DateTime<Utc>) -> Vec<Entry> {
        let mut heap = self.lock_heap();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|e| e.deadline <= now) {
            if let Some(entry) = heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    fn timeout(&self, now: DateTime<Utc>) -> Duration {
        match self.next_deadline() {
            Some(deadline) => until(deadline, now).min(self.hard_cap),
            None => self.hard_cap,
        }
    }

    /// Re-arms an iterator entry and reports whether this firing is its last.
    fn rearm(&self, entry: &mut Entry) -> bool {
        let Some(mut rest) = entry.rest.take() else {
            return true;
        };
        match rest.next() {
            Some(next) => {
                self.push(
                    next,
                    entry.event.clone(),
                    Arc::clone(&entry.callback),
                    Some(rest),
                );
                false
            }
            None => true,
        }
    }

    fn fire(&self, mut entry: Entry, inflight: &mut JoinSet<()>) {
        if entry.event.is_canceled() {
            debug!(component = "scheduler", seq = entry.seq, "Skipping canceled entry");
            entry.event.finish();
            return;
        }
        let last = self.rearm(&mut entry);
        let Entry {
            seq,
            event,
            callback,
            ..
        } = entry;
        inflight.spawn(async move {
            match AssertUnwindSafe(callback()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(component = "scheduler", seq, error = %e, "Scheduled callback failed");
                }
                Err(payload) => {
                    error!(
                        component = "scheduler",
                        seq,
                        panic = %panic_message(payload.as_ref()),
                        "Scheduled callback panicked"
                    );
                }
            }
            if last {
                event.finish();
            }
        });
    }

    /// Runs the loop until the surrounding task is aborted.
    pub async fn run(&self) {
        let mut inflight = JoinSet::new();
        debug!(component = "scheduler", hard_cap_ms = self.hard_cap.as_millis() as u64, "Scheduler loop started");
        loop {
            for entry in self.pop_due(Utc::now()) {
                self.fire(entry, &mut inflight);
            }

            let timeout = self.timeout(Utc::now());
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(timeout) => {}
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            error!(component = "scheduler", error = %e, "Scheduled task failed");
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.len())
            .field("hard_cap", &self.hard_cap)
            .finish()
    }
}
