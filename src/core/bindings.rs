//! Declarative bindings.
//!
//! An agent lists its periodic jobs, one-shot deadlines and lifecycle
//! receivers up front and hands them to [`Core::bind`]; the Core wires them
//! in during the first step of `run`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use vipcore::core::{Bindings, LifecycleSignal};
//! use vipcore::signal::handler;
//!
//! let bindings = Bindings::new()
//!     .owner("historian")
//!     .periodic(Duration::from_secs(30), None, || async { Ok(()) })
//!     .receiver(
//!         LifecycleSignal::Start,
//!         handler(|core: std::sync::Arc<vipcore::core::Core>| async move {
//!             println!("{} started", core.identity());
//!             Ok(())
//!         }),
//!     );
//! assert_eq!(bindings.len(), 2);
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::Core;
use crate::error::Result;
use crate::scheduler::{callback, IntoDeadline, ScheduledCallback};
use crate::signal::{Signal, SignalHandler};

/// Lifecycle signals a binding can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSignal {
    Setup,
    Start,
    Stop,
    Finish,
    Connected,
    Disconnected,
    Configuration,
}

impl LifecycleSignal {
    /// The Core's signal for this variant.
    pub fn of(self, core: &Core) -> &Signal<Arc<Core>> {
        match self {
            LifecycleSignal::Setup => &core.onsetup,
            LifecycleSignal::Start => &core.onstart,
            LifecycleSignal::Stop => &core.onstop,
            LifecycleSignal::Finish => &core.onfinish,
            LifecycleSignal::Connected => &core.onconnected,
            LifecycleSignal::Disconnected => &core.ondisconnected,
            LifecycleSignal::Configuration => &core.configuration,
        }
    }
}

pub(crate) struct PeriodicBinding {
    pub(crate) period: Duration,
    pub(crate) wait: Option<Duration>,
    pub(crate) callback: ScheduledCallback,
}

pub(crate) enum Binding {
    Periodic(PeriodicBinding),
    At {
        deadline: DateTime<Utc>,
        callback: ScheduledCallback,
    },
    Receiver {
        signal: LifecycleSignal,
        handler: SignalHandler<Arc<Core>>,
    },
}

/// Builder for a list of bindings.
#[derive(Default)]
pub struct Bindings {
    pub(crate) owner: Option<String>,
    pub(crate) entries: Vec<Binding>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner name used when connecting receivers, so they can be removed
    /// together with `Signal::disconnect_owner`.
    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    /// Runs `f` every `period` once `onstart` fires. The first call comes
    /// `wait` after start, or one full period after start when `wait` is
    /// `None`.
    pub fn periodic<F, Fut>(mut self, period: Duration, wait: Option<Duration>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.entries.push(Binding::Periodic(PeriodicBinding {
            period,
            wait,
            callback: callback(f),
        }));
        self
    }

    /// Runs `f` once at `deadline`. The deadline is fixed now, not at setup.
    pub fn schedule_at<F, Fut>(mut self, deadline: impl IntoDeadline, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.entries.push(Binding::At {
            deadline: deadline.into_deadline(),
            callback: callback(f),
        });
        self
    }

    /// Connects `handler` to `signal` at setup.
    pub fn receiver(mut self, signal: LifecycleSignal, handler: SignalHandler<Arc<Core>>) -> Self {
        self.entries.push(Binding::Receiver { signal, handler });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("owner", &self.owner)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::handler;

    #[test]
    fn test_builder_collects_entries() {
        let bindings = Bindings::new()
            .owner("agent")
            .periodic(Duration::from_secs(1), Some(Duration::ZERO), || async { Ok(()) })
            .schedule_at(Duration::from_secs(10), || async { Ok(()) })
            .receiver(
                LifecycleSignal::Stop,
                handler(|_core: Arc<Core>| async { Ok(()) }),
            );
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings.owner.as_deref(), Some("agent"));
        assert!(matches!(bindings.entries[0], Binding::Periodic(_)));
        assert!(matches!(bindings.entries[1], Binding::At { .. }));
        assert!(matches!(
            bindings.entries[2],
            Binding::Receiver {
                signal: LifecycleSignal::Stop,
                ..
            }
        ));
    }

    #[test]
    fn test_empty() {
        assert!(Bindings::new().is_empty());
    }
}
