//! Heartbeat service implementation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::core::Core;
use crate::error::{CoreError, Result};
use crate::scheduler::ScheduledEvent;
use crate::vip::{subsystems, Message};

/// Owner name the heartbeat's signal receivers are connected under.
pub const HEARTBEAT_OWNER: &str = "heartbeat";

/// Status value published when no status source is configured.
pub const DEFAULT_STATUS: &str = "GOOD";

/// Header carrying the publish time.
pub const TIMESTAMP_HEADER: &str = "TimeStamp";

/// Supplies the status value of each heartbeat.
pub type StatusSource = Arc<dyn Fn() -> Value + Send + Sync>;

/// Structured result from a heartbeat tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResult {
    /// When the tick ran.
    pub timestamp: DateTime<Utc>,
    /// Whether the publish reached the transport.
    pub delivered: bool,
    /// Error message if the tick failed.
    pub error: Option<String>,
}

impl HeartbeatResult {
    fn ok(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            delivered: true,
            error: None,
        }
    }

    fn err(timestamp: DateTime<Utc>, msg: &str) -> Self {
        Self {
            timestamp,
            delivered: false,
            error: Some(msg.to_string()),
        }
    }
}

/// Topic a given identity publishes its heartbeat on.
pub fn heartbeat_topic(identity: &str) -> String {
    format!("heartbeat/{}", identity)
}

/// Periodic presence publication for one Core.
///
/// Started on `onstart` when `autostart` is set. A failed publish stops the
/// heartbeat and marks a connect error; the next `onconnected` restarts it.
pub struct Heartbeat {
    core: Weak<Core>,
    autostart: bool,
    period: Mutex<Duration>,
    enabled: AtomicBool,
    connect_error: AtomicBool,
    /// Count of consecutive failed ticks.
    consecutive_failures: AtomicU32,
    /// Threshold before warning about missed heartbeats.
    failure_alert_threshold: u32,
    status: StatusSource,
    scheduled: Mutex<Option<ScheduledEvent>>,
}

impl Heartbeat {
    /// Creates the heartbeat and connects it to `core`'s lifecycle signals.
    pub fn attach(core: &Arc<Core>, config: &HeartbeatConfig) -> Arc<Self> {
        Self::attach_with_status(core, config, Arc::new(|| Value::from(DEFAULT_STATUS)))
    }

    /// Like [`Heartbeat::attach`], publishing whatever `status` returns.
    pub fn attach_with_status(
        core: &Arc<Core>,
        config: &HeartbeatConfig,
        status: StatusSource,
    ) -> Arc<Self> {
        let heartbeat = Arc::new(Self {
            core: Arc::downgrade(core),
            autostart: config.autostart,
            period: Mutex::new(config.period()),
            enabled: AtomicBool::new(false),
            connect_error: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            failure_alert_threshold: config.failure_alert_threshold,
            status,
            scheduled: Mutex::new(None),
        });

        let hb = Arc::clone(&heartbeat);
        core.onstart
            .connect_fn(Some(HEARTBEAT_OWNER), move |_core: Arc<Core>| {
                let hb = Arc::clone(&hb);
                async move {
                    if hb.autostart {
                        hb.start()?;
                    }
                    Ok(())
                }
            });

        let hb = Arc::clone(&heartbeat);
        core.onconnected
            .connect_fn(Some(HEARTBEAT_OWNER), move |_core: Arc<Core>| {
                let hb = Arc::clone(&hb);
                async move { hb.reconnect() }
            });

        heartbeat
    }

    /// Starts publishing every period, first publish right away. No-op when
    /// already enabled.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(core) = self.core.upgrade() else {
            self.enabled.store(false, Ordering::SeqCst);
            return Err(CoreError::NotRunning);
        };
        let period = self.period();
        let hb = Arc::clone(self);
        let event = core.schedule_periodic(period, Some(Duration::ZERO), move || {
            let hb = Arc::clone(&hb);
            async move {
                hb.publish().await;
                Ok(())
            }
        });
        *self.lock_scheduled() = Some(event);
        info!(component = "heartbeat", identity = %core.identity(), period_secs = period.as_secs_f64(), "Heartbeat started");
        Ok(())
    }

    /// Sets the period, then starts.
    pub fn start_with_period(self: &Arc<Self>, period: Duration) -> Result<()> {
        self.set_period(period)?;
        self.start()
    }

    /// Stops publishing. No-op when not enabled.
    pub fn stop(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(event) = self.lock_scheduled().take() {
            event.cancel();
        }
        debug!(component = "heartbeat", "Heartbeat stopped");
    }

    /// Stop then start with the current period; publishes immediately.
    pub fn restart(self: &Arc<Self>) -> Result<()> {
        self.stop();
        self.start()
    }

    /// Changes the period, restarting when enabled.
    pub fn set_period(self: &Arc<Self>, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(CoreError::Config("heartbeat period must be greater than 0".to_string()));
        }
        if self.is_enabled() {
            self.stop();
            *self.lock_period() = period;
            self.start()
        } else {
            *self.lock_period() = period;
            Ok(())
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn period(&self) -> Duration {
        *self.lock_period()
    }

    /// True after a failed publish, until the next `onconnected`.
    pub fn has_connect_error(&self) -> bool {
        self.connect_error.load(Ordering::SeqCst)
    }

    /// Returns the current count of consecutive failed ticks.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Returns true if fewer ticks than the alert threshold failed in a row.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures() < self.failure_alert_threshold
    }

    fn reconnect(self: &Arc<Self>) -> Result<()> {
        if self.connect_error.load(Ordering::SeqCst) {
            info!(component = "heartbeat", "Restarting heartbeat after reconnect");
            self.restart()?;
            self.connect_error.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Builds the publish envelope for `identity`.
    pub fn envelope(identity: &str, now: DateTime<Utc>, status: Value) -> Message {
        Message::new("", subsystems::PUBSUB)
            .with_sender(identity)
            .with_args(vec![
                Value::from("publish"),
                Value::from(heartbeat_topic(identity)),
                json!({ TIMESTAMP_HEADER: now.to_rfc3339_opts(SecondsFormat::Micros, true) }),
                status,
            ])
    }

    /// Publishes one heartbeat now.
    pub async fn publish(&self) -> HeartbeatResult {
        let now = Utc::now();
        let Some(core) = self.core.upgrade() else {
            return HeartbeatResult::err(now, "core dropped");
        };
        let message = Self::envelope(core.identity(), now, (self.status)());

        match core.send_vip(message).await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                debug!(component = "heartbeat", identity = %core.identity(), "Heartbeat published");
                HeartbeatResult::ok(now)
            }
            Err(e) => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.failure_alert_threshold {
                    warn!(
                        component = "heartbeat",
                        consecutive_failures = count,
                        "Heartbeat: {} consecutive failures, agent may be unreachable", count
                    );
                } else {
                    warn!(component = "heartbeat", error = %e, "Failed to publish heartbeat");
                }
                self.connect_error.store(true, Ordering::SeqCst);
                self.stop();
                HeartbeatResult::err(now, &format!("Delivery failed: {e}"))
            }
        }
    }

    fn lock_period(&self) -> std::sync::MutexGuard<'_, Duration> {
        self.period.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_scheduled(&self) -> std::sync::MutexGuard<'_, Option<ScheduledEvent>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("enabled", &self.is_enabled())
            .field("period", &self.period())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}
