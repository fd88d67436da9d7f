//! Lifecycle driver
//!
//! A [`Core`] owns everything one agent needs at runtime: its connection,
//! subsystem registry, deadline scheduler, cross-context dispatcher and
//! lifecycle signals. [`Core::run`] drives the four phases of a
//! [`CoreLoop`]:
//!
//! ```text
//!  bind() ──> phase 1 (pre-setup) ──> onsetup
//!         ──> phase 2 (pre-start, main loop spawned)
//!         ──> onstart + scheduler        (deferred until welcome for VipLoop)
//!         ──> ...wait for stop request or main loop end...
//!         ──> scheduler killed ──> phase 3 (pre-stop) ──> onstop (all awaited)
//!         ──> main loop killed ──> phase 4 (pre-finish) ──> onfinish
//! ```
//!
//! Every task spawned through the Core is tracked and aborted when `run`
//! returns.

pub mod bindings;
pub mod handshake;
pub mod subsystems;

pub use bindings::{Bindings, LifecycleSignal};
pub use handshake::{HandshakeState, ServerInfo};
pub use subsystems::{subsystem_handler, SubsystemHandler, SubsystemRegistry};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::credentials::Credentials;
use crate::dispatch::{BackgroundTask, Dispatcher};
use crate::error::{CoreError, Result, VipError, EPROTONOSUPPORT};
use crate::scheduler::{callback, IntoDeadline, ScheduledEvent, Scheduler};
use crate::signal::{handler, Signal, SignalHandler};
use crate::transport::{Connection, ConnectionFactory};
use crate::utils::time::periodic;
use crate::vip::{subsystems as names, Message};

use bindings::{Binding, PeriodicBinding};
use handshake::Handshake;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

tokio::task_local! {
    /// Set on the `run` task and on `onstop` receivers: the Core whose
    /// shutdown is waiting for the current task.
    static LIFECYCLE: usize;
}

// ============================================================================
// Lifecycle state
// ============================================================================

/// Where a Core is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    Created,
    SetupDone,
    PreStart,
    Running,
    Stopping,
    Finished,
}

/// Payload of the `onviperror` signal.
#[derive(Clone)]
pub struct ViperrorEvent {
    pub core: Arc<Core>,
    pub error: VipError,
    /// The `error` envelope the error was decoded from.
    pub message: Message,
}

impl std::fmt::Debug for ViperrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViperrorEvent")
            .field("identity", &self.core.identity)
            .field("error", &self.error)
            .field("message", &self.message)
            .finish()
    }
}

// ============================================================================
// CoreLoop
// ============================================================================

/// The four phases a Core runs through.
///
/// Phase 1 queues connection side effects, phase 2 may spawn the main
/// receive loop (the Core kills it when stopping), phase 3 runs graceful-stop
/// side effects and phase 4 the final teardown.
#[async_trait]
pub trait CoreLoop: Send + Sync {
    async fn on_pre_setup(&self, core: &Arc<Core>) -> Result<()>;

    async fn on_pre_start(&self, core: &Arc<Core>) -> Result<Option<JoinHandle<()>>>;

    async fn on_pre_stop(&self, core: &Arc<Core>) -> Result<()>;

    async fn on_pre_finish(&self, core: &Arc<Core>) -> Result<()>;

    /// Hold `onstart` back until something else calls for it.
    fn delay_onstart_signal(&self) -> bool {
        false
    }

    /// Hold the ready signal back until something else fires it.
    fn delay_running_event_set(&self) -> bool {
        false
    }
}

/// No connection activity and no main loop; `onstart` fires right away.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicLoop;

#[async_trait]
impl CoreLoop for BasicLoop {
    async fn on_pre_setup(&self, _core: &Arc<Core>) -> Result<()> {
        Ok(())
    }

    async fn on_pre_start(&self, _core: &Arc<Core>) -> Result<Option<JoinHandle<()>>> {
        Ok(None)
    }

    async fn on_pre_stop(&self, _core: &Arc<Core>) -> Result<()> {
        Ok(())
    }

    async fn on_pre_finish(&self, _core: &Arc<Core>) -> Result<()> {
        Ok(())
    }
}

/// Connected agent: hello handshake in phase 1, receive loop in phase 2,
/// `agentstop` notice in phase 3, disconnect in phase 4. `onstart` and the
/// ready signal wait for the router's welcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct VipLoop;

#[async_trait]
impl CoreLoop for VipLoop {
    async fn on_pre_setup(&self, core: &Arc<Core>) -> Result<()> {
        core.connection.connect().await?;
        core.subsystems
            .register(names::HELLO, handshake::hello_handler());
        core.send_hello().await
    }

    async fn on_pre_start(&self, core: &Arc<Core>) -> Result<Option<JoinHandle<()>>> {
        let core = Arc::clone(core);
        Ok(Some(tokio::spawn(async move { core.receive_loop().await })))
    }

    async fn on_pre_stop(&self, core: &Arc<Core>) -> Result<()> {
        if !core.is_connected() {
            return Ok(());
        }
        debug!(component = "core", identity = %core.identity, "Sending agentstop");
        let notice = Message::new("", names::AGENT_STOP)
            .with_sender(&core.identity)
            .with_arg(core.identity.clone());
        core.connection.send_vip_message(notice).await
    }

    async fn on_pre_finish(&self, core: &Arc<Core>) -> Result<()> {
        let disconnected = core.connection.disconnect().await;
        let was_connected = core.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            core.ondisconnected.send(Arc::clone(core)).await;
        }
        disconnected
    }

    fn delay_onstart_signal(&self) -> bool {
        true
    }

    fn delay_running_event_set(&self) -> bool {
        true
    }
}

// ============================================================================
// CoreBuilder
// ============================================================================

/// Assembles a [`Core`] from its collaborators.
///
/// Exactly one of [`CoreBuilder::connection`] and
/// [`CoreBuilder::connection_factory`] must be given.
#[derive(Default)]
pub struct CoreBuilder {
    identity: Option<String>,
    credentials: Option<Credentials>,
    connection: Option<Arc<dyn Connection>>,
    factory: Option<Arc<dyn ConnectionFactory>>,
    core_loop: Option<Arc<dyn CoreLoop>>,
    config: CoreConfig,
    address: Option<String>,
    agent_uuid: Option<String>,
    instance_name: Option<String>,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: &str) -> Self {
        self.identity = Some(identity.to_string());
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Phase implementation; defaults to [`VipLoop`].
    pub fn core_loop(mut self, core_loop: Arc<dyn CoreLoop>) -> Self {
        self.core_loop = Some(core_loop);
        self
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn agent_uuid(mut self, agent_uuid: &str) -> Self {
        self.agent_uuid = Some(agent_uuid.to_string());
        self
    }

    pub fn instance_name(mut self, instance_name: &str) -> Self {
        self.instance_name = Some(instance_name.to_string());
        self
    }

    /// Validates the collaborators and builds the Core.
    ///
    /// # Errors
    /// `CoreError::IdentityMismatch` when the credentials belong to another
    /// identity; `CoreError::Construction` unless exactly one connection
    /// source was given.
    pub fn build(self) -> Result<Arc<Core>> {
        if let (Some(identity), Some(credentials)) = (&self.identity, &self.credentials) {
            if identity != &credentials.identity {
                return Err(CoreError::IdentityMismatch {
                    identity: identity.clone(),
                    credentials: credentials.identity.clone(),
                });
            }
        }
        let identity = self
            .identity
            .or_else(|| self.credentials.as_ref().map(|c| c.identity.clone()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (connection, address) = match (self.connection, self.factory) {
            (Some(connection), None) => (connection, self.address),
            (None, Some(factory)) => {
                let credentials = self
                    .credentials
                    .clone()
                    .unwrap_or_else(|| Credentials::new(&identity));
                let connection = factory.build(&credentials)?;
                let address = self.address.or_else(|| Some(factory.address().to_string()));
                (connection, address)
            }
            (None, None) => {
                return Err(CoreError::Construction(
                    "a connection or a connection factory is required".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(CoreError::Construction(
                    "give either a connection or a connection factory, not both".to_string(),
                ))
            }
        };

        debug!(component = "core", identity = %identity, address = ?address, agent_uuid = ?self.agent_uuid, "Core built");

        let subsystems = SubsystemRegistry::new();
        subsystems.register(
            names::ERROR,
            subsystem_handler(|core: Arc<Core>, message: Message| async move {
                core.handle_error(message).await;
                Ok(())
            }),
        );

        Ok(Arc::new(Core {
            identity,
            credentials: self.credentials,
            address,
            agent_uuid: self.agent_uuid,
            instance_name: self.instance_name,
            scheduler: Arc::new(Scheduler::new(self.config.scheduler_hard_cap())),
            config: self.config,
            connection,
            core_loop: self.core_loop.unwrap_or_else(|| Arc::new(VipLoop)),
            subsystems,
            dispatcher: Arc::new(Dispatcher::new()),
            handshake: Handshake::new(),
            onsetup: Signal::new("onsetup"),
            onstart: Signal::new("onstart"),
            onstop: Signal::new("onstop"),
            onfinish: Signal::new("onfinish"),
            onconnected: Signal::new("onconnected"),
            ondisconnected: Signal::new("ondisconnected"),
            configuration: Signal::new("configuration"),
            onviperror: Signal::new("onviperror"),
            state: watch::Sender::new(CoreState::Created),
            stop_requested: watch::Sender::new(false),
            started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            scheduler_task: Mutex::new(None),
            dispatcher_task: Mutex::new(None),
            ready: Mutex::new(None),
            runtime: OnceCell::new(),
            pending_bindings: Mutex::new(Vec::new()),
            periodics: Mutex::new(Vec::new()),
        }))
    }
}

// ============================================================================
// Core
// ============================================================================

/// Runtime core of one agent.
pub struct Core {
    identity: String,
    credentials: Option<Credentials>,
    address: Option<String>,
    agent_uuid: Option<String>,
    instance_name: Option<String>,
    config: CoreConfig,
    connection: Arc<dyn Connection>,
    core_loop: Arc<dyn CoreLoop>,
    subsystems: SubsystemRegistry,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    handshake: Handshake,

    pub onsetup: Signal<Arc<Core>>,
    pub onstart: Signal<Arc<Core>>,
    pub onstop: Signal<Arc<Core>>,
    pub onfinish: Signal<Arc<Core>>,
    pub onconnected: Signal<Arc<Core>>,
    pub ondisconnected: Signal<Arc<Core>>,
    pub configuration: Signal<Arc<Core>>,
    pub onviperror: Signal<ViperrorEvent>,

    state: watch::Sender<CoreState>,
    stop_requested: watch::Sender<bool>,
    started: AtomicBool,
    connected: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    scheduler_task: Mutex<Option<AbortHandle>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    ready: Mutex<Option<oneshot::Sender<()>>>,
    runtime: OnceCell<Handle>,
    pending_bindings: Mutex<Vec<Bindings>>,
    periodics: Mutex<Vec<PeriodicBinding>>,
}

impl Core {
    pub fn builder() -> CoreBuilder {
        CoreBuilder::new()
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn agent_uuid(&self) -> Option<&str> {
        self.agent_uuid.as_deref()
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.instance_name.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn subsystems(&self) -> &SubsystemRegistry {
        &self.subsystems
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn state(&self) -> CoreState {
        *self.state.borrow()
    }

    /// True between a confirmed welcome and teardown.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::SeqCst);
    }

    fn set_state(&self, state: CoreState) {
        debug!(component = "core", identity = %self.identity, state = ?state, "Lifecycle transition");
        self.state.send_replace(state);
    }

    // ------------------------------------------------------------------------
    // Tasks and scheduling
    // ------------------------------------------------------------------------

    /// Spawns a task that is aborted when the Core finishes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }

    /// Like [`Core::spawn`], starting `future` after `delay`.
    pub fn spawn_later<F>(&self, delay: Duration, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            future.await
        })
    }

    /// Runs `f` once at `deadline`.
    pub fn schedule_once<F, Fut>(&self, deadline: impl IntoDeadline, f: F) -> ScheduledEvent
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.scheduler.schedule_once(deadline, callback(f))
    }

    /// Runs `f` at every deadline `deadlines` yields.
    pub fn schedule_iter<I, F, Fut>(&self, deadlines: I, f: F) -> ScheduledEvent
    where
        I: IntoIterator,
        I::Item: IntoDeadline + 'static,
        I::IntoIter: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.scheduler.schedule_iter(deadlines, callback(f))
    }

    /// Runs `f` every `period` on a fixed grid starting `wait` from now (one
    /// period from now when `wait` is `None`).
    pub fn schedule_periodic<F, Fut>(
        &self,
        period: Duration,
        wait: Option<Duration>,
        f: F,
    ) -> ScheduledEvent
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let grid = match wait {
            Some(wait) => periodic(period).starting_after(wait),
            None => periodic(period),
        };
        self.scheduler.schedule_iter(grid, callback(f))
    }

    // ------------------------------------------------------------------------
    // Cross-context calls
    // ------------------------------------------------------------------------

    /// Queues `f` to run on the Core's context.
    pub fn send<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.post(f)
    }

    /// Runs `f` on the Core's context and blocks this (foreign) thread for
    /// the result.
    pub fn send_and_wait<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.dispatcher.post_and_wait(f)
    }

    /// Async form of [`Core::send_and_wait`].
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.dispatcher.call(f).await
    }

    /// Runs blocking `f` on a worker thread; the result comes back through
    /// the Core's context.
    pub fn spawn_in_thread<T, F>(&self, f: F) -> BackgroundTask<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.dispatcher.run_in_background_thread(f)
    }

    // ------------------------------------------------------------------------
    // Subsystems
    // ------------------------------------------------------------------------

    /// Routes envelopes for `name` to `handler`, replacing any earlier
    /// handler. `error_handler` receives `onviperror` events whose error
    /// names this subsystem.
    ///
    /// Register before calling `run`.
    pub fn register(
        &self,
        name: &str,
        handler_fn: SubsystemHandler,
        error_handler: Option<SignalHandler<ViperrorEvent>>,
    ) {
        if self.subsystems.register(name, handler_fn).is_some() {
            debug!(component = "core", subsystem = name, "Replaced subsystem handler");
        }
        if let Some(error_handler) = error_handler {
            let subsystem = name.to_string();
            self.onviperror.connect(
                handler(move |event: ViperrorEvent| {
                    let matches = event.error.subsystem == subsystem;
                    let inner = Arc::clone(&error_handler);
                    async move {
                        if matches {
                            inner(event).await
                        } else {
                            Ok(())
                        }
                    }
                }),
                Some(name),
            );
        }
    }

    /// Sends an envelope through the Core's connection.
    pub async fn send_vip(&self, message: Message) -> Result<()> {
        self.connection.send_vip_message(message).await
    }

    /// Routes one inbound envelope to its subsystem handler.
    ///
    /// An unknown subsystem is answered with an `error` envelope to the
    /// sender instead of failing here.
    pub async fn dispatch(self: &Arc<Self>, message: Message) -> Result<()> {
        match self.subsystems.get(&message.subsystem) {
            Some(handler_fn) => handler_fn(Arc::clone(self), message).await,
            None => {
                self.reply_unsupported(&message).await;
                Ok(())
            }
        }
    }

    async fn reply_unsupported(&self, message: &Message) {
        warn!(
            component = "core",
            subsystem = %message.subsystem,
            sender = %message.sender,
            id = %message.id,
            "Unsupported subsystem"
        );
        let error = VipError::new(
            EPROTONOSUPPORT,
            "Protocol not supported",
            &self.identity,
            &message.subsystem,
        );
        let reply = Message::reply_to(message, names::ERROR)
            .with_sender(&self.identity)
            .with_args(error.to_args());
        if let Err(e) = self.connection.send_vip_message(reply).await {
            warn!(component = "core", error = %e, "Could not send unsupported-subsystem error");
        }
    }

    /// Decodes an inbound `error` envelope and emits `onviperror`.
    ///
    /// Envelopes with too few args, or an unreadable errno, are logged and
    /// dropped.
    pub async fn handle_error(self: &Arc<Self>, message: Message) {
        if message.args.len() < VipError::MIN_ARGS {
            debug!(component = "core", id = %message.id, args = message.args.len(), "Unhandled VIP error");
            return;
        }
        let Some(error) = VipError::from_args(&message.args) else {
            debug!(component = "core", id = %message.id, "Undecodable VIP error");
            return;
        };
        debug!(component = "core", error = %error, "VIP error received");
        self.onviperror
            .send(ViperrorEvent {
                core: Arc::clone(self),
                error,
                message,
            })
            .await;
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            match self.connection.receive_vip_message().await {
                Ok(Some(message)) => {
                    let subsystem = message.subsystem.clone();
                    if let Err(e) = self.dispatch(message).await {
                        warn!(component = "core", subsystem = %subsystem, error = %e, "Subsystem handler failed");
                    }
                }
                Ok(None) => {
                    info!(component = "core", identity = %self.identity, "Connection closed by peer");
                    return;
                }
                Err(e) => {
                    error!(component = "core", identity = %self.identity, error = %e, "Receive failed");
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------------

    /// Adds declarative bindings. Before `run` they are applied during
    /// setup; afterwards they are applied immediately.
    pub fn bind(&self, bindings: Bindings) {
        if !self.started.load(Ordering::SeqCst) {
            lock(&self.pending_bindings).push(bindings);
        } else {
            self.apply_bindings(bindings);
        }
    }

    fn apply_bindings(&self, bindings: Bindings) {
        let owner = bindings.owner.as_deref();
        let running = self.state() == CoreState::Running;
        for binding in bindings.entries {
            match binding {
                Binding::Receiver { signal, handler } => {
                    signal.of(self).connect(handler, owner);
                }
                Binding::At { deadline, callback } => {
                    self.scheduler.schedule_once(deadline, callback);
                }
                Binding::Periodic(p) if running => {
                    self.start_periodic(&p);
                }
                Binding::Periodic(p) => lock(&self.periodics).push(p),
            }
        }
    }

    fn start_periodic(&self, p: &PeriodicBinding) -> ScheduledEvent {
        let grid = match p.wait {
            Some(wait) => periodic(p.period).starting_after(wait),
            None => periodic(p.period),
        };
        self.scheduler
            .schedule_iter(grid, Arc::clone(&p.callback))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Moves PreStart to Running: `onstart` receivers, then the scheduler and
    /// periodic bindings. Only the first call has any effect.
    pub(crate) fn begin_running(self: &Arc<Self>) {
        let began = self.state.send_if_modified(|s| {
            if *s == CoreState::PreStart {
                *s = CoreState::Running;
                true
            } else {
                false
            }
        });
        if !began {
            return;
        }
        info!(component = "core", identity = %self.identity, "Agent running");
        self.onstart.send_by(|f| self.spawn(f), Arc::clone(self));

        let scheduler = Arc::clone(&self.scheduler);
        let task = self.spawn(async move { scheduler.run().await });
        *lock(&self.scheduler_task) = Some(task.abort_handle());

        let periodics = std::mem::take(&mut *lock(&self.periodics));
        for p in &periodics {
            self.start_periodic(p);
        }
    }

    pub(crate) fn fire_ready(&self) {
        if let Some(ready) = lock(&self.ready).take() {
            let _ = ready.send(());
        }
    }

    /// Runs the agent until it is stopped.
    ///
    /// `ready` fires once the agent is running (for `VipLoop`, once the
    /// router welcomed it); it is dropped unfired if that never happens.
    ///
    /// # Errors
    /// `CoreError::AlreadyStarted` on a second call (or after a stop);
    /// `CoreError::MainLoopEnded` when the receive loop ended on its own;
    /// the phase error when a phase failed. Shutdown has completed in
    /// every case except `AlreadyStarted`.
    pub async fn run(self: &Arc<Self>, ready: Option<oneshot::Sender<()>>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyStarted);
        }
        LIFECYCLE.scope(self.lifecycle_key(), self.drive(ready)).await
    }

    fn lifecycle_key(&self) -> usize {
        self as *const Self as usize
    }

    /// Whether `shutdown` is (or will be) waiting for the current task.
    fn in_own_lifecycle(&self) -> bool {
        LIFECYCLE
            .try_with(|key| *key == self.lifecycle_key())
            .unwrap_or(false)
    }

    async fn drive(self: &Arc<Self>, ready: Option<oneshot::Sender<()>>) -> Result<()> {
        let _ = self.runtime.set(Handle::current());
        *lock(&self.ready) = ready;

        let dispatcher = Arc::clone(&self.dispatcher);
        let drain = self.spawn(async move { dispatcher.run().await });
        *lock(&self.dispatcher_task) = Some(drain);

        let pending = std::mem::take(&mut *lock(&self.pending_bindings));
        for bindings in pending {
            self.apply_bindings(bindings);
        }

        let mut failure: Option<CoreError> = None;
        let mut main_loop: Option<JoinHandle<()>> = None;

        match self.core_loop.on_pre_setup(self).await {
            Ok(()) => {
                self.set_state(CoreState::SetupDone);
                self.onsetup.send(Arc::clone(self)).await;
                self.set_state(CoreState::PreStart);
                match self.core_loop.on_pre_start(self).await {
                    Ok(handle) => main_loop = handle,
                    Err(e) => failure = Some(e),
                }
            }
            Err(e) => failure = Some(e),
        }

        if failure.is_none() {
            if !self.core_loop.delay_onstart_signal() {
                self.begin_running();
            }
            if !self.core_loop.delay_running_event_set() {
                self.fire_ready();
            }
            if let Some(ended) = self.wait_for_stop(main_loop.as_mut()).await {
                failure = Some(ended);
            }
        }

        if let Some(e) = &failure {
            error!(component = "core", identity = %self.identity, state = ?self.state(), error = %e, "Agent failed, shutting down");
        }
        self.shutdown(main_loop, &mut failure).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits for a stop request; reports the main loop ending first.
    async fn wait_for_stop(&self, main_loop: Option<&mut JoinHandle<()>>) -> Option<CoreError> {
        let mut stop_rx = self.stop_requested.subscribe();
        match main_loop {
            Some(main_loop) => {
                tokio::select! {
                    _ = main_loop => {
                        error!(component = "core", identity = %self.identity, "VIP loop ended prematurely");
                        Some(CoreError::MainLoopEnded)
                    }
                    _ = stop_rx.wait_for(|requested| *requested) => None,
                }
            }
            None => {
                let _ = stop_rx.wait_for(|requested| *requested).await;
                None
            }
        }
    }

    async fn shutdown(self: &Arc<Self>, main_loop: Option<JoinHandle<()>>, failure: &mut Option<CoreError>) {
        self.set_state(CoreState::Stopping);
        if let Some(task) = lock(&self.scheduler_task).take() {
            task.abort();
        }

        if let Err(e) = self.core_loop.on_pre_stop(self).await {
            warn!(component = "core", identity = %self.identity, error = %e, "Pre-stop phase failed");
            failure.get_or_insert(e);
        }

        let key = self.lifecycle_key();
        let receivers = self
            .onstop
            .send_by(|f| self.spawn(LIFECYCLE.scope(key, f)), Arc::clone(self));
        join_all(receivers).await;

        if let Some(main_loop) = main_loop {
            main_loop.abort();
        }
        if let Err(e) = self.core_loop.on_pre_finish(self).await {
            warn!(component = "core", identity = %self.identity, error = %e, "Pre-finish phase failed");
            failure.get_or_insert(e);
        }
        self.onfinish.send(Arc::clone(self)).await;

        self.dispatcher.close();
        let drain = lock(&self.dispatcher_task).take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }
        self.set_state(CoreState::Finished);
        lock(&self.ready).take();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            task.abort();
        }
        info!(component = "core", identity = %self.identity, "Agent finished");
    }

    /// Marks a never-run Core as finished. Returns true when the Core is (or
    /// now is) terminal without a running `run` to wait for.
    fn finish_unstarted(&self) -> bool {
        if self.state() == CoreState::Finished {
            return true;
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            self.set_state(CoreState::Finished);
            self.dispatcher.close();
            return true;
        }
        false
    }

    async fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.state.subscribe();
        let finished = async move { rx.wait_for(|s| *s == CoreState::Finished).await.is_ok() };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, finished)
                .await
                .unwrap_or(false),
            None => finished.await,
        }
    }

    /// Requests a stop and waits (up to `timeout`) for `run` to finish.
    ///
    /// Idempotent: later calls only wait. Returns whether the Core reached
    /// `Finished` in time.
    ///
    /// From a lifecycle receiver that shutdown itself waits on (`onsetup`,
    /// `onstop`, `onfinish`, `ondisconnected`) the request is recorded and the
    /// call returns `false` at once, since `Finished` follows only after that
    /// receiver returns.
    pub async fn stop(self: &Arc<Self>, timeout: Option<Duration>) -> bool {
        if self.finish_unstarted() {
            return true;
        }
        if !*self.stop_requested.borrow() {
            info!(component = "core", identity = %self.identity, "Stop requested");
        }
        self.stop_requested.send_replace(true);
        if self.in_own_lifecycle() {
            debug!(component = "core", identity = %self.identity, state = ?self.state(), "Stop requested from the lifecycle, not waiting");
            return self.state() == CoreState::Finished;
        }
        self.wait_finished(timeout).await
    }

    /// [`Core::stop`] for threads outside the runtime; the request is
    /// marshalled onto the Core's context.
    ///
    /// # Panics
    /// When called from inside the async runtime; use [`Core::stop`] there.
    pub fn stop_blocking(self: &Arc<Self>, timeout: Option<Duration>) -> Result<bool> {
        if self.finish_unstarted() {
            return Ok(true);
        }
        let runtime = self.runtime.get().cloned().ok_or(CoreError::NotRunning)?;
        let core = Arc::clone(self);
        match self.dispatcher.post_and_wait(move || {
            core.stop_requested.send_replace(true);
        }) {
            // Already shutting down; just wait for the end.
            Ok(()) | Err(CoreError::DispatcherClosed) => {}
            Err(e) => return Err(e),
        }
        Ok(runtime.block_on(self.wait_finished(timeout)))
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("identity", &self.identity)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish()
    }
}
