//! Sleep/wake lifecycle for elements backed by an expensive resource.
//!
//! ## States
//!
//! ```text
//! Sleeping ──ensure_awake──► Waking ──load ok──► Active
//!                                    └─load err─► Error   (retried by the next ensure_awake)
//! Active / Idle ──begin_processing──► Processing ──end_processing──► Idle
//! Idle ──idle deadline, sleep enabled──► ShuttingDown ──unload──► Sleeping
//! any ──force sleep (cleanup, sleep enabled)──► ShuttingDown ──► Sleeping
//! ```
//!
//! ## Threading
//!
//! Each [`LifecycleHandle`] talks to one tokio task that owns the state, the
//! [`SleepConfiguration`] and the idle deadline. Commands are handled one at
//! a time, so a timer can never fire against a state that a newer command
//! already replaced. Every state change clears the deadline; entering
//! `Idle` re-arms it.
//!
//! The task is spawned on the first command, not on construction, which keeps
//! element factories free of side effects. Dropping the last handle stops the
//! task after unloading a resident resource.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ElementState
// ---------------------------------------------------------------------------

/// Residency state of an element's backing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementState {
    Sleeping,
    Waking,
    Active,
    Processing,
    Idle,
    Error,
    ShuttingDown,
}

impl ElementState {
    /// `true` while the backing resource is loaded and usable.
    pub fn is_awake(self) -> bool {
        matches!(
            self,
            ElementState::Active | ElementState::Processing | ElementState::Idle
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ElementState::Sleeping => "Sleeping",
            ElementState::Waking => "Waking",
            ElementState::Active => "Active",
            ElementState::Processing => "Processing",
            ElementState::Idle => "Idle",
            ElementState::Error => "Error",
            ElementState::ShuttingDown => "Shutting down",
        }
    }
}

impl Default for ElementState {
    fn default() -> Self {
        ElementState::Sleeping
    }
}

// ---------------------------------------------------------------------------
// SleepConfiguration
// ---------------------------------------------------------------------------

/// Resource policy for a sleepable element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SleepConfiguration {
    /// Whether the resource may be unloaded at all.
    pub enabled: bool,
    /// Idle time before an automatic unload. `0` disables the timer.
    pub auto_sleep_delay_seconds: f64,
    /// Load the resource during `prepare()` instead of on first use.
    pub pre_warm: bool,
}

impl Default for SleepConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_sleep_delay_seconds: 60.0,
            pre_warm: false,
        }
    }
}

impl SleepConfiguration {
    /// Keep the resource resident for the element's whole lifetime.
    pub fn always_resident() -> Self {
        Self {
            enabled: false,
            auto_sleep_delay_seconds: 0.0,
            pre_warm: true,
        }
    }

    /// Idle delay after which the resource is unloaded, if any.
    pub fn auto_sleep_delay(&self) -> Option<Duration> {
        let secs = self.auto_sleep_delay_seconds;
        if self.enabled && secs.is_finite() && secs > 0.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        }
    }

    /// Whether `prepare()` should load the resource eagerly.
    pub fn wakes_on_prepare(&self) -> bool {
        self.pre_warm || !self.enabled
    }
}

// ---------------------------------------------------------------------------
// ResourceLoader / LifecycleError
// ---------------------------------------------------------------------------

/// Loads and releases the heavy resource behind a sleepable element.
#[async_trait]
pub trait ResourceLoader: Send + Sync + 'static {
    async fn load(&self) -> anyhow::Result<()>;

    async fn unload(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("failed to wake `{element}`: {message}")]
    WakeFailed { element: String, message: String },

    #[error("failed to put `{element}` to sleep: {message}")]
    SleepFailed { element: String, message: String },

    #[error("lifecycle task for `{0}` has stopped")]
    Closed(String),
}

// ---------------------------------------------------------------------------
// LifecycleHandle
// ---------------------------------------------------------------------------

type Reply = oneshot::Sender<Result<(), LifecycleError>>;

enum Command {
    EnsureAwake(Reply),
    BeginProcessing(Reply),
    EndProcessing(Reply),
    Sleep { only_if_enabled: bool, reply: Reply },
    Configure(SleepConfiguration, Reply),
    MarkError(Reply),
}

/// Cheap-to-clone handle to an element's lifecycle task.
#[derive(Clone)]
pub struct LifecycleHandle {
    inner: Arc<Shared>,
}

struct Shared {
    label: String,
    tx: mpsc::UnboundedSender<Command>,
    /// Task waiting to be spawned by the first command.
    pending: Mutex<Option<LifecycleTask>>,
    state_rx: watch::Receiver<ElementState>,
    /// Mirror of the task's configuration for synchronous reads.
    config: Mutex<SleepConfiguration>,
    last_active: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl LifecycleHandle {
    /// Create a handle in the `Sleeping` state. Does not spawn anything.
    pub fn new(
        label: impl Into<String>,
        loader: Arc<dyn ResourceLoader>,
        config: SleepConfiguration,
    ) -> Self {
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ElementState::Sleeping);
        let last_active = Arc::new(Mutex::new(None));

        let task = LifecycleTask {
            label: label.clone(),
            rx,
            state_tx,
            config,
            loader,
            last_active: Arc::clone(&last_active),
            idle_deadline: None,
        };

        Self {
            inner: Arc::new(Shared {
                label,
                tx,
                pending: Mutex::new(Some(task)),
                state_rx,
                config: Mutex::new(config),
                last_active,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current state (snapshot).
    pub fn state(&self) -> ElementState {
        *self.inner.state_rx.borrow()
    }

    pub fn is_awake(&self) -> bool {
        self.state().is_awake()
    }

    pub fn sleep_config(&self) -> SleepConfiguration {
        *self.inner.config.lock()
    }

    /// Last time the element entered `Processing` or `Idle`.
    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_active.lock()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ElementState> {
        self.inner.state_rx.clone()
    }

    /// Load the resource unless it is already resident. Idempotent.
    pub async fn ensure_awake(&self) -> Result<(), LifecycleError> {
        self.request(Command::EnsureAwake).await
    }

    /// Ensure the resource is loaded and mark the element as `Processing`.
    pub async fn begin_processing(&self) -> Result<(), LifecycleError> {
        self.request(Command::BeginProcessing).await
    }

    /// Return from `Processing` to `Idle`, arming the auto-sleep timer.
    pub async fn end_processing(&self) -> Result<(), LifecycleError> {
        self.request(Command::EndProcessing).await
    }

    /// Unload the resource now, regardless of the sleep configuration.
    pub async fn sleep(&self) -> Result<(), LifecycleError> {
        self.request(|reply| Command::Sleep {
            only_if_enabled: false,
            reply,
        })
        .await
    }

    /// Unload the resource if sleep is enabled for this element.
    pub async fn release(&self) -> Result<(), LifecycleError> {
        self.request(|reply| Command::Sleep {
            only_if_enabled: true,
            reply,
        })
        .await
    }

    /// Replace the sleep configuration.
    ///
    /// Disabling sleep while `Sleeping` wakes the element immediately.
    pub async fn configure(&self, config: SleepConfiguration) -> Result<(), LifecycleError> {
        *self.inner.config.lock() = config;
        self.request(|reply| Command::Configure(config, reply)).await
    }

    /// Move the element to `Error`. The next `ensure_awake` reloads it.
    pub async fn mark_error(&self) -> Result<(), LifecycleError> {
        self.request(Command::MarkError).await
    }

    /// Wait until the element reaches `target`.
    pub async fn wait_for(&self, target: ElementState) -> Result<(), LifecycleError> {
        let mut rx = self.subscribe();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| self.closed())
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), LifecycleError> {
        self.spawn_if_pending();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .tx
            .send(make(reply_tx))
            .map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| self.closed())?
    }

    fn spawn_if_pending(&self) {
        if let Some(task) = self.inner.pending.lock().take() {
            tokio::spawn(task.run());
        }
    }

    fn closed(&self) -> LifecycleError {
        LifecycleError::Closed(self.inner.label.clone())
    }
}

impl fmt::Debug for LifecycleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHandle")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// LifecycleTask
// ---------------------------------------------------------------------------

struct LifecycleTask {
    label: String,
    rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ElementState>,
    config: SleepConfiguration,
    loader: Arc<dyn ResourceLoader>,
    last_active: Arc<Mutex<Option<DateTime<Utc>>>>,
    idle_deadline: Option<Instant>,
}

impl LifecycleTask {
    async fn run(mut self) {
        debug!(element = %self.label, "lifecycle task started");

        loop {
            let command = match self.idle_deadline {
                Some(deadline) => tokio::select! {
                    command = self.rx.recv() => command,
                    _ = tokio::time::sleep_until(deadline) => {
                        self.on_idle_timeout().await;
                        continue;
                    }
                },
                None => self.rx.recv().await,
            };

            let Some(command) = command else {
                break;
            };
            self.handle(command).await;
        }

        // Every handle is gone; release whatever is still loaded.
        if self.state() != ElementState::Sleeping {
            if let Err(e) = self.put_to_sleep().await {
                warn!(element = %self.label, "unload on shutdown failed: {e}");
            }
        }
        debug!(element = %self.label, "lifecycle task stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::EnsureAwake(reply) => {
                let result = self.ensure_awake().await;
                let _ = reply.send(result);
            }
            Command::BeginProcessing(reply) => {
                let result = self.ensure_awake().await;
                if result.is_ok() {
                    self.set_state(ElementState::Processing);
                }
                let _ = reply.send(result);
            }
            Command::EndProcessing(reply) => {
                if self.state() == ElementState::Processing {
                    self.set_state(ElementState::Idle);
                }
                let _ = reply.send(Ok(()));
            }
            Command::Sleep {
                only_if_enabled,
                reply,
            } => {
                let result = if (only_if_enabled && !self.config.enabled)
                    || self.state() == ElementState::Sleeping
                {
                    Ok(())
                } else {
                    self.put_to_sleep().await
                };
                let _ = reply.send(result);
            }
            Command::Configure(config, reply) => {
                self.config = config;
                let result = match self.state() {
                    ElementState::Sleeping if !config.enabled => self.wake().await,
                    ElementState::Idle => {
                        self.idle_deadline = None;
                        self.arm_idle_timer();
                        Ok(())
                    }
                    _ => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::MarkError(reply) => {
                self.set_state(ElementState::Error);
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn state(&self) -> ElementState {
        *self.state_tx.borrow()
    }

    fn set_state(&mut self, next: ElementState) {
        self.idle_deadline = None;

        let previous = self.state();
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if previous != next {
            debug!(element = %self.label, from = ?previous, to = ?next, "lifecycle transition");
        }

        if matches!(next, ElementState::Processing | ElementState::Idle) {
            *self.last_active.lock() = Some(Utc::now());
        }
        if next == ElementState::Idle {
            self.arm_idle_timer();
        }
    }

    fn arm_idle_timer(&mut self) {
        if let Some(delay) = self.config.auto_sleep_delay() {
            self.idle_deadline = Some(Instant::now() + delay);
            debug!(element = %self.label, delay_ms = delay.as_millis() as u64, "auto-sleep armed");
        }
    }

    async fn on_idle_timeout(&mut self) {
        self.idle_deadline = None;
        if self.state() == ElementState::Idle && self.config.enabled {
            info!(element = %self.label, "idle timeout reached, putting element to sleep");
            if let Err(e) = self.put_to_sleep().await {
                warn!(element = %self.label, "auto-sleep failed: {e}");
            }
        }
    }

    async fn ensure_awake(&mut self) -> Result<(), LifecycleError> {
        if self.state().is_awake() {
            return Ok(());
        }
        self.wake().await
    }

    async fn wake(&mut self) -> Result<(), LifecycleError> {
        self.set_state(ElementState::Waking);
        info!(element = %self.label, "waking element");
        match self.loader.load().await {
            Ok(()) => {
                self.set_state(ElementState::Active);
                Ok(())
            }
            Err(e) => {
                self.set_state(ElementState::Error);
                Err(LifecycleError::WakeFailed {
                    element: self.label.clone(),
                    message: format!("{e:#}"),
                })
            }
        }
    }

    async fn put_to_sleep(&mut self) -> Result<(), LifecycleError> {
        self.set_state(ElementState::ShuttingDown);
        info!(element = %self.label, "putting element to sleep");
        match self.loader.unload().await {
            Ok(()) => {
                self.set_state(ElementState::Sleeping);
                Ok(())
            }
            Err(e) => {
                self.set_state(ElementState::Error);
                Err(LifecycleError::SleepFailed {
                    element: self.label.clone(),
                    message: format!("{e:#}"),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
