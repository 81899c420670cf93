//! `PipelineOrchestrator`: validates, instantiates and runs pipelines.
//!
//! ## Run
//!
//! ```text
//! run(pipeline)
//!   ├─ single-flight guard          → AlreadyRunning
//!   ├─ validate                     → ValidationFailed
//!   ├─ instantiate enabled elements → ElementNotFound
//!   │    apply configuration, host configurator, sleep policy, prepare()
//!   ├─ for each element, in order:
//!   │    cancelled?  → record `cancelled`, stop  → Cancelled
//!   │    disabled?   → record `skipped`, next
//!   │    begin_processing → process(ctx) → end_processing
//!   │    failure     → record `failed`, stop     → ElementFailed / ElementTimedOut
//!   └─ teardown: cleanup() on every instantiated element, on every exit path
//! ```
//!
//! ## Threading
//!
//! `PipelineOrchestrator` is `Send + Sync`; share it as
//! `Arc<PipelineOrchestrator>`. Only one run is in flight at a time; a second
//! call fails immediately instead of queueing. `cancel()` may be called from
//! any thread and takes effect at the next element boundary.

pub mod loaded;

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    context::{
        metrics::{memory_delta, process_memory_bytes, ElementExecutionMetrics, ExecutionStatus},
        PipelineContext,
    },
    element::{lifecycle::SleepConfiguration, Element},
    error::{PipelineError, Result},
    history::{ExecutionRecordSink, PipelineExecutionRecord, PipelineRunSummary, RunStatus},
    ipc::events::{PipelineEvent, PipelineEventKind},
    pipeline::Pipeline,
    registry::ElementRegistry,
};

use self::loaded::{forward_state_changes, LoadedElement, LoadedElements};

/// Broadcast channel capacity: events buffered for slow observers.
const EVENT_CAP: usize = 256;

/// Orchestrator-wide policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sleep policy for sleepable elements without an override.
    pub default_sleep: SleepConfiguration,
    /// Per-type sleep policy, keyed by type id.
    pub sleep_overrides: HashMap<String, SleepConfiguration>,
    /// Upper bound on a single `process()` call. `None` waits forever.
    pub element_timeout_secs: Option<f64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_sleep: SleepConfiguration::default(),
            sleep_overrides: HashMap::new(),
            element_timeout_secs: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn sleep_config_for(&self, type_id: &str) -> SleepConfiguration {
        self.sleep_overrides
            .get(type_id)
            .copied()
            .unwrap_or(self.default_sleep)
    }

    pub fn element_timeout(&self) -> Option<Duration> {
        self.element_timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Host hook run on every instantiated element before `prepare()`.
///
/// This is where hosts bind concrete backends (models, inserters) to the
/// built-in elements, usually through [`Element::as_any_mut`].
pub trait ElementConfigurator: Send + Sync {
    fn configure(&self, element: &mut dyn Element, instance_id: &str);
}

impl<F> ElementConfigurator for F
where
    F: Fn(&mut dyn Element, &str) + Send + Sync,
{
    fn configure(&self, element: &mut dyn Element, instance_id: &str) {
        self(element, instance_id)
    }
}

/// Stamps and publishes events for one run.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    tx: broadcast::Sender<PipelineEvent>,
    seq: Arc<AtomicU64>,
    run_id: Arc<str>,
}

impl EventEmitter {
    pub(crate) fn emit(&self, kind: PipelineEventKind) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is fine.
        let _ = self.tx.send(PipelineEvent {
            seq,
            run_id: self.run_id.to_string(),
            kind,
        });
    }
}

/// Clears the running flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| PipelineError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PipelineOrchestrator {
    registry: Arc<ElementRegistry>,
    config: RwLock<OrchestratorConfig>,
    configurator: Option<Arc<dyn ElementConfigurator>>,
    record_sink: Option<Arc<dyn ExecutionRecordSink>>,
    /// `true` while a run is in flight.
    running: AtomicBool,
    /// Context of the in-flight run, or of the last one once it finished.
    current: Mutex<Option<Arc<PipelineContext>>>,
    events_tx: broadcast::Sender<PipelineEvent>,
    /// Monotonically increasing event sequence counter.
    seq: Arc<AtomicU64>,
}

impl PipelineOrchestrator {
    pub fn new(registry: Arc<ElementRegistry>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAP);
        Self {
            registry,
            config: RwLock::new(OrchestratorConfig::default()),
            configurator: None,
            record_sink: None,
            running: AtomicBool::new(false),
            current: Mutex::new(None),
            events_tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_config(self, config: OrchestratorConfig) -> Self {
        *self.config.write() = config;
        self
    }

    pub fn with_configurator(mut self, configurator: impl ElementConfigurator + 'static) -> Self {
        self.configurator = Some(Arc::new(configurator));
        self
    }

    /// Save a record of every run that got past validation.
    pub fn with_record_sink(mut self, sink: Arc<dyn ExecutionRecordSink>) -> Self {
        self.record_sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<ElementRegistry> {
        &self.registry
    }

    pub fn config(&self) -> OrchestratorConfig {
        self.config.read().clone()
    }

    /// Takes effect from the next run.
    pub fn set_config(&self, config: OrchestratorConfig) {
        *self.config.write() = config;
    }

    pub fn validate(&self, pipeline: &Pipeline) -> crate::pipeline::validation::ValidationResult {
        self.registry.validate(pipeline)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Context of the in-flight run, or of the most recent one.
    pub fn current_context(&self) -> Option<Arc<PipelineContext>> {
        self.current.lock().clone()
    }

    /// Request cancellation of the in-flight run. No-op when idle.
    pub fn cancel(&self) {
        let current = self.current.lock();
        if !self.is_running() {
            return;
        }
        if let Some(ctx) = current.as_ref() {
            info!(run_id = %ctx.run_id(), "cancellation requested");
            ctx.cancel();
        }
    }

    /// Subscribe to run events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events_tx.subscribe()
    }

    /// Run `pipeline` to completion.
    ///
    /// `initial` seeds the run (audio, text); a fresh context is created when
    /// it is `None`. Keep a clone of the `Arc` to inspect partial results
    /// after a failure.
    ///
    /// # Errors
    /// - `AlreadyRunning` if another run is in flight.
    /// - `ValidationFailed` if the pipeline does not validate.
    /// - `ElementNotFound` if a type disappeared from the registry.
    /// - `ElementFailed` / `ElementTimedOut` for the first failing element.
    /// - `Cancelled` if `cancel()` was observed between elements.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        initial: Option<Arc<PipelineContext>>,
    ) -> Result<Arc<PipelineContext>> {
        let ctx = initial.unwrap_or_else(|| Arc::new(PipelineContext::new()));
        let _guard = self.begin_run(&ctx)?;

        let span = info_span!("pipeline_run", run_id = %ctx.run_id(), pipeline = %pipeline.name);
        self.execute(pipeline, &ctx).instrument(span).await?;
        Ok(ctx)
    }

    /// Claim the run slot and publish `ctx` as the current context.
    ///
    /// Both happen under the `current` lock, so `cancel()` never sees the
    /// running flag paired with the previous run's context.
    fn begin_run(&self, ctx: &Arc<PipelineContext>) -> Result<RunGuard<'_>> {
        let mut current = self.current.lock();
        let guard = RunGuard::acquire(&self.running)?;
        *current = Some(Arc::clone(ctx));
        Ok(guard)
    }

    async fn execute(&self, pipeline: &Pipeline, ctx: &PipelineContext) -> Result<()> {
        let validation = self.registry.validate(pipeline);
        for warning in &validation.warnings {
            warn!("validation: {warning}");
        }
        if !validation.is_valid {
            for e in &validation.errors {
                error!("validation: {e}");
            }
            return Err(PipelineError::ValidationFailed(validation.errors));
        }

        let emitter = EventEmitter {
            tx: self.events_tx.clone(),
            seq: Arc::clone(&self.seq),
            run_id: Arc::from(ctx.run_id()),
        };
        let config = self.config();
        info!(elements = pipeline.enabled_elements().len(), "pipeline run started");

        let mut loaded = LoadedElements::default();
        let outcome = self
            .run_loaded(pipeline, ctx, &config, &emitter, &mut loaded)
            .await;
        loaded.teardown().await;
        ctx.set_current_element_id(None);

        let status = match &outcome {
            Ok(()) => RunStatus::Completed,
            Err(PipelineError::Cancelled) => RunStatus::Cancelled,
            Err(_) => RunStatus::Failed,
        };
        let summary = PipelineRunSummary::from_context(
            pipeline,
            ctx,
            status,
            outcome.as_ref().err().map(|e| e.to_string()),
        );

        match &outcome {
            Ok(()) => {
                info!(duration_ms = summary.duration_ms, "pipeline run completed");
                emitter.emit(PipelineEventKind::Progress {
                    fraction: 1.0,
                    message: "Completed".into(),
                });
                emitter.emit(PipelineEventKind::PipelineCompleted {
                    summary: summary.clone(),
                });
            }
            Err(e) => info!(status = status.as_str(), "pipeline run ended: {e}"),
        }

        if let Some(sink) = &self.record_sink {
            if let Err(e) = sink.save(&PipelineExecutionRecord::new(summary)) {
                warn!("failed to save execution record: {e:#}");
            }
        }

        outcome
    }

    async fn run_loaded(
        &self,
        pipeline: &Pipeline,
        ctx: &PipelineContext,
        config: &OrchestratorConfig,
        emitter: &EventEmitter,
        loaded: &mut LoadedElements,
    ) -> Result<()> {
        // ── Instantiate ──────────────────────────────────────────────────────
        for instance in pipeline.enabled_elements() {
            let mut element = self
                .registry
                .create(&instance.type_id)
                .ok_or_else(|| PipelineError::ElementNotFound(instance.type_id.clone()))?;
            element.set_configuration(instance.configuration.clone());
            element.set_enabled(instance.is_enabled);
            loaded.push(LoadedElement {
                instance_id: instance.id.clone(),
                type_id: instance.type_id.clone(),
                element,
            });
        }

        // ── Host wiring, sleep policy, prepare ───────────────────────────────
        // Backends are bound first: disabling sleep wakes the element at once.
        for entry in loaded.iter_mut() {
            if let Some(configurator) = &self.configurator {
                configurator.configure(entry.element.as_mut(), &entry.instance_id);
            }
            if let Some(lifecycle) = entry.lifecycle() {
                forward_state_changes(entry.instance_id.clone(), lifecycle.subscribe(), emitter.clone());
                lifecycle
                    .configure(config.sleep_config_for(&entry.type_id))
                    .await
                    .map_err(|e| element_failed(&entry.instance_id, e.into()))?;
            }
            entry
                .element
                .prepare()
                .await
                .map_err(|source| element_failed(&entry.instance_id, source))?;
            debug!(element_id = %entry.instance_id, element_type = %entry.type_id, "element prepared");
        }

        // ── Execute in order ─────────────────────────────────────────────────
        let total = loaded.len();
        let timeout = config.element_timeout();
        for index in 0..total {
            let Some(entry) = loaded.get_mut(index) else {
                break;
            };

            if ctx.is_cancelled() {
                ctx.record_metrics(ElementExecutionMetrics::not_run(
                    &entry.instance_id,
                    &entry.type_id,
                    ExecutionStatus::Cancelled,
                    ctx.text_char_count(),
                ));
                info!(element_id = %entry.instance_id, "run cancelled before element");
                return Err(PipelineError::Cancelled);
            }

            if !entry.element.is_enabled() {
                ctx.record_metrics(ElementExecutionMetrics::not_run(
                    &entry.instance_id,
                    &entry.type_id,
                    ExecutionStatus::Skipped,
                    ctx.text_char_count(),
                ));
                debug!(element_id = %entry.instance_id, "element disabled, skipping");
                continue;
            }

            ctx.set_current_element_id(Some(entry.instance_id.clone()));
            emitter.emit(PipelineEventKind::Progress {
                fraction: index as f64 / total as f64,
                message: format!("Running {}", entry.display_name()),
            });
            emitter.emit(PipelineEventKind::ElementStarted {
                element_id: entry.instance_id.clone(),
            });

            let input_char_count = ctx.text_char_count();
            let memory_before = process_memory_bytes();
            let start_time = Utc::now();
            let started = Instant::now();

            let outcome = process_element(entry, ctx, timeout).await;

            let elapsed = started.elapsed();
            let duration_ms = elapsed.as_secs_f64() * 1_000.0;
            ctx.record_timing(entry.instance_id.clone(), elapsed);
            let mut metrics = ElementExecutionMetrics {
                element_id: entry.instance_id.clone(),
                element_type: entry.type_id.clone(),
                start_time,
                end_time: Utc::now(),
                duration_ms,
                status: ExecutionStatus::Success,
                memory_used_bytes: memory_delta(memory_before, process_memory_bytes()),
                input_char_count,
                output_char_count: ctx.text_char_count(),
                error_message: None,
            };

            match outcome {
                Ok(()) => {
                    ctx.record_metrics(metrics);
                    info!(
                        element_id = %entry.instance_id,
                        element_type = %entry.type_id,
                        duration_ms,
                        "element completed"
                    );
                    emitter.emit(PipelineEventKind::ElementCompleted {
                        element_id: entry.instance_id.clone(),
                        duration_ms,
                    });
                }
                Err(e) => {
                    let message = failure_message(&e);
                    metrics.status = ExecutionStatus::Failed;
                    metrics.error_message = Some(message.clone());
                    ctx.record_metrics(metrics);
                    error!(
                        element_id = %entry.instance_id,
                        element_type = %entry.type_id,
                        duration_ms,
                        "element failed: {message}"
                    );
                    emitter.emit(PipelineEventKind::Error {
                        element_id: entry.instance_id.clone(),
                        message,
                    });
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

/// `begin_processing` → `process` (optionally bounded) → `end_processing`.
async fn process_element(
    entry: &mut LoadedElement,
    ctx: &PipelineContext,
    timeout: Option<Duration>,
) -> Result<()> {
    let lifecycle = entry.lifecycle();
    if let Some(lifecycle) = &lifecycle {
        lifecycle
            .begin_processing()
            .await
            .map_err(|e| element_failed(&entry.instance_id, e.into()))?;
    }

    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, entry.element.process(ctx)).await {
            Ok(result) => result.map_err(|source| element_failed(&entry.instance_id, source)),
            Err(_) => Err(PipelineError::ElementTimedOut {
                element_id: entry.instance_id.clone(),
                timeout: limit,
            }),
        },
        None => entry
            .element
            .process(ctx)
            .await
            .map_err(|source| element_failed(&entry.instance_id, source)),
    };

    if let Some(lifecycle) = &lifecycle {
        if let Err(e) = lifecycle.end_processing().await {
            warn!(element_id = %entry.instance_id, "end_processing failed: {e}");
        }
    }
    result
}

fn element_failed(element_id: &str, source: anyhow::Error) -> PipelineError {
    PipelineError::ElementFailed {
        element_id: element_id.to_string(),
        source,
    }
}

/// Message stored in failed metrics: the element's own error chain.
fn failure_message(err: &PipelineError) -> String {
    match err {
        PipelineError::ElementFailed { source, .. } => format!("{source:#}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_run_publishes_context_before_cancel_can_observe_it() {
        let orchestrator = PipelineOrchestrator::new(Arc::new(ElementRegistry::new()));
        let previous = Arc::new(PipelineContext::new());
        *orchestrator.current.lock() = Some(Arc::clone(&previous));

        let ctx = Arc::new(PipelineContext::new());
        let guard = orchestrator.begin_run(&ctx).expect("slot is free");
        orchestrator.cancel();
        assert!(ctx.is_cancelled());
        assert!(!previous.is_cancelled());

        let rejected = Arc::new(PipelineContext::new());
        assert!(matches!(
            orchestrator.begin_run(&rejected),
            Err(PipelineError::AlreadyRunning)
        ));
        let current = orchestrator.current_context().expect("current context");
        assert!(Arc::ptr_eq(&current, &ctx));

        drop(guard);
        assert!(!orchestrator.is_running());
        orchestrator.cancel();
        assert!(!rejected.is_cancelled());
    }

    #[test]
    fn sleep_overrides_fall_back_to_default() {
        let mut config = OrchestratorConfig::default();
        config
            .sleep_overrides
            .insert("text_refinement".into(), SleepConfiguration::always_resident());

        assert_eq!(
            config.sleep_config_for("text_refinement"),
            SleepConfiguration::always_resident()
        );
        assert_eq!(
            config.sleep_config_for("transcription"),
            SleepConfiguration::default()
        );
    }

    #[test]
    fn element_timeout_ignores_non_positive_values() {
        let mut config = OrchestratorConfig::default();
        assert_eq!(config.element_timeout(), None);
        config.element_timeout_secs = Some(0.0);
        assert_eq!(config.element_timeout(), None);
        config.element_timeout_secs = Some(1.5);
        assert_eq!(config.element_timeout(), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn config_deserializes_camel_case_with_defaults() {
        let raw = r#"{"sleepOverrides":{"transcription":{"enabled":false}},"elementTimeoutSecs":30}"#;
        let config: OrchestratorConfig = serde_json::from_str(raw).expect("deserialize config");
        assert_eq!(config.default_sleep, SleepConfiguration::default());
        let stt = config.sleep_config_for("transcription");
        assert!(!stt.enabled);
        assert_eq!(stt.auto_sleep_delay_seconds, 60.0);
        assert_eq!(config.element_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn failure_message_unwraps_element_errors() {
        let err = element_failed("el-1", anyhow::anyhow!("inner").context("outer"));
        assert_eq!(failure_message(&err), "outer: inner");
        assert_eq!(failure_message(&PipelineError::Cancelled), "pipeline run was cancelled");
    }

    #[test]
    fn run_guard_is_single_flight() {
        let flag = AtomicBool::new(false);
        let guard = RunGuard::acquire(&flag).expect("first acquire");
        assert!(matches!(
            RunGuard::acquire(&flag),
            Err(PipelineError::AlreadyRunning)
        ));
        drop(guard);
        assert!(RunGuard::acquire(&flag).is_ok());
    }

    #[test]
    fn orchestrator_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineOrchestrator>();
    }
}
