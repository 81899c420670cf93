//! End-to-end orchestrator behaviour against scripted elements.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::elements::{
    insert::{InsertMethod, TextInserter},
    register_builtin_elements,
    transcription::{StubTranscriber, TranscriptionElement},
};
use cadence_core::{
    ConnectionRules, ConstraintSet, DataType, Element, ElementCapabilities, ElementMetadata,
    ElementRegistry, ElementSettings, ElementState, ExecutionRecordSink, ExecutionStatus,
    LifecycleHandle, MemoryRecordStore, OrchestratorConfig, Pipeline, PipelineContext,
    PipelineElementInstance, PipelineError, PipelineEvent, PipelineEventKind,
    PipelineOrchestrator, ResourceLoader, RunStatus, SleepConfiguration,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

// ---------------------------------------------------------------------------
// Scripted elements
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Behavior {
    Append(&'static str),
    Fail,
    FailPrepare,
    CancelRun,
    WaitForGate,
    Hang,
}

#[derive(Default)]
struct Stats {
    processed: Mutex<Vec<String>>,
    cleanups: AtomicUsize,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    states_in_process: Mutex<Vec<ElementState>>,
}

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

struct StatsLoader(Arc<Stats>);

#[async_trait]
impl ResourceLoader for StatsLoader {
    async fn load(&self) -> anyhow::Result<()> {
        self.0.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self) -> anyhow::Result<()> {
        self.0.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Scripted {
    type_id: &'static str,
    behavior: Behavior,
    settings: ElementSettings,
    stats: Arc<Stats>,
    gate: Arc<Gate>,
    lifecycle: Option<LifecycleHandle>,
}

#[async_trait]
impl Element for Scripted {
    fn element_type(&self) -> &str {
        self.type_id
    }

    fn metadata(&self) -> ElementMetadata {
        ElementMetadata::new(self.type_id, "scripted test element", "")
    }

    fn constraints(&self) -> ConstraintSet {
        ConstraintSet::ALLOW_MULTIPLE
    }

    fn connection_rules(&self) -> ConnectionRules {
        ConnectionRules::new([DataType::Any], DataType::Text)
    }

    fn capabilities(&self) -> ElementCapabilities {
        ElementCapabilities {
            lifecycle: self.lifecycle.clone(),
            resources: None,
        }
    }

    fn settings(&self) -> &ElementSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut ElementSettings {
        &mut self.settings
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn prepare(&mut self) -> anyhow::Result<()> {
        if let Behavior::FailPrepare = self.behavior {
            anyhow::bail!("scripted prepare failure");
        }
        if let Some(lifecycle) = &self.lifecycle {
            if lifecycle.sleep_config().wakes_on_prepare() {
                lifecycle.ensure_awake().await?;
            }
        }
        Ok(())
    }

    async fn process(&mut self, ctx: &PipelineContext) -> anyhow::Result<()> {
        self.stats.processed.lock().push(self.type_id.to_string());
        if let Some(lifecycle) = &self.lifecycle {
            self.stats.states_in_process.lock().push(lifecycle.state());
        }
        match self.behavior {
            Behavior::Append(tag) => {
                ctx.set_text(format!("{}{tag}", ctx.text()));
                Ok(())
            }
            Behavior::Fail | Behavior::FailPrepare => anyhow::bail!("scripted failure"),
            Behavior::CancelRun => {
                ctx.cancel();
                Ok(())
            }
            Behavior::WaitForGate => {
                self.gate.entered.notify_one();
                self.gate.release.notified().await;
                Ok(())
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(())
            }
        }
    }

    async fn cleanup(&mut self) -> anyhow::Result<()> {
        self.stats.cleanups.fetch_add(1, Ordering::SeqCst);
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.release().await?;
        }
        Ok(())
    }
}

struct Harness {
    registry: Arc<ElementRegistry>,
    stats: Arc<Stats>,
    gate: Arc<Gate>,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(ElementRegistry::new());
        let stats = Arc::new(Stats::default());
        let gate = Arc::new(Gate::default());

        let scripted: [(&'static str, Behavior, bool); 9] = [
            ("a", Behavior::Append("a"), false),
            ("b", Behavior::Append("b"), false),
            ("c", Behavior::Append("c"), false),
            ("fail", Behavior::Fail, false),
            ("badprep", Behavior::FailPrepare, false),
            ("cancel", Behavior::CancelRun, false),
            ("gate", Behavior::WaitForGate, false),
            ("hang", Behavior::Hang, false),
            ("sleepy", Behavior::Append("z"), true),
        ];
        for (type_id, behavior, sleepable) in scripted {
            let stats = Arc::clone(&stats);
            let gate = Arc::clone(&gate);
            registry.register(type_id, move || -> Box<dyn Element> {
                let lifecycle = sleepable.then(|| {
                    LifecycleHandle::new(
                        type_id,
                        Arc::new(StatsLoader(Arc::clone(&stats))),
                        SleepConfiguration::default(),
                    )
                });
                Box::new(Scripted {
                    type_id,
                    behavior,
                    settings: ElementSettings::default(),
                    stats: Arc::clone(&stats),
                    gate: Arc::clone(&gate),
                    lifecycle,
                })
            });
        }

        Self {
            registry,
            stats,
            gate,
        }
    }

    fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(Arc::clone(&self.registry))
    }

    fn processed(&self) -> Vec<String> {
        self.stats.processed.lock().clone()
    }
}

/// Pipeline whose instance ids equal their type ids.
fn pipeline(types: &[&str]) -> Pipeline {
    types.iter().fold(Pipeline::new("test"), |p, t| {
        p.with_element(PipelineElementInstance::new(*t).with_id(*t))
    })
}

fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runs_elements_in_list_order() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let ctx = orchestrator
        .run(&pipeline(&["c", "a", "b"]), None)
        .await
        .expect("run succeeds");

    assert_eq!(ctx.text(), "cab");
    assert_eq!(harness.processed(), vec!["c", "a", "b"]);
    let statuses: Vec<ExecutionStatus> = ctx.all_metrics().iter().map(|m| m.status).collect();
    assert_eq!(statuses, vec![ExecutionStatus::Success; 3]);
    assert_eq!(harness.stats.cleanups.load(Ordering::SeqCst), 3);
    assert!(ctx.element_timing("a").is_some());
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn second_run_fails_fast_while_first_is_in_flight() {
    let harness = Harness::new();
    let orchestrator = Arc::new(harness.orchestrator());

    let first_ctx = Arc::new(PipelineContext::new());
    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        let pipeline = pipeline(&["gate", "a"]);
        let ctx = Arc::clone(&first_ctx);
        tokio::spawn(async move { orchestrator.run(&pipeline, Some(ctx)).await })
    };
    harness.gate.entered.notified().await;
    assert!(orchestrator.is_running());

    let second_ctx = Arc::new(PipelineContext::new());
    let second = orchestrator
        .run(&pipeline(&["b"]), Some(Arc::clone(&second_ctx)))
        .await;
    assert!(matches!(second, Err(PipelineError::AlreadyRunning)));
    let current = orchestrator.current_context().expect("in-flight context");
    assert!(Arc::ptr_eq(&current, &first_ctx));
    assert!(!second_ctx.is_cancelled());
    assert!(second_ctx.all_metrics().is_empty());

    harness.gate.release.notify_one();
    let ctx = first.await.expect("join").expect("first run succeeds");
    assert_eq!(ctx.text(), "a");
    // The rejected run never touched an element.
    assert_eq!(harness.processed(), vec!["gate", "a"]);

    orchestrator
        .run(&pipeline(&["b"]), None)
        .await
        .expect("runs again once idle");
}

#[tokio::test]
async fn failure_stops_the_run_and_records_metrics() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    let ctx = Arc::new(PipelineContext::new());

    let err = orchestrator
        .run(&pipeline(&["a", "fail", "c"]), Some(Arc::clone(&ctx)))
        .await
        .expect_err("run fails");

    match &err {
        PipelineError::ElementFailed { element_id, source } => {
            assert_eq!(element_id, "fail");
            assert_eq!(source.to_string(), "scripted failure");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.processed(), vec!["a", "fail"]);

    let a = ctx.element_metrics("a").expect("a recorded");
    assert_eq!(a.status, ExecutionStatus::Success);
    let failed = ctx.element_metrics("fail").expect("fail recorded");
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("scripted failure"));
    assert!(ctx.element_metrics("c").is_none());

    // Every instantiated element is cleaned up, including the one that never ran.
    assert_eq!(harness.stats.cleanups.load(Ordering::SeqCst), 3);
    assert!(ctx.current_element_id().is_none());
    assert!(orchestrator.current_context().is_some());
}

#[tokio::test]
async fn prepare_failure_tears_down_every_instantiated_element() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    let ctx = Arc::new(PipelineContext::new());

    let err = orchestrator
        .run(&pipeline(&["a", "badprep", "c"]), Some(Arc::clone(&ctx)))
        .await
        .expect_err("prepare fails");

    match &err {
        PipelineError::ElementFailed { element_id, source } => {
            assert_eq!(element_id, "badprep");
            assert_eq!(source.to_string(), "scripted prepare failure");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(harness.processed().is_empty());
    assert!(ctx.all_metrics().is_empty());
    assert_eq!(harness.stats.cleanups.load(Ordering::SeqCst), 3);
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn cancellation_is_observed_at_the_next_boundary() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    let ctx = Arc::new(PipelineContext::new());

    let err = orchestrator
        .run(&pipeline(&["a", "cancel", "b", "c"]), Some(Arc::clone(&ctx)))
        .await
        .expect_err("run is cancelled");

    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(harness.processed(), vec!["a", "cancel"]);
    assert_eq!(
        ctx.element_metrics("cancel").map(|m| m.status),
        Some(ExecutionStatus::Success)
    );
    assert_eq!(
        ctx.element_metrics("b").map(|m| m.status),
        Some(ExecutionStatus::Cancelled)
    );
    assert!(ctx.element_metrics("c").is_none());
    assert_eq!(harness.stats.cleanups.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn external_cancel_waits_for_the_current_element() {
    let harness = Harness::new();
    let orchestrator = Arc::new(harness.orchestrator());

    let run = {
        let orchestrator = Arc::clone(&orchestrator);
        let pipeline = pipeline(&["gate", "a"]);
        tokio::spawn(async move { orchestrator.run(&pipeline, None).await })
    };
    harness.gate.entered.notified().await;
    orchestrator.cancel();
    harness.gate.release.notify_one();

    let err = run.await.expect("join").expect_err("cancelled");
    assert!(matches!(err, PipelineError::Cancelled));
    // `gate` finished its work; `a` never started.
    assert_eq!(harness.processed(), vec!["gate"]);

    // Cancelling while idle is a no-op.
    orchestrator.cancel();
    orchestrator
        .run(&pipeline(&["a"]), None)
        .await
        .expect("fresh run is unaffected");
}

#[tokio::test]
async fn invalid_pipeline_never_instantiates_elements() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();

    let err = orchestrator
        .run(&pipeline(&["a", "unknown"]), None)
        .await
        .expect_err("validation fails");
    match err {
        PipelineError::ValidationFailed(errors) => assert_eq!(errors.len(), 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.stats.cleanups.load(Ordering::SeqCst), 0);

    let empty = orchestrator.run(&Pipeline::new("empty"), None).await;
    assert!(matches!(empty, Err(PipelineError::ValidationFailed(_))));
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn events_follow_the_run() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    let mut rx = orchestrator.subscribe();

    let ctx = orchestrator
        .run(&pipeline(&["a", "b"]), None)
        .await
        .expect("run succeeds");
    let events = drain(&mut rx);

    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(events.iter().all(|e| e.run_id == ctx.run_id()));

    let kinds: Vec<String> = events
        .iter()
        .map(|e| match &e.kind {
            PipelineEventKind::Progress { fraction, .. } => format!("progress {fraction:.1}"),
            PipelineEventKind::ElementStarted { element_id } => format!("started {element_id}"),
            PipelineEventKind::ElementCompleted { element_id, .. } => {
                format!("completed {element_id}")
            }
            PipelineEventKind::PipelineCompleted { summary } => {
                format!("done {}", summary.final_text)
            }
            other => format!("{other:?}"),
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "progress 0.0",
            "started a",
            "completed a",
            "progress 0.5",
            "started b",
            "completed b",
            "progress 1.0",
            "done ab",
        ]
    );
}

#[tokio::test]
async fn failure_emits_error_event_without_completion() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    let mut rx = orchestrator.subscribe();

    orchestrator
        .run(&pipeline(&["fail"]), None)
        .await
        .expect_err("run fails");
    let events = drain(&mut rx);

    assert!(events.iter().any(|e| matches!(
        &e.kind,
        PipelineEventKind::Error { element_id, message }
            if element_id == "fail" && message == "scripted failure"
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e.kind, PipelineEventKind::PipelineCompleted { .. })));
}

#[tokio::test(start_paused = true)]
async fn element_timeout_fails_the_run() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator().with_config(OrchestratorConfig {
        element_timeout_secs: Some(2.0),
        ..OrchestratorConfig::default()
    });

    let err = orchestrator
        .run(&pipeline(&["a", "hang", "b"]), None)
        .await
        .expect_err("times out");

    match err {
        PipelineError::ElementTimedOut {
            element_id,
            timeout,
        } => {
            assert_eq!(element_id, "hang");
            assert_eq!(timeout, Duration::from_secs(2));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.processed(), vec!["a", "hang"]);
}

#[tokio::test]
async fn configurator_can_disable_elements_at_runtime() {
    let harness = Harness::new();
    let orchestrator = harness
        .orchestrator()
        .with_configurator(|element: &mut dyn Element, instance_id: &str| {
            if instance_id == "b" {
                element.set_enabled(false);
            }
        });

    let ctx = orchestrator
        .run(&pipeline(&["a", "b", "c"]), None)
        .await
        .expect("run succeeds");

    assert_eq!(ctx.text(), "ac");
    assert_eq!(
        ctx.element_metrics("b").map(|m| m.status),
        Some(ExecutionStatus::Skipped)
    );
}

#[tokio::test]
async fn pipeline_disabled_instances_are_not_instantiated() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    let mut p = pipeline(&["a", "b"]);
    p.toggle_element("b");

    let ctx = orchestrator.run(&p, None).await.expect("run succeeds");
    assert_eq!(ctx.text(), "a");
    assert!(ctx.element_metrics("b").is_none());
    assert_eq!(harness.stats.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sleepable_elements_wake_for_work_and_sleep_on_cleanup() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator();
    let mut rx = orchestrator.subscribe();

    orchestrator
        .run(&pipeline(&["sleepy"]), None)
        .await
        .expect("run succeeds");

    assert_eq!(
        harness.stats.states_in_process.lock().clone(),
        vec![ElementState::Processing]
    );
    assert_eq!(harness.stats.loads.load(Ordering::SeqCst), 1);
    assert_eq!(harness.stats.unloads.load(Ordering::SeqCst), 1);

    // State changes are forwarded from a separate task.
    tokio::task::yield_now().await;
    let states: Vec<ElementState> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e.kind {
            PipelineEventKind::ElementStateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert!(!states.is_empty());
    assert!(states.iter().all(|s| *s != ElementState::Error), "{states:?}");
}

#[tokio::test]
async fn resident_override_pre_warms_in_prepare() {
    let harness = Harness::new();
    let mut config = OrchestratorConfig::default();
    config
        .sleep_overrides
        .insert("sleepy".into(), SleepConfiguration::always_resident());
    let orchestrator = harness.orchestrator().with_config(config);

    orchestrator
        .run(&pipeline(&["sleepy"]), None)
        .await
        .expect("run succeeds");

    assert_eq!(harness.stats.loads.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.stats.states_in_process.lock().clone(),
        vec![ElementState::Processing]
    );
}

#[tokio::test]
async fn record_sink_receives_every_validated_run() {
    let harness = Harness::new();
    let store = Arc::new(MemoryRecordStore::new(10));
    let orchestrator = harness
        .orchestrator()
        .with_record_sink(store.clone() as Arc<dyn ExecutionRecordSink>);

    orchestrator
        .run(&pipeline(&["a"]), None)
        .await
        .expect("run succeeds");
    orchestrator
        .run(&pipeline(&["fail"]), None)
        .await
        .expect_err("run fails");
    orchestrator
        .run(&pipeline(&["missing"]), None)
        .await
        .expect_err("invalid");

    let records = store.recent(10).expect("recent");
    assert_eq!(records.len(), 2);
    let statuses: Vec<RunStatus> = records.iter().map(|r| r.summary.status).collect();
    assert!(statuses.contains(&RunStatus::Completed));
    assert!(statuses.contains(&RunStatus::Failed));
}

#[tokio::test]
async fn builtin_dictation_pipeline_end_to_end() {
    #[derive(Default)]
    struct Captured(Mutex<Vec<String>>);

    #[async_trait]
    impl TextInserter for Captured {
        async fn insert(&self, text: &str, _method: InsertMethod) -> anyhow::Result<()> {
            self.0.lock().push(text.to_string());
            Ok(())
        }
    }

    let registry = Arc::new(ElementRegistry::new());
    register_builtin_elements(&registry);
    let inserted = Arc::new(Captured::default());
    let sink = Arc::clone(&inserted);

    let orchestrator = PipelineOrchestrator::new(registry).with_configurator(
        move |element: &mut dyn Element, _id: &str| {
            let any = element.as_any_mut();
            if let Some(stt) = any.downcast_mut::<TranscriptionElement>() {
                stt.bind_transcriber(Arc::new(StubTranscriber));
            } else if let Some(insert) =
                any.downcast_mut::<cadence_core::elements::insert::InsertTextElement>()
            {
                insert.bind_inserter(sink.clone());
            }
        },
    );

    let p = ["vad_trim", "transcription", "text_cleanup", "insert_text"]
        .into_iter()
        .fold(Pipeline::new("dictation"), |p, t| {
            p.with_element(PipelineElementInstance::new(t))
        });
    let mut samples = vec![0.0f32; 3_200];
    samples.extend((0..1_600).map(|i| if i % 2 == 0 { 0.3 } else { -0.3 }));
    samples.extend(vec![0.0f32; 3_200]);
    let ctx = Arc::new(PipelineContext::new().with_audio(samples, 16_000));

    let ctx = orchestrator
        .run(&p, Some(ctx))
        .await
        .expect("dictation run succeeds");

    let inserted = inserted.0.lock().clone();
    assert_eq!(inserted.len(), 1);
    assert!(inserted[0].starts_with("[stub: "), "{inserted:?}");
    assert_eq!(ctx.custom_data::<bool>("vadApplied"), Some(true));
    assert_eq!(ctx.custom_data::<bool>("textInserted"), Some(true));
    assert_eq!(ctx.all_metrics().len(), 4);
}
