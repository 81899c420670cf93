//! Cadence command-line host.
//!
//! Wires the built-in element registry to host backends (stub transcriber,
//! console inserter, tracing notifier), the JSON settings file and the SQLite
//! execution history, then runs one command.

mod backends;
mod cli;
mod settings;
mod storage;

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use cadence_core::{
    element::is_action, elements::register_builtin_elements, ElementRegistry,
    ExecutionRecordSink, Pipeline, PipelineContext, PipelineElementInstance, PipelineError,
    PipelineEvent, PipelineEventKind, PipelineExecutionRecord, PipelineOrchestrator,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use backends::{load_wav, HostConfigurator};
use cli::{parse_args, Command, USAGE};
use settings::{default_settings_path, load_settings, AppSettings};
use storage::HistoryStore;

#[tokio::main]
async fn main() -> ExitCode {
    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
    debug!(settings_path = ?settings_path, "settings loaded");

    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e:#}\n\n{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match execute(command, &settings).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, settings: &AppSettings) -> anyhow::Result<ExitCode> {
    match command {
        Command::Help => {
            println!("{USAGE}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Elements => {
            let registry = builtin_registry();
            let listing: Vec<Value> = registry
                .all_descriptors()
                .into_iter()
                .map(|descriptor| -> serde_json::Result<Value> {
                    let kind = if is_action(&descriptor.connection_rules) {
                        "action"
                    } else {
                        "stage"
                    };
                    let mut value = serde_json::to_value(&descriptor)?;
                    if let Some(object) = value.as_object_mut() {
                        object.insert("kind".into(), Value::from(kind));
                    }
                    Ok(value)
                })
                .collect::<serde_json::Result<_>>()?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate(path) => {
            let pipeline = load_pipeline(&path)?;
            let result = builtin_registry().validate(&pipeline);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.is_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Run { pipeline, audio } => {
            let pipeline = match pipeline.or_else(|| settings.pipeline_path.clone()) {
                Some(path) => load_pipeline(&path)?,
                None => default_pipeline(),
            };
            run_pipeline(settings, &pipeline, &audio).await
        }
        Command::History(limit) => {
            let store = open_history(settings)?;
            print_records(&store.recent(limit)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Search { query, limit } => {
            let store = open_history(settings)?;
            print_records(&store.search(&query, limit)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Prune => {
            let store = open_history(settings)?;
            let removed = store.prune(settings.retention_days)?;
            println!("removed {removed} record(s), {} left", store.count()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear => {
            let store = open_history(settings)?;
            let removed = store.clear()?;
            info!(removed, path = %store.path().display(), "history cleared");
            println!("removed {removed} record(s)");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_pipeline(
    settings: &AppSettings,
    pipeline: &Pipeline,
    audio: &Path,
) -> anyhow::Result<ExitCode> {
    let (samples, sample_rate) = load_wav(audio)?;
    let ctx = Arc::new(
        PipelineContext::new()
            .with_audio(samples, sample_rate)
            .with_audio_file(audio),
    );

    let mut orchestrator = PipelineOrchestrator::new(builtin_registry())
        .with_config(settings.orchestrator.clone())
        .with_configurator(HostConfigurator::new(settings));
    if settings.history_enabled {
        let store: Arc<dyn ExecutionRecordSink> = Arc::new(open_history(settings)?);
        orchestrator = orchestrator.with_record_sink(store);
    }
    let orchestrator = Arc::new(orchestrator);

    let logger = tokio::spawn(log_events(orchestrator.subscribe()));
    let interrupt = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.cancel();
            }
        })
    };

    let outcome = orchestrator.run(pipeline, Some(ctx)).await;

    interrupt.abort();
    let _ = interrupt.await;
    drop(orchestrator);
    // Lets the logger drain; state forwarders may still hold the channel.
    let _ = tokio::time::timeout(Duration::from_secs(1), logger).await;

    match outcome {
        Ok(ctx) => {
            for warning in ctx.warnings() {
                warn!("{warning}");
            }
            info!(
                run_id = %ctx.run_id(),
                chars = ctx.text_char_count(),
                elapsed_ms = ctx.elapsed().as_millis() as u64,
                "run finished"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(PipelineError::ValidationFailed(errors)) => {
            for e in &errors {
                error!("invalid pipeline: {e}");
            }
            Ok(ExitCode::FAILURE)
        }
        Err(PipelineError::Cancelled) => {
            warn!("run cancelled");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

async fn log_events(mut rx: broadcast::Receiver<PipelineEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event logger lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match &event.kind {
            PipelineEventKind::ElementStarted { element_id } => {
                debug!(seq = event.seq, element_id = %element_id, "element started")
            }
            PipelineEventKind::ElementCompleted {
                element_id,
                duration_ms,
            } => info!(seq = event.seq, element_id = %element_id, duration_ms, "element completed"),
            PipelineEventKind::ElementStateChanged { element_id, state } => {
                debug!(seq = event.seq, element_id = %element_id, state = state.label(), "state changed")
            }
            PipelineEventKind::Progress { fraction, message } => {
                debug!(seq = event.seq, percent = (fraction * 100.0).round(), "{message}")
            }
            PipelineEventKind::Error {
                element_id,
                message,
            } => error!(seq = event.seq, element_id = %element_id, "{message}"),
            PipelineEventKind::PipelineCompleted { summary } => info!(
                seq = event.seq,
                pipeline = %summary.pipeline_name,
                duration_ms = summary.duration_ms,
                "pipeline completed"
            ),
        }
    }
}

fn builtin_registry() -> Arc<ElementRegistry> {
    let registry = ElementRegistry::new();
    register_builtin_elements(&registry);
    Arc::new(registry)
}

fn default_pipeline() -> Pipeline {
    ["vad_trim", "transcription", "text_cleanup", "insert_text"]
        .into_iter()
        .fold(Pipeline::new("Dictation"), |pipeline, type_id| {
            pipeline.with_element(PipelineElementInstance::new(type_id))
        })
}

fn load_pipeline(path: &Path) -> anyhow::Result<Pipeline> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Pipeline::from_json(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Open the history store and apply the retention window.
fn open_history(settings: &AppSettings) -> anyhow::Result<HistoryStore> {
    let store = HistoryStore::new(HistoryStore::default_db_path(), settings.history_max_items)?;
    let pruned = store.prune(settings.retention_days)?;
    if pruned > 0 {
        info!(pruned, path = %store.path().display(), "expired history pruned");
    }
    Ok(store)
}

fn print_records(records: &[PipelineExecutionRecord]) {
    if records.is_empty() {
        println!("no runs recorded");
        return;
    }
    for record in records {
        let summary = &record.summary;
        println!(
            "{}  {:<9}  {:>7.0}ms  {}  {}",
            record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            summary.status.as_str(),
            summary.duration_ms,
            summary.pipeline_name,
            summary.final_text
        );
    }
}
