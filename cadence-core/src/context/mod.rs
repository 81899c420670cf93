//! Payload and metrics ledger that flows through one pipeline run.
//!
//! [`PipelineContext`] is `Send + Sync`: the orchestrator and the element
//! currently executing write to it, while progress observers may read it
//! concurrently. All payload lives behind one `parking_lot::RwLock`; the
//! cancellation flag is a separate atomic so `cancel()` never waits on a
//! writer.

pub mod metrics;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::pipeline::new_id;

use self::metrics::ElementExecutionMetrics;

/// Sample rate assumed when a caller supplies none (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug)]
struct ContextState {
    audio_samples: Option<Arc<[f32]>>,
    sample_rate: u32,
    audio_file_path: Option<PathBuf>,
    text: String,
    original_text: String,
    language: Option<String>,
    confidences: BTreeMap<String, f64>,
    element_timings: HashMap<String, Duration>,
    element_metrics: HashMap<String, ElementExecutionMetrics>,
    /// First-recorded order of `element_metrics` keys.
    metrics_order: Vec<String>,
    warnings: Vec<String>,
    custom_data: HashMap<String, Value>,
    current_element_id: Option<String>,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            audio_samples: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            audio_file_path: None,
            text: String::new(),
            original_text: String::new(),
            language: None,
            confidences: BTreeMap::new(),
            element_timings: HashMap::new(),
            element_metrics: HashMap::new(),
            metrics_order: Vec::new(),
            warnings: Vec::new(),
            custom_data: HashMap::new(),
            current_element_id: None,
        }
    }
}

/// Mutable payload plus metrics for one run.
#[derive(Debug)]
pub struct PipelineContext {
    run_id: String,
    started_at: DateTime<Utc>,
    start_instant: Instant,
    cancelled: AtomicBool,
    state: RwLock<ContextState>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineContext {
    pub fn new() -> Self {
        Self {
            run_id: new_id("run"),
            started_at: Utc::now(),
            start_instant: Instant::now(),
            cancelled: AtomicBool::new(false),
            state: RwLock::new(ContextState::default()),
        }
    }

    /// Seed the context with mono PCM audio.
    pub fn with_audio(self, samples: Vec<f32>, sample_rate: u32) -> Self {
        self.set_audio(samples, sample_rate);
        self
    }

    pub fn with_audio_file(self, path: impl Into<PathBuf>) -> Self {
        self.set_audio_file_path(Some(path.into()));
        self
    }

    /// Seed the context with text; also becomes the original text.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        let text = text.into();
        {
            let mut state = self.state.write();
            state.original_text = text.clone();
            state.text = text;
        }
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since the context was created, computed on read.
    pub fn elapsed(&self) -> Duration {
        self.start_instant.elapsed()
    }

    // ── Audio ────────────────────────────────────────────────────────────

    pub fn audio_samples(&self) -> Option<Arc<[f32]>> {
        self.state.read().audio_samples.clone()
    }

    pub fn set_audio(&self, samples: Vec<f32>, sample_rate: u32) {
        let mut state = self.state.write();
        state.audio_samples = Some(Arc::from(samples));
        state.sample_rate = sample_rate;
    }

    pub fn clear_audio(&self) {
        self.state.write().audio_samples = None;
    }

    pub fn sample_rate(&self) -> u32 {
        self.state.read().sample_rate
    }

    pub fn audio_file_path(&self) -> Option<PathBuf> {
        self.state.read().audio_file_path.clone()
    }

    pub fn set_audio_file_path(&self, path: Option<PathBuf>) {
        self.state.write().audio_file_path = path;
    }

    // ── Text ─────────────────────────────────────────────────────────────

    pub fn text(&self) -> String {
        self.state.read().text.clone()
    }

    pub fn text_char_count(&self) -> usize {
        self.state.read().text.chars().count()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        self.state.write().text = text.into();
    }

    pub fn original_text(&self) -> String {
        self.state.read().original_text.clone()
    }

    pub fn set_original_text(&self, text: impl Into<String>) {
        self.state.write().original_text = text.into();
    }

    pub fn language(&self) -> Option<String> {
        self.state.read().language.clone()
    }

    pub fn set_language(&self, language: Option<String>) {
        self.state.write().language = language;
    }

    pub fn confidence(&self, key: &str) -> Option<f64> {
        self.state.read().confidences.get(key).copied()
    }

    pub fn set_confidence(&self, key: impl Into<String>, value: f64) {
        self.state.write().confidences.insert(key.into(), value);
    }

    pub fn confidences(&self) -> BTreeMap<String, f64> {
        self.state.read().confidences.clone()
    }

    // ── Metrics ledger ───────────────────────────────────────────────────

    /// Record the wall time of an element. Re-recording overwrites.
    pub fn record_timing(&self, element_id: impl Into<String>, duration: Duration) {
        self.state
            .write()
            .element_timings
            .insert(element_id.into(), duration);
    }

    pub fn element_timing(&self, element_id: &str) -> Option<Duration> {
        self.state.read().element_timings.get(element_id).copied()
    }

    /// Record metrics for an element. Re-recording overwrites.
    pub fn record_metrics(&self, metrics: ElementExecutionMetrics) {
        let mut state = self.state.write();
        if !state.element_metrics.contains_key(&metrics.element_id) {
            state.metrics_order.push(metrics.element_id.clone());
        }
        state
            .element_metrics
            .insert(metrics.element_id.clone(), metrics);
    }

    pub fn element_metrics(&self, element_id: &str) -> Option<ElementExecutionMetrics> {
        self.state.read().element_metrics.get(element_id).cloned()
    }

    /// All recorded metrics in the order elements were first recorded.
    pub fn all_metrics(&self) -> Vec<ElementExecutionMetrics> {
        let state = self.state.read();
        state
            .metrics_order
            .iter()
            .filter_map(|id| state.element_metrics.get(id).cloned())
            .collect()
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        self.state.write().warnings.push(warning.into());
    }

    pub fn warnings(&self) -> Vec<String> {
        self.state.read().warnings.clone()
    }

    // ── Custom data ──────────────────────────────────────────────────────

    /// Store an auxiliary value under `key`.
    pub fn set_custom_data<T: Serialize>(&self, key: impl Into<String>, value: &T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.state.write().custom_data.insert(key.into(), value);
        Ok(())
    }

    /// Read an auxiliary value back as `T`. `None` if absent or of another shape.
    pub fn custom_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.state.read().custom_data.get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn custom_value(&self, key: &str) -> Option<Value> {
        self.state.read().custom_data.get(key).cloned()
    }

    pub fn remove_custom_data(&self, key: &str) -> Option<Value> {
        self.state.write().custom_data.remove(key)
    }

    // ── Run control ──────────────────────────────────────────────────────

    /// Request cancellation. Observed at the next element boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn current_element_id(&self) -> Option<String> {
        self.state.read().current_element_id.clone()
    }

    pub(crate) fn set_current_element_id(&self, element_id: Option<String>) {
        self.state.write().current_element_id = element_id;
    }
}
