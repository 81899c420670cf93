//! Run summaries and the persistence seam for execution history.
//!
//! The orchestrator only *produces* [`PipelineRunSummary`] values; storing
//! and querying them is the job of an [`ExecutionRecordSink`] supplied by the
//! host. [`MemoryRecordStore`] is a bounded in-process sink for tests and
//! embedders that do not need durability.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::context::metrics::ElementExecutionMetrics;
use crate::context::PipelineContext;
use crate::pipeline::{new_id, Pipeline};

/// Final outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Read-only projection of a finished [`PipelineContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSummary {
    pub run_id: String,
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub original_text: String,
    pub final_text: String,
    pub language: Option<String>,
    /// Length of the audio left in the context, in seconds.
    pub audio_duration_secs: Option<f64>,
    pub element_metrics: Vec<ElementExecutionMetrics>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl PipelineRunSummary {
    pub fn from_context(
        pipeline: &Pipeline,
        ctx: &PipelineContext,
        status: RunStatus,
        error: Option<String>,
    ) -> Self {
        let audio_duration_secs = ctx.audio_samples().and_then(|samples| {
            let rate = ctx.sample_rate();
            (rate > 0).then(|| samples.len() as f64 / f64::from(rate))
        });

        Self {
            run_id: ctx.run_id().to_string(),
            pipeline_id: pipeline.id.clone(),
            pipeline_name: pipeline.name.clone(),
            status,
            started_at: ctx.started_at(),
            finished_at: Utc::now(),
            duration_ms: ctx.elapsed().as_secs_f64() * 1_000.0,
            original_text: ctx.original_text(),
            final_text: ctx.text(),
            language: ctx.language(),
            audio_duration_secs,
            element_metrics: ctx.all_metrics(),
            warnings: ctx.warnings(),
            error,
        }
    }
}

/// A summary as handed to an [`ExecutionRecordSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecutionRecord {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    pub summary: PipelineRunSummary,
}

impl PipelineExecutionRecord {
    pub fn new(summary: PipelineRunSummary) -> Self {
        Self {
            id: new_id("rec"),
            recorded_at: summary.finished_at,
            summary,
        }
    }
}

/// Durable (or not) storage for execution records.
pub trait ExecutionRecordSink: Send + Sync {
    fn save(&self, record: &PipelineExecutionRecord) -> anyhow::Result<()>;

    fn get(&self, id: &str) -> anyhow::Result<Option<PipelineExecutionRecord>>;

    /// Most recent first.
    fn recent(&self, limit: usize) -> anyhow::Result<Vec<PipelineExecutionRecord>>;

    /// Records with `from <= recorded_at < to`, most recent first.
    fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PipelineExecutionRecord>>;

    /// Returns whether a record was removed.
    fn delete(&self, id: &str) -> anyhow::Result<bool>;

    /// Drop records older than `retention_days`. Returns the number removed.
    fn prune(&self, retention_days: u32) -> anyhow::Result<usize>;
}

/// Retention cutoff shared by sinks.
///
/// A window reaching past the representable range keeps everything.
pub fn retention_cutoff(retention_days: u32) -> DateTime<Utc> {
    ChronoDuration::try_days(i64::from(retention_days))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// In-memory sink keeping at most `max_items` records.
#[derive(Debug)]
pub struct MemoryRecordStore {
    max_items: usize,
    /// Sorted by `recorded_at`, newest first.
    records: Mutex<Vec<PipelineExecutionRecord>>,
}

impl MemoryRecordStore {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ExecutionRecordSink for MemoryRecordStore {
    fn save(&self, record: &PipelineExecutionRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        records.retain(|r| r.id != record.id);
        let at = records
            .iter()
            .position(|r| r.recorded_at <= record.recorded_at)
            .unwrap_or(records.len());
        records.insert(at, record.clone());
        records.truncate(self.max_items);
        Ok(())
    }

    fn get(&self, id: &str) -> anyhow::Result<Option<PipelineExecutionRecord>> {
        Ok(self.records.lock().iter().find(|r| r.id == id).cloned())
    }

    fn recent(&self, limit: usize) -> anyhow::Result<Vec<PipelineExecutionRecord>> {
        Ok(self.records.lock().iter().take(limit).cloned().collect())
    }

    fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<PipelineExecutionRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.recorded_at >= from && r.recorded_at < to)
            .cloned()
            .collect())
    }

    fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn prune(&self, retention_days: u32) -> anyhow::Result<usize> {
        let cutoff = retention_cutoff(retention_days);
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.recorded_at >= cutoff);
        Ok(before - records.len())
    }
}
