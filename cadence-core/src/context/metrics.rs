//! Per-element execution metrics recorded on the [`PipelineContext`](super::PipelineContext).

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};

/// Outcome of one element within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Skipped,
    Failed,
    Cancelled,
}

/// Timing and size ledger entry for one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementExecutionMetrics {
    pub element_id: String,
    pub element_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: f64,
    pub status: ExecutionStatus,
    /// Change in process resident memory across the element, when readable.
    pub memory_used_bytes: Option<i64>,
    pub input_char_count: usize,
    pub output_char_count: usize,
    pub error_message: Option<String>,
}

impl ElementExecutionMetrics {
    /// Entry for an element that never ran (`Skipped` or `Cancelled`).
    pub fn not_run(
        element_id: impl Into<String>,
        element_type: impl Into<String>,
        status: ExecutionStatus,
        input_char_count: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            element_id: element_id.into(),
            element_type: element_type.into(),
            start_time: now,
            end_time: now,
            duration_ms: 0.0,
            status,
            memory_used_bytes: None,
            input_char_count,
            output_char_count: input_char_count,
            error_message: None,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_ms.max(0.0) / 1_000.0)
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Coarse resident set size of the current process, in bytes.
pub fn process_memory_bytes() -> Option<u64> {
    static SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();

    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = SYSTEM.get_or_init(|| Mutex::new(System::new())).lock();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory())
}

/// Signed difference between two memory readings.
pub fn memory_delta(before: Option<u64>, after: Option<u64>) -> Option<i64> {
    let (before, after) = (before?, after?);
    Some(after as i64 - before as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_resident_memory_of_this_process() {
        let first = process_memory_bytes().expect("own process is visible");
        assert!(first > 0);
        let second = process_memory_bytes().expect("second reading");
        assert!(memory_delta(Some(first), Some(second)).is_some());
    }

    #[test]
    fn memory_delta_needs_both_readings() {
        assert_eq!(memory_delta(Some(100), Some(40)), Some(-60));
        assert_eq!(memory_delta(None, Some(40)), None);
    }

    #[test]
    fn not_run_entries_carry_text_size_through() {
        let m = ElementExecutionMetrics::not_run("el-1", "notify", ExecutionStatus::Cancelled, 12);
        assert_eq!(m.output_char_count, 12);
        assert_eq!(m.duration(), Duration::ZERO);
        assert!(!m.is_success());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_value(ExecutionStatus::Cancelled).expect("serialize status");
        assert_eq!(json, "cancelled");
    }
}
