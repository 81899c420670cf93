//! Progress events broadcast during a pipeline run.
//!
//! | Kind | When |
//! |------|------|
//! | `elementStarted` | an element is about to run |
//! | `elementCompleted` | an element returned successfully |
//! | `elementStateChanged` | a sleepable element changed lifecycle state |
//! | `progress` | before each element, and `1.0` at the end |
//! | `error` | an element failed or timed out |
//! | `pipelineCompleted` | the run finished successfully |
//!
//! Delivery is best-effort: a lagging subscriber loses the oldest events,
//! it never slows the run down.

use serde::{Deserialize, Serialize};

use crate::element::lifecycle::ElementState;
use crate::history::PipelineRunSummary;

/// One observer notification, stamped with the run it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    /// Monotonically increasing sequence number per orchestrator.
    pub seq: u64,
    pub run_id: String,
    #[serde(flatten)]
    pub kind: PipelineEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PipelineEventKind {
    ElementStarted {
        element_id: String,
    },
    ElementCompleted {
        element_id: String,
        duration_ms: f64,
    },
    ElementStateChanged {
        element_id: String,
        state: ElementState,
    },
    Progress {
        /// Fraction of enabled elements started, in `[0.0, 1.0]`.
        fraction: f64,
        message: String,
    },
    Error {
        element_id: String,
        message: String,
    },
    PipelineCompleted {
        summary: PipelineRunSummary,
    },
}

impl PipelineEventKind {
    /// Element the event refers to, if any.
    pub fn element_id(&self) -> Option<&str> {
        match self {
            PipelineEventKind::ElementStarted { element_id }
            | PipelineEventKind::ElementCompleted { element_id, .. }
            | PipelineEventKind::ElementStateChanged { element_id, .. }
            | PipelineEventKind::Error { element_id, .. } => Some(element_id),
            PipelineEventKind::Progress { .. } | PipelineEventKind::PipelineCompleted { .. } => {
                None
            }
        }
    }
}
