//! # cadence-core
//!
//! Reusable pipeline orchestration SDK.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline ──validate──► ValidationResult          (descriptors from ElementRegistry)
//!    │
//!    └─► PipelineOrchestrator::run
//!           ├─ ElementRegistry::create  → Box<dyn Element>
//!           ├─ ElementConfigurator hook  (host wires real backends)
//!           ├─ LifecycleHandle            sleeping ⇄ active/idle, auto-sleep timer
//!           └─ Element::process(&PipelineContext) in list order
//!                     │
//!              broadcast::Sender<PipelineEvent>
//! ```
//!
//! Exactly one run per orchestrator at a time. Cancellation is observed
//! between elements only.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod context;
pub mod element;
pub mod elements;
pub mod engine;
pub mod error;
pub mod history;
pub mod ipc;
pub mod pipeline;
pub mod registry;

// Convenience re-exports for downstream crates
pub use context::{
    metrics::{ElementExecutionMetrics, ExecutionStatus},
    PipelineContext,
};
pub use element::{
    descriptor::{ConnectionRules, ConstraintSet, DataType, ElementDescriptor},
    lifecycle::{ElementState, LifecycleHandle, ResourceLoader, SleepConfiguration},
    resource::{ResourceTracker, ResourceUsage},
    Configuration, Element, ElementCapabilities, ElementMetadata, ElementSettings,
};
pub use engine::{ElementConfigurator, OrchestratorConfig, PipelineOrchestrator};
pub use error::{PipelineError, Result};
pub use history::{
    ExecutionRecordSink, MemoryRecordStore, PipelineExecutionRecord, PipelineRunSummary, RunStatus,
};
pub use ipc::events::{PipelineEvent, PipelineEventKind};
pub use pipeline::{
    validation::{ValidationError, ValidationResult},
    Pipeline, PipelineElementInstance,
};
pub use registry::ElementRegistry;
