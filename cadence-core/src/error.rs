use std::time::Duration;

use thiserror::Error;

use crate::pipeline::validation::ValidationError;

/// Errors that abort a pipeline run.
///
/// Validation problems are reported as data through
/// [`ValidationResult`](crate::pipeline::validation::ValidationResult) and only
/// become fatal once wrapped in `ValidationFailed` by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("a pipeline run is already in progress")]
    AlreadyRunning,

    #[error("pipeline validation failed with {} error(s)", .0.len())]
    ValidationFailed(Vec<ValidationError>),

    #[error("no element registered for type `{0}`")]
    ElementNotFound(String),

    #[error("element `{element_id}` failed: {source}")]
    ElementFailed {
        element_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("element `{element_id}` did not finish within {timeout:?}")]
    ElementTimedOut {
        element_id: String,
        timeout: Duration,
    },

    #[error("pipeline run was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Element id attached to element-scoped failures.
    pub fn element_id(&self) -> Option<&str> {
        match self {
            PipelineError::ElementFailed { element_id, .. }
            | PipelineError::ElementTimedOut { element_id, .. } => Some(element_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
