//! Resource usage estimates for elements that hold heavy state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lifecycle::LifecycleHandle;

/// Estimated footprint of an element's backing resource.
///
/// This is a static estimate supplied by the element, not a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub model_loaded: bool,
    pub gpu_memory_bytes: u64,
    pub last_active_time: Option<DateTime<Utc>>,
}

impl ResourceUsage {
    pub const ZERO: Self = Self {
        memory_bytes: 0,
        model_loaded: false,
        gpu_memory_bytes: 0,
        last_active_time: None,
    };

    pub fn loaded(memory_bytes: u64, gpu_memory_bytes: u64) -> Self {
        Self {
            memory_bytes,
            model_loaded: true,
            gpu_memory_bytes,
            last_active_time: None,
        }
    }
}

/// Resource-tracking capability.
///
/// Reports [`ResourceUsage::ZERO`] while the linked lifecycle is asleep and
/// the static estimate while it is awake. Without a lifecycle the resource
/// is considered permanently resident.
#[derive(Debug, Clone)]
pub struct ResourceTracker {
    estimated: ResourceUsage,
    lifecycle: Option<LifecycleHandle>,
}

impl ResourceTracker {
    pub fn new(estimated: ResourceUsage) -> Self {
        Self {
            estimated,
            lifecycle: None,
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleHandle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn estimated_usage(&self) -> ResourceUsage {
        self.estimated
    }

    pub fn usage(&self) -> ResourceUsage {
        match &self.lifecycle {
            Some(lifecycle) if !lifecycle.is_awake() => ResourceUsage::ZERO,
            Some(lifecycle) => ResourceUsage {
                last_active_time: lifecycle.last_active(),
                ..self.estimated
            },
            None => self.estimated,
        }
    }
}
