//! Element abstraction.
//!
//! The `Element` trait decouples the orchestrator from concrete processing
//! units. Elements that transform data (audio → text, text → text) are
//! *stages*; elements that only cause side effects (typing text, notifying)
//! are *actions* and produce [`DataType::Action`].
//!
//! Optional capabilities are attached up front through
//! [`ElementCapabilities`] rather than probed per call.

pub mod descriptor;
pub mod lifecycle;
pub mod resource;

use std::any::Any;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::PipelineContext;

use self::descriptor::{
    CapabilityFlags, ConnectionRules, ConstraintSet, DataType, ElementDescriptor,
};
use self::lifecycle::LifecycleHandle;
use self::resource::ResourceTracker;

/// Per-instance configuration: primitive JSON values keyed by name.
pub type Configuration = serde_json::Map<String, Value>;

/// Presentation metadata passed through to hosts untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementMetadata {
    pub display_name: String,
    pub description: String,
    pub icon: String,
}

impl ElementMetadata {
    pub fn new(
        display_name: impl Into<String>,
        description: impl Into<String>,
        icon: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            description: description.into(),
            icon: icon.into(),
        }
    }
}

/// Mutable per-instance state every element carries.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementSettings {
    pub is_enabled: bool,
    pub configuration: Configuration,
}

impl Default for ElementSettings {
    fn default() -> Self {
        Self {
            is_enabled: true,
            configuration: Configuration::new(),
        }
    }
}

impl ElementSettings {
    /// Typed reads. A value of the wrong JSON kind reads as `None`.
    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.configuration.get(key)?.as_bool()
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.configuration.get(key)?.as_str()
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.configuration.get(key)?.as_f64()
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.configuration.get(key)?.as_u64()
    }

    pub fn config_object(&self, key: &str) -> Option<&serde_json::Map<String, Value>> {
        self.configuration.get(key)?.as_object()
    }
}

/// Optional capabilities, decided when the element is constructed.
#[derive(Debug, Clone, Default)]
pub struct ElementCapabilities {
    pub lifecycle: Option<LifecycleHandle>,
    pub resources: Option<ResourceTracker>,
}

impl ElementCapabilities {
    pub fn flags(&self) -> CapabilityFlags {
        CapabilityFlags {
            is_sleepable: self.lifecycle.is_some(),
            tracks_resources: self.resources.is_some(),
        }
    }
}

/// A named, configurable unit of work in a pipeline.
#[async_trait]
pub trait Element: Send + Sync + 'static {
    /// Registry key of this element's type.
    fn element_type(&self) -> &str;

    fn metadata(&self) -> ElementMetadata;

    fn constraints(&self) -> ConstraintSet {
        ConstraintSet::empty()
    }

    fn connection_rules(&self) -> ConnectionRules;

    fn capabilities(&self) -> ElementCapabilities {
        ElementCapabilities::default()
    }

    fn settings(&self) -> &ElementSettings;

    fn settings_mut(&mut self) -> &mut ElementSettings;

    /// Downcast hook for host configurators binding concrete backends.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn is_enabled(&self) -> bool {
        self.settings().is_enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.settings_mut().is_enabled = enabled;
    }

    fn configuration(&self) -> &Configuration {
        &self.settings().configuration
    }

    fn set_configuration(&mut self, configuration: Configuration) {
        self.settings_mut().configuration = configuration;
    }

    /// Static metadata as consumed by validation.
    fn descriptor(&self) -> ElementDescriptor {
        let metadata = self.metadata();
        ElementDescriptor {
            type_id: self.element_type().to_string(),
            display_name: metadata.display_name,
            description: metadata.description,
            icon: metadata.icon,
            constraints: self.constraints(),
            connection_rules: self.connection_rules(),
            capabilities: self.capabilities().flags(),
        }
    }

    /// Called once after construction and configuration, before the run.
    ///
    /// The default pre-warms sleepable elements whose configuration asks
    /// for it (or that may never sleep).
    async fn prepare(&mut self) -> anyhow::Result<()> {
        if let Some(lifecycle) = self.capabilities().lifecycle {
            if lifecycle.sleep_config().wakes_on_prepare() {
                lifecycle.ensure_awake().await?;
            }
        }
        Ok(())
    }

    async fn process(&mut self, ctx: &PipelineContext) -> anyhow::Result<()>;

    /// Called once when the run ends, whatever its outcome.
    async fn cleanup(&mut self) -> anyhow::Result<()> {
        if let Some(lifecycle) = self.capabilities().lifecycle {
            lifecycle.release().await?;
        }
        Ok(())
    }
}

/// Whether elements following these rules are actions rather than stages.
pub fn is_action(rules: &ConnectionRules) -> bool {
    matches!(
        rules.produced_output_type,
        DataType::Action | DataType::None
    )
}
