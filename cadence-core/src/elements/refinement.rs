//! `text_refinement`: rewrites transcribed text through a host-bound
//! [`TextRefiner`] (typically a local language model).

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::PipelineContext;
use crate::element::descriptor::{ConnectionRules, ConstraintSet, DataType};
use crate::element::lifecycle::{LifecycleHandle, ResourceLoader, SleepConfiguration};
use crate::element::resource::{ResourceTracker, ResourceUsage};
use crate::element::{Element, ElementCapabilities, ElementMetadata, ElementSettings};

use super::{BackendSlot, TEXT_REFINEMENT, TRANSCRIPTION};

const ESTIMATED_MODEL_BYTES: u64 = 2 << 30;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefineOptions {
    pub tone: Option<String>,
    pub language: Option<String>,
}

#[async_trait]
pub trait TextRefiner: ResourceLoader {
    async fn refine(&self, text: &str, options: &RefineOptions) -> anyhow::Result<String>;
}

pub struct TextRefinementElement {
    settings: ElementSettings,
    backend: BackendSlot<dyn TextRefiner>,
    lifecycle: LifecycleHandle,
    resources: ResourceTracker,
}

impl TextRefinementElement {
    pub fn new() -> Self {
        let backend: BackendSlot<dyn TextRefiner> = BackendSlot::default();
        let lifecycle = LifecycleHandle::new(
            TEXT_REFINEMENT,
            Arc::new(backend.clone()),
            SleepConfiguration::default(),
        );
        let resources = ResourceTracker::new(ResourceUsage::loaded(ESTIMATED_MODEL_BYTES, 0))
            .with_lifecycle(lifecycle.clone());
        Self {
            settings: ElementSettings::default(),
            backend,
            lifecycle,
            resources,
        }
    }

    pub fn bind_refiner(&mut self, refiner: Arc<dyn TextRefiner>) {
        self.backend.bind(refiner);
    }
}

impl Default for TextRefinementElement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Element for TextRefinementElement {
    fn element_type(&self) -> &str {
        TEXT_REFINEMENT
    }

    fn metadata(&self) -> ElementMetadata {
        ElementMetadata::new(
            "Refine Text",
            "Fixes grammar and adjusts tone with a language model",
            "sparkles",
        )
    }

    fn constraints(&self) -> ConstraintSet {
        ConstraintSet::CANNOT_BE_FIRST | ConstraintSet::OPTIONAL
    }

    fn connection_rules(&self) -> ConnectionRules {
        ConnectionRules::new([DataType::Text, DataType::RichText], DataType::Text)
            .requires(TRANSCRIPTION)
    }

    fn capabilities(&self) -> ElementCapabilities {
        ElementCapabilities {
            lifecycle: Some(self.lifecycle.clone()),
            resources: Some(self.resources.clone()),
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

    async fn process(&mut self, ctx: &PipelineContext) -> anyhow::Result<()> {
        if !self.settings.config_bool("cleanupEnabled").unwrap_or(true) {
            debug!("refinement disabled by configuration");
            ctx.set_custom_data("refinementApplied", &false)?;
            return Ok(());
        }

        let text = ctx.text();
        if text.trim().is_empty() {
            ctx.set_custom_data("refinementApplied", &false)?;
            return Ok(());
        }

        let Some(refiner) = self.backend.get() else {
            ctx.add_warning("text refinement skipped: no refiner bound");
            ctx.set_custom_data("refinementApplied", &false)?;
            return Ok(());
        };

        let options = RefineOptions {
            tone: self.settings.config_str("tone").map(str::to_string),
            language: ctx.language(),
        };
        let refined = refiner.refine(&text, &options).await?;
        let refined = refined.trim();
        if refined.is_empty() {
            ctx.add_warning("refiner returned empty text; keeping transcript");
            ctx.set_custom_data("refinementApplied", &false)?;
            return Ok(());
        }

        info!(
            before = text.chars().count(),
            after = refined.chars().count(),
            "text refined"
        );
        ctx.set_text(refined);
        ctx.set_custom_data("refinementApplied", &true)?;
        Ok(())
    }
}
