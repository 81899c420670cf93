//! `notify`: posts a message when the pipeline reaches it.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::context::PipelineContext;
use crate::element::descriptor::{ConnectionRules, ConstraintSet, DataType};
use crate::element::{Element, ElementMetadata, ElementSettings};

use super::NOTIFY;

const DEFAULT_TITLE: &str = "Cadence";
const DEFAULT_MESSAGE: &str = "{text}";

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, title: &str, body: &str) -> anyhow::Result<()>;
}

pub struct NotifyElement {
    settings: ElementSettings,
    notifier: Option<Arc<dyn Notifier>>,
}

impl NotifyElement {
    pub fn new() -> Self {
        Self {
            settings: ElementSettings::default(),
            notifier: None,
        }
    }

    pub fn bind_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifier = Some(notifier);
    }

    /// `message` with `{text}` replaced by the current text.
    pub fn render(&self, text: &str) -> String {
        self.settings
            .config_str("message")
            .unwrap_or(DEFAULT_MESSAGE)
            .replace("{text}", text)
    }
}

impl Default for NotifyElement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Element for NotifyElement {
    fn element_type(&self) -> &str {
        NOTIFY
    }

    fn metadata(&self) -> ElementMetadata {
        ElementMetadata::new("Notify", "Shows a notification", "bell")
    }

    fn constraints(&self) -> ConstraintSet {
        ConstraintSet::CANNOT_BE_FIRST | ConstraintSet::ALLOW_MULTIPLE | ConstraintSet::OPTIONAL
    }

    fn connection_rules(&self) -> ConnectionRules {
        ConnectionRules::new([DataType::Any], DataType::Action)
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
        let title = self.settings.config_str("title").unwrap_or(DEFAULT_TITLE);
        let body = self.render(&ctx.text());
        match &self.notifier {
            Some(notifier) => notifier.notify(title, &body).await,
            None => {
                info!(title, body = %body, "notification");
                Ok(())
            }
        }
    }
}
