//! `insert_text`: hands the final text to a host-bound [`TextInserter`].

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::PipelineContext;
use crate::element::descriptor::{ConnectionRules, ConstraintSet, DataType};
use crate::element::{Element, ElementMetadata, ElementSettings};

use super::INSERT_TEXT;

/// How text reaches the focused application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertMethod {
    /// Copy to the clipboard and paste.
    #[default]
    Clipboard,
    /// Synthesize key presses.
    Typing,
}

impl InsertMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            InsertMethod::Clipboard => "clipboard",
            InsertMethod::Typing => "typing",
        }
    }
}

impl fmt::Display for InsertMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InsertMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clipboard" | "paste" => Ok(InsertMethod::Clipboard),
            "typing" | "type" => Ok(InsertMethod::Typing),
            other => anyhow::bail!("unknown insert method `{other}`"),
        }
    }
}

#[async_trait]
pub trait TextInserter: Send + Sync + 'static {
    async fn insert(&self, text: &str, method: InsertMethod) -> anyhow::Result<()>;
}

pub struct InsertTextElement {
    settings: ElementSettings,
    inserter: Option<Arc<dyn TextInserter>>,
}

impl InsertTextElement {
    pub fn new() -> Self {
        Self {
            settings: ElementSettings::default(),
            inserter: None,
        }
    }

    pub fn bind_inserter(&mut self, inserter: Arc<dyn TextInserter>) {
        self.inserter = Some(inserter);
    }

    fn method(&self) -> anyhow::Result<InsertMethod> {
        match self.settings.config_str("method") {
            Some(raw) => raw.parse(),
            None => Ok(InsertMethod::default()),
        }
    }
}

impl Default for InsertTextElement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Element for InsertTextElement {
    fn element_type(&self) -> &str {
        INSERT_TEXT
    }

    fn metadata(&self) -> ElementMetadata {
        ElementMetadata::new(
            "Insert Text",
            "Types or pastes the result into the focused application",
            "keyboard",
        )
    }

    fn constraints(&self) -> ConstraintSet {
        ConstraintSet::CANNOT_BE_FIRST
    }

    fn connection_rules(&self) -> ConnectionRules {
        ConnectionRules::new([DataType::Text, DataType::RichText], DataType::Action)
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
        let method = self.method()?;
        let text = ctx.text();
        if text.trim().is_empty() {
            ctx.add_warning("nothing to insert: text is empty");
            ctx.set_custom_data("textInserted", &false)?;
            return Ok(());
        }

        let inserter = self
            .inserter
            .as_ref()
            .context("no text inserter bound to the insert_text element")?;
        inserter.insert(&text, method).await?;

        info!(chars = text.chars().count(), method = %method, "text inserted");
        ctx.set_custom_data("textInserted", &true)?;
        ctx.set_custom_data("insertMethod", &method)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingInserter {
        calls: Mutex<Vec<(String, InsertMethod)>>,
    }

    #[async_trait]
    impl TextInserter for RecordingInserter {
        async fn insert(&self, text: &str, method: InsertMethod) -> anyhow::Result<()> {
            self.calls.lock().push((text.to_string(), method));
            Ok(())
        }
    }

    #[test]
    fn method_parses_aliases() {
        assert_eq!("Typing".parse::<InsertMethod>().expect("parse"), InsertMethod::Typing);
        assert_eq!("paste".parse::<InsertMethod>().expect("parse"), InsertMethod::Clipboard);
        assert!("fax".parse::<InsertMethod>().is_err());
    }

    #[tokio::test]
    async fn inserts_with_configured_method() {
        let inserter = Arc::new(RecordingInserter::default());
        let mut element = InsertTextElement::new();
        element.set_configuration(json!({"method": "typing"}).as_object().cloned().expect("object"));
        element.bind_inserter(inserter.clone());

        let ctx = PipelineContext::new().with_text("Hello.");
        element.process(&ctx).await.expect("process");

        assert_eq!(
            inserter.calls.lock().clone(),
            vec![("Hello.".to_string(), InsertMethod::Typing)]
        );
        assert_eq!(ctx.custom_data::<bool>("textInserted"), Some(true));
        assert_eq!(
            ctx.custom_data::<InsertMethod>("insertMethod"),
            Some(InsertMethod::Typing)
        );
    }

    #[tokio::test]
    async fn empty_text_is_skipped_without_backend() {
        let ctx = PipelineContext::new().with_text("  ");
        InsertTextElement::new().process(&ctx).await.expect("process");
        assert_eq!(ctx.custom_data::<bool>("textInserted"), Some(false));
        assert_eq!(ctx.warnings().len(), 1);
    }

    #[tokio::test]
    async fn missing_inserter_fails() {
        let ctx = PipelineContext::new().with_text("text");
        let err = InsertTextElement::new()
            .process(&ctx)
            .await
            .expect_err("no inserter");
        assert!(err.to_string().contains("no text inserter bound"));
    }
}
