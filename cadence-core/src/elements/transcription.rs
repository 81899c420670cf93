//! `transcription`: speech to text through a host-bound [`Transcriber`].
//!
//! The element is sleepable: its lifecycle loads the bound transcriber on
//! first use and unloads it after the idle delay.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::PipelineContext;
use crate::element::descriptor::{ConnectionRules, ConstraintSet, DataType};
use crate::element::lifecycle::{LifecycleHandle, ResourceLoader, SleepConfiguration};
use crate::element::resource::{ResourceTracker, ResourceUsage};
use crate::element::{Element, ElementCapabilities, ElementMetadata, ElementSettings};

use super::{BackendSlot, TRANSCRIPTION};

/// Rough resident size of a small speech model.
const ESTIMATED_MODEL_BYTES: u64 = 512 << 20;

/// Confidence key written to the context.
pub const CONFIDENCE_KEY: &str = "transcription";

/// Audio handed to a [`Transcriber`].
#[derive(Debug, Clone, Copy)]
pub enum AudioInput<'a> {
    Samples { samples: &'a [f32], sample_rate: u32 },
    File(&'a Path),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
    /// Model confidence in `[0.0, 1.0]`, if available.
    pub confidence: Option<f64>,
}

/// Speech-to-text backend. `load`/`unload` manage the model weights.
#[async_trait]
pub trait Transcriber: ResourceLoader {
    async fn transcribe(
        &self,
        input: AudioInput<'_>,
        language: Option<&str>,
    ) -> anyhow::Result<Transcript>;
}

/// Placeholder backend that echoes metadata without real inference.
///
/// Produces `"[stub: <N> samples @ <SR> Hz]"` so a full pipeline can be
/// exercised end-to-end without model weights.
#[derive(Debug, Default)]
pub struct StubTranscriber;

#[async_trait]
impl ResourceLoader for StubTranscriber {
    async fn load(&self) -> anyhow::Result<()> {
        debug!("StubTranscriber::load (no-op)");
        Ok(())
    }

    async fn unload(&self) -> anyhow::Result<()> {
        debug!("StubTranscriber::unload (no-op)");
        Ok(())
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        input: AudioInput<'_>,
        language: Option<&str>,
    ) -> anyhow::Result<Transcript> {
        let text = match input {
            AudioInput::Samples {
                samples,
                sample_rate,
            } => format!("[stub: {} samples @ {} Hz]", samples.len(), sample_rate),
            AudioInput::File(path) => format!("[stub: file {}]", path.display()),
        };
        Ok(Transcript {
            text,
            language: language.map(str::to_string),
            confidence: Some(1.0),
        })
    }
}

pub struct TranscriptionElement {
    settings: ElementSettings,
    backend: BackendSlot<dyn Transcriber>,
    lifecycle: LifecycleHandle,
    resources: ResourceTracker,
}

impl TranscriptionElement {
    pub fn new() -> Self {
        let backend: BackendSlot<dyn Transcriber> = BackendSlot::default();
        let lifecycle = LifecycleHandle::new(
            TRANSCRIPTION,
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

    pub fn bind_transcriber(&mut self, transcriber: Arc<dyn Transcriber>) {
        self.backend.bind(transcriber);
    }

    /// `language` config; empty and `"auto"` mean detect.
    fn language_hint(&self) -> Option<String> {
        self.settings
            .config_str("language")
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("auto"))
            .map(str::to_string)
    }
}

impl Default for TranscriptionElement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Element for TranscriptionElement {
    fn element_type(&self) -> &str {
        TRANSCRIPTION
    }

    fn metadata(&self) -> ElementMetadata {
        ElementMetadata::new(
            "Transcription",
            "Converts recorded speech to text",
            "mic",
        )
    }

    fn constraints(&self) -> ConstraintSet {
        ConstraintSet::CANNOT_BE_LAST
    }

    fn connection_rules(&self) -> ConnectionRules {
        ConnectionRules::new([DataType::Audio, DataType::AudioFile], DataType::Text)
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
        let transcriber = self
            .backend
            .get()
            .context("no transcriber bound to the transcription element")?;
        let hint = self.language_hint();

        let samples = ctx.audio_samples().filter(|s| !s.is_empty());
        let file = ctx.audio_file_path();
        let transcript = match (&samples, &file) {
            (Some(samples), _) => {
                let input = AudioInput::Samples {
                    samples,
                    sample_rate: ctx.sample_rate(),
                };
                transcriber.transcribe(input, hint.as_deref()).await?
            }
            (None, Some(path)) => {
                transcriber
                    .transcribe(AudioInput::File(path), hint.as_deref())
                    .await?
            }
            (None, None) => bail!("no audio to transcribe"),
        };

        let text = transcript.text.trim().to_string();
        info!(
            chars = text.chars().count(),
            language = transcript.language.as_deref().unwrap_or("auto"),
            "transcription finished"
        );
        ctx.set_original_text(text.clone());
        ctx.set_text(text);
        ctx.set_language(transcript.language.or(hint));
        if let Some(confidence) = transcript.confidence {
            ctx.set_confidence(CONFIDENCE_KEY, confidence);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::element::lifecycle::ElementState;

    #[derive(Default)]
    struct CountingTranscriber {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ResourceLoader for CountingTranscriber {
        async fn load(&self) -> anyhow::Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unload(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Transcriber for CountingTranscriber {
        async fn transcribe(
            &self,
            _input: AudioInput<'_>,
            _language: Option<&str>,
        ) -> anyhow::Result<Transcript> {
            Ok(Transcript {
                text: "  hello world ".into(),
                language: None,
                confidence: Some(0.8),
            })
        }
    }

    #[tokio::test]
    async fn stub_transcribes_samples() {
        let ctx = PipelineContext::new().with_audio(vec![0.0; 480], 16_000);
        let mut element = TranscriptionElement::new();
        element.bind_transcriber(Arc::new(StubTranscriber));
        element.process(&ctx).await.expect("process");

        assert_eq!(ctx.text(), "[stub: 480 samples @ 16000 Hz]");
        assert_eq!(ctx.original_text(), ctx.text());
        assert_eq!(ctx.confidence(CONFIDENCE_KEY), Some(1.0));
        assert_eq!(ctx.language(), None);
    }

    #[tokio::test]
    async fn falls_back_to_audio_file_and_keeps_language_hint() {
        let ctx = PipelineContext::new().with_audio_file("clip.wav");
        let mut element = TranscriptionElement::new();
        element.set_configuration(json!({"language": "de"}).as_object().cloned().expect("object"));
        element.bind_transcriber(Arc::new(CountingTranscriber::default()));
        element.process(&ctx).await.expect("process");

        assert_eq!(ctx.text(), "hello world");
        assert_eq!(ctx.language().as_deref(), Some("de"));
        assert_eq!(ctx.confidence(CONFIDENCE_KEY), Some(0.8));
    }

    #[tokio::test]
    async fn fails_without_backend_or_audio() {
        let ctx = PipelineContext::new();
        let mut element = TranscriptionElement::new();
        let err = element.process(&ctx).await.expect_err("no backend");
        assert!(err.to_string().contains("no transcriber bound"));

        element.bind_transcriber(Arc::new(StubTranscriber));
        let err = element.process(&ctx).await.expect_err("no audio");
        assert_eq!(err.to_string(), "no audio to transcribe");
    }

    #[tokio::test]
    async fn lifecycle_loads_the_bound_backend() {
        let backend = Arc::new(CountingTranscriber::default());
        let mut element = TranscriptionElement::new();
        element.bind_transcriber(backend.clone());

        let lifecycle = element.capabilities().lifecycle.expect("sleepable");
        let resources = element.capabilities().resources.expect("tracked");
        assert_eq!(resources.usage(), ResourceUsage::ZERO);

        lifecycle.begin_processing().await.expect("begin");
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), ElementState::Processing);
        assert!(resources.usage().model_loaded);

        element.cleanup().await.expect("cleanup");
        assert_eq!(lifecycle.state(), ElementState::Sleeping);
    }
}
