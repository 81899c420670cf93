//! Built-in element types.
//!
//! | Type id | Input | Output | Backend |
//! |---------|-------|--------|---------|
//! | `vad_trim` | audio | audio | built in (energy VAD) |
//! | `transcription` | audio, audioFile | text | [`transcription::Transcriber`] |
//! | `text_cleanup` | text | text | built in |
//! | `text_refinement` | text | text | [`refinement::TextRefiner`] |
//! | `insert_text` | text | action | [`insert::TextInserter`] |
//! | `notify` | any | action | [`notify::Notifier`] (optional) |
//!
//! Backends are bound by the host after construction, typically from an
//! [`ElementConfigurator`](crate::engine::ElementConfigurator) that downcasts
//! through [`Element::as_any_mut`](crate::element::Element::as_any_mut).

pub mod cleanup;
pub mod insert;
pub mod notify;
pub mod refinement;
pub mod transcription;
pub mod vad;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::element::lifecycle::ResourceLoader;
use crate::registry::ElementRegistry;

pub const VAD_TRIM: &str = "vad_trim";
pub const TRANSCRIPTION: &str = "transcription";
pub const TEXT_CLEANUP: &str = "text_cleanup";
pub const TEXT_REFINEMENT: &str = "text_refinement";
pub const INSERT_TEXT: &str = "insert_text";
pub const NOTIFY: &str = "notify";

/// Register every built-in element type.
pub fn register_builtin_elements(registry: &ElementRegistry) {
    registry.register(VAD_TRIM, || Box::new(vad::VadTrimElement::new()));
    registry.register(TRANSCRIPTION, || {
        Box::new(transcription::TranscriptionElement::new())
    });
    registry.register(TEXT_CLEANUP, || Box::new(cleanup::TextCleanupElement::new()));
    registry.register(TEXT_REFINEMENT, || {
        Box::new(refinement::TextRefinementElement::new())
    });
    registry.register(INSERT_TEXT, || Box::new(insert::InsertTextElement::new()));
    registry.register(NOTIFY, || Box::new(notify::NotifyElement::new()));
}

/// Late-bound backend shared between an element and its lifecycle.
///
/// The lifecycle loads and unloads whatever is bound at the time; an empty
/// slot loads as a no-op.
pub struct BackendSlot<T: ?Sized> {
    inner: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T: ?Sized> BackendSlot<T> {
    pub fn bind(&self, backend: Arc<T>) {
        *self.inner.write() = Some(backend);
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }

    pub fn is_bound(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl<T: ?Sized> Default for BackendSlot<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }
}

impl<T: ?Sized> Clone for BackendSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> fmt::Debug for BackendSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSlot")
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[async_trait]
impl<T> ResourceLoader for BackendSlot<T>
where
    T: ResourceLoader + ?Sized,
{
    async fn load(&self) -> anyhow::Result<()> {
        match self.get() {
            Some(backend) => backend.load().await,
            None => Ok(()),
        }
    }

    async fn unload(&self) -> anyhow::Result<()> {
        match self.get() {
            Some(backend) => backend.unload().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::descriptor::{ConstraintSet, DataType};
    use crate::pipeline::{Pipeline, PipelineElementInstance};

    fn builtin_registry() -> ElementRegistry {
        let registry = ElementRegistry::new();
        register_builtin_elements(&registry);
        registry
    }

    #[test]
    fn registers_all_builtin_types() {
        let registry = builtin_registry();
        assert_eq!(
            registry.type_ids(),
            vec![INSERT_TEXT, NOTIFY, TEXT_CLEANUP, TEXT_REFINEMENT, TRANSCRIPTION, VAD_TRIM]
        );
    }

    #[test]
    fn builtin_descriptors_match_their_roles() {
        let registry = builtin_registry();

        let stt = registry.descriptor(TRANSCRIPTION).expect("transcription");
        assert!(stt.capabilities.is_sleepable);
        assert!(stt.capabilities.tracks_resources);
        assert!(stt.connection_rules.accepts(DataType::AudioFile));
        assert_eq!(stt.connection_rules.produced_output_type, DataType::Text);

        let refine = registry.descriptor(TEXT_REFINEMENT).expect("refinement");
        assert!(refine
            .connection_rules
            .required_predecessor_type_ids
            .contains(TRANSCRIPTION));

        let vad = registry.descriptor(VAD_TRIM).expect("vad");
        assert!(vad.constraints.contains(ConstraintSet::MUST_BE_FIRST));
        assert!(!vad.capabilities.is_sleepable);

        let notify = registry.descriptor(NOTIFY).expect("notify");
        assert!(notify.constraints.contains(ConstraintSet::ALLOW_MULTIPLE));
    }

    #[test]
    fn dictation_pipeline_validates() {
        let registry = builtin_registry();
        let pipeline = [VAD_TRIM, TRANSCRIPTION, TEXT_CLEANUP, TEXT_REFINEMENT, INSERT_TEXT, NOTIFY]
            .into_iter()
            .fold(Pipeline::new("dictation"), |p, t| {
                p.with_element(PipelineElementInstance::new(t))
            });
        let result = registry.validate(&pipeline);
        assert!(result.is_valid, "{:?}", result.errors);
    }

    #[test]
    fn refinement_without_transcription_is_rejected() {
        let registry = builtin_registry();
        let pipeline = Pipeline::new("broken")
            .with_element(PipelineElementInstance::new(TEXT_CLEANUP))
            .with_element(PipelineElementInstance::new(TEXT_REFINEMENT))
            .with_element(PipelineElementInstance::new(INSERT_TEXT));
        let result = registry.validate(&pipeline);
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn empty_slot_loads_as_noop() {
        let slot: BackendSlot<transcription::StubTranscriber> = BackendSlot::default();
        slot.load().await.expect("load");
        slot.unload().await.expect("unload");
        assert!(!slot.is_bound());

        slot.bind(Arc::new(transcription::StubTranscriber::default()));
        assert!(slot.clone().is_bound());
    }
}
