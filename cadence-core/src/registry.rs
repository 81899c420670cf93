//! Catalogue of element types: type id → factory + cached descriptor.
//!
//! The registry is an explicit value rather than a process-wide singleton;
//! share it as `Arc<ElementRegistry>`. Registration and lookup may happen
//! from any thread. Factories are cloned out of the lock before they run, so
//! a factory may itself consult the registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::element::descriptor::ElementDescriptor;
use crate::element::Element;
use crate::pipeline::validation::{self, ValidationResult};
use crate::pipeline::Pipeline;

/// Produces a fresh, independent element on every call.
pub type ElementFactory = Arc<dyn Fn() -> Box<dyn Element> + Send + Sync>;

struct Entry {
    factory: ElementFactory,
    descriptor: ElementDescriptor,
}

#[derive(Default)]
pub struct ElementRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `type_id`, replacing any earlier entry.
    ///
    /// The factory is invoked once to capture the descriptor. The registry
    /// key wins over whatever type id the instance reports.
    pub fn register<F>(&self, type_id: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Element> + Send + Sync + 'static,
    {
        let type_id = type_id.into();
        let factory: ElementFactory = Arc::new(factory);

        let mut descriptor = factory().descriptor();
        if descriptor.type_id != type_id {
            warn!(
                registered = %type_id,
                reported = %descriptor.type_id,
                "element reports a different type id than it was registered under"
            );
            descriptor.type_id = type_id.clone();
        }

        let replaced = self
            .entries
            .write()
            .insert(type_id.clone(), Entry { factory, descriptor })
            .is_some();
        debug!(type_id = %type_id, replaced, "element type registered");
    }

    /// Remove a type. Returns whether it was registered.
    pub fn unregister(&self, type_id: &str) -> bool {
        self.entries.write().remove(type_id).is_some()
    }

    /// A new instance of `type_id`, or `None` if the type is unknown.
    pub fn create(&self, type_id: &str) -> Option<Box<dyn Element>> {
        let factory = Arc::clone(&self.entries.read().get(type_id)?.factory);
        Some(factory())
    }

    pub fn descriptor(&self, type_id: &str) -> Option<ElementDescriptor> {
        self.entries
            .read()
            .get(type_id)
            .map(|entry| entry.descriptor.clone())
    }

    /// Every registered descriptor, sorted by type id.
    pub fn all_descriptors(&self) -> Vec<ElementDescriptor> {
        let mut all: Vec<ElementDescriptor> = self
            .entries
            .read()
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.type_id.cmp(&b.type_id));
        all
    }

    /// Snapshot keyed by type id, as consumed by validation.
    pub fn descriptor_map(&self) -> HashMap<String, ElementDescriptor> {
        self.entries
            .read()
            .iter()
            .map(|(type_id, entry)| (type_id.clone(), entry.descriptor.clone()))
            .collect()
    }

    pub fn type_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.entries.read().contains_key(type_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Validate `pipeline` against the currently registered descriptors.
    pub fn validate(&self, pipeline: &Pipeline) -> ValidationResult {
        validation::validate(pipeline, &self.descriptor_map())
    }
}

impl std::fmt::Debug for ElementRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementRegistry")
            .field("types", &self.type_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::context::PipelineContext;
    use crate::element::descriptor::{ConnectionRules, DataType};
    use crate::element::{ElementMetadata, ElementSettings};
    use crate::pipeline::PipelineElementInstance;

    struct Echo {
        reported_type: &'static str,
        settings: ElementSettings,
    }

    #[async_trait]
    impl Element for Echo {
        fn element_type(&self) -> &str {
            self.reported_type
        }

        fn metadata(&self) -> ElementMetadata {
            ElementMetadata::new("Echo", "Passes text through", "arrow.right")
        }

        fn connection_rules(&self) -> ConnectionRules {
            ConnectionRules::new([DataType::Text], DataType::Text)
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

        async fn process(&mut self, _ctx: &PipelineContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn echo(reported_type: &'static str) -> Box<dyn Element> {
        Box::new(Echo {
            reported_type,
            settings: ElementSettings::default(),
        })
    }

    #[test]
    fn create_returns_independent_instances() {
        let registry = ElementRegistry::new();
        registry.register("echo", || echo("echo"));

        let mut a = registry.create("echo").expect("registered");
        let b = registry.create("echo").expect("registered");
        a.set_enabled(false);
        assert!(!a.is_enabled());
        assert!(b.is_enabled());
        assert!(registry.create("missing").is_none());
    }

    #[test]
    fn registry_key_overrides_reported_type() {
        let registry = ElementRegistry::new();
        registry.register("alias", || echo("echo"));

        let descriptor = registry.descriptor("alias").expect("descriptor");
        assert_eq!(descriptor.type_id, "alias");
        assert_eq!(descriptor.display_name, "Echo");
        assert!(registry.descriptor("echo").is_none());
    }

    #[test]
    fn re_registering_replaces_the_factory() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ElementRegistry::new();
        registry.register("echo", || echo("echo"));

        let counter = Arc::clone(&calls);
        registry.register("echo", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            echo("echo")
        });
        // One call to capture the descriptor.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.create("echo").expect("registered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn listing_is_sorted_and_validation_uses_descriptors() {
        let registry = ElementRegistry::new();
        registry.register("zeta", || echo("zeta"));
        registry.register("alpha", || echo("alpha"));

        assert_eq!(registry.type_ids(), vec!["alpha", "zeta"]);
        let names: Vec<String> = registry
            .all_descriptors()
            .into_iter()
            .map(|d| d.type_id)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        let pipeline = Pipeline::new("p")
            .with_element(PipelineElementInstance::new("alpha"))
            .with_element(PipelineElementInstance::new("zeta"));
        assert!(registry.validate(&pipeline).is_valid);

        assert!(registry.unregister("zeta"));
        assert!(!registry.validate(&pipeline).is_valid);
        assert!(!registry.contains("zeta"));
    }

    #[test]
    fn registration_from_many_threads() {
        let registry = Arc::new(ElementRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.register(format!("echo-{i}"), || echo("echo"));
                    registry.create(&format!("echo-{i}")).is_some()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().expect("thread"));
        }
        assert_eq!(registry.len(), 8);
    }
}
