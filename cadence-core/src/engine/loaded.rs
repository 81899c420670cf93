//! Elements instantiated for one run.
//!
//! The table lives for exactly one run. [`LoadedElements::teardown`] calls
//! `cleanup()` on every entry whatever the outcome; if the run future is
//! dropped instead, dropping the table drops every lifecycle handle and the
//! lifecycle tasks unload resident resources on their own.

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::element::lifecycle::{ElementState, LifecycleHandle};
use crate::element::Element;
use crate::ipc::events::PipelineEventKind;

use super::EventEmitter;

pub(crate) struct LoadedElement {
    pub instance_id: String,
    pub type_id: String,
    pub element: Box<dyn Element>,
}

impl LoadedElement {
    pub fn lifecycle(&self) -> Option<LifecycleHandle> {
        self.element.capabilities().lifecycle
    }

    pub fn display_name(&self) -> String {
        self.element.metadata().display_name
    }
}

#[derive(Default)]
pub(crate) struct LoadedElements {
    entries: Vec<LoadedElement>,
}

impl LoadedElements {
    pub fn push(&mut self, entry: LoadedElement) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, LoadedElement> {
        self.entries.iter_mut()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut LoadedElement> {
        self.entries.get_mut(index)
    }

    /// Clean up every entry. Failures are logged, never returned.
    pub async fn teardown(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Err(e) = entry.element.cleanup().await {
                warn!(
                    element_id = %entry.instance_id,
                    element_type = %entry.type_id,
                    "cleanup failed: {e:#}"
                );
            }
        }
        debug!(count = self.entries.len(), "loaded elements torn down");
        self.entries.clear();
    }
}

/// Forward lifecycle transitions of one element as `elementStateChanged`
/// events. Ends when the lifecycle task stops.
pub(crate) fn forward_state_changes(
    instance_id: String,
    mut states: watch::Receiver<ElementState>,
    emitter: EventEmitter,
) {
    states.mark_unchanged();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            emitter.emit(PipelineEventKind::ElementStateChanged {
                element_id: instance_id.clone(),
                state,
            });
        }
    });
}
