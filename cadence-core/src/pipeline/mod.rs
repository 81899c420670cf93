//! User-editable pipeline definitions.
//!
//! A [`Pipeline`] is pure data: an ordered list of element instances with
//! their enabled flags and configuration. List order is execution order.
//! The JSON shape (camelCase) is what external stores persist.

pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::element::Configuration;

/// One element slot inside a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineElementInstance {
    pub id: String,
    pub type_id: String,
    #[serde(default = "enabled_by_default")]
    pub is_enabled: bool,
    #[serde(default)]
    pub configuration: Configuration,
}

fn enabled_by_default() -> bool {
    true
}

impl PipelineElementInstance {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            id: new_id("el"),
            type_id: type_id.into(),
            is_enabled: true,
            configuration: Configuration::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }
}

/// An ordered, persisted list of element instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub elements: Vec<PipelineElementInstance>,
    #[serde(default = "enabled_by_default")]
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("pipe"),
            name: name.into(),
            description: String::new(),
            elements: Vec::new(),
            is_enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder form of [`add_element`](Self::add_element).
    pub fn with_element(mut self, instance: PipelineElementInstance) -> Self {
        self.add_element(instance);
        self
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Enabled instances in execution order.
    pub fn enabled_elements(&self) -> Vec<&PipelineElementInstance> {
        self.elements.iter().filter(|e| e.is_enabled).collect()
    }

    pub fn element(&self, id: &str) -> Option<&PipelineElementInstance> {
        self.elements.iter().find(|e| e.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    /// Append an instance, returning its id.
    pub fn add_element(&mut self, instance: PipelineElementInstance) -> String {
        let id = instance.id.clone();
        self.elements.push(instance);
        self.touch();
        id
    }

    /// Insert at `index` (clamped to the end of the list).
    pub fn insert_element(&mut self, index: usize, instance: PipelineElementInstance) -> String {
        let id = instance.id.clone();
        let index = index.min(self.elements.len());
        self.elements.insert(index, instance);
        self.touch();
        id
    }

    pub fn remove_element(&mut self, id: &str) -> Option<PipelineElementInstance> {
        let index = self.position(id)?;
        let removed = self.elements.remove(index);
        self.touch();
        Some(removed)
    }

    /// Move the instance `id` to position `to` (clamped). Returns `false`
    /// when `id` is unknown.
    pub fn move_element(&mut self, id: &str, to: usize) -> bool {
        let Some(from) = self.position(id) else {
            return false;
        };
        let instance = self.elements.remove(from);
        let to = to.min(self.elements.len());
        self.elements.insert(to, instance);
        self.touch();
        true
    }

    /// Flip the enabled flag, returning the new value.
    pub fn toggle_element(&mut self, id: &str) -> Option<bool> {
        let index = self.position(id)?;
        let element = &mut self.elements[index];
        element.is_enabled = !element.is_enabled;
        let enabled = element.is_enabled;
        self.touch();
        Some(enabled)
    }

    pub fn set_configuration(&mut self, id: &str, configuration: Configuration) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        self.elements[index].configuration = configuration;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Time-ordered, collision-resistant identifier with a readable prefix.
pub(crate) fn new_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}-{:08x}",
        Utc::now().timestamp_micros(),
        rand::random::<u32>()
    )
}
