//! Static element metadata used by validation.
//!
//! Everything here is plain data: a pipeline can be checked against a set of
//! [`ElementDescriptor`]s without instantiating a single element.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DataType
// ---------------------------------------------------------------------------

/// Kind of payload an element consumes or produces.
///
/// `Any` is only meaningful on the accepting side. `Action` and `None` are
/// output types for elements that perform side effects rather than
/// transforming data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Audio,
    AudioFile,
    Text,
    RichText,
    Any,
    Action,
    None,
}

impl DataType {
    pub fn label(self) -> &'static str {
        match self {
            DataType::Audio => "audio",
            DataType::AudioFile => "audioFile",
            DataType::Text => "text",
            DataType::RichText => "richText",
            DataType::Any => "any",
            DataType::Action => "action",
            DataType::None => "none",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// ConstraintSet
// ---------------------------------------------------------------------------

/// Position and multiplicity constraints, stored as a bit set.
///
/// ```
/// use cadence_core::ConstraintSet;
///
/// let c = ConstraintSet::CANNOT_BE_FIRST | ConstraintSet::OPTIONAL;
/// assert!(c.contains(ConstraintSet::OPTIONAL));
/// assert!(!c.contains(ConstraintSet::MUST_BE_LAST));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintSet(u8);

impl ConstraintSet {
    pub const MUST_BE_FIRST: Self = Self(1 << 0);
    pub const MUST_BE_LAST: Self = Self(1 << 1);
    pub const CANNOT_BE_FIRST: Self = Self(1 << 2);
    pub const CANNOT_BE_LAST: Self = Self(1 << 3);
    pub const ALLOW_MULTIPLE: Self = Self(1 << 4);
    pub const OPTIONAL: Self = Self(1 << 5);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::MUST_BE_FIRST, "mustBeFirst"),
        (Self::MUST_BE_LAST, "mustBeLast"),
        (Self::CANNOT_BE_FIRST, "cannotBeFirst"),
        (Self::CANNOT_BE_LAST, "cannotBeLast"),
        (Self::ALLOW_MULTIPLE, "allowMultiple"),
        (Self::OPTIONAL, "optional"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for ConstraintSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ConstraintSet({})", names.join(" | "))
    }
}

// ---------------------------------------------------------------------------
// ConnectionRules
// ---------------------------------------------------------------------------

/// Input/output typing and predecessor requirements for one element type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRules {
    pub accepted_input_types: BTreeSet<DataType>,
    pub produced_output_type: DataType,
    #[serde(default)]
    pub required_predecessor_type_ids: BTreeSet<String>,
}

impl ConnectionRules {
    pub fn new(accepts: impl IntoIterator<Item = DataType>, produces: DataType) -> Self {
        Self {
            accepted_input_types: accepts.into_iter().collect(),
            produced_output_type: produces,
            required_predecessor_type_ids: BTreeSet::new(),
        }
    }

    pub fn requires(mut self, type_id: impl Into<String>) -> Self {
        self.required_predecessor_type_ids.insert(type_id.into());
        self
    }

    /// Whether output of type `produced` may feed this element.
    pub fn accepts(&self, produced: DataType) -> bool {
        self.accepted_input_types.contains(&DataType::Any)
            || self.accepted_input_types.contains(&produced)
    }
}

// ---------------------------------------------------------------------------
// ElementDescriptor
// ---------------------------------------------------------------------------

/// Which optional capabilities an element type exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFlags {
    pub is_sleepable: bool,
    pub tracks_resources: bool,
}

/// Immutable static description of a registered element type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub type_id: String,
    pub display_name: String,
    pub description: String,
    pub icon: String,
    pub constraints: ConstraintSet,
    pub connection_rules: ConnectionRules,
    pub capabilities: CapabilityFlags,
}
