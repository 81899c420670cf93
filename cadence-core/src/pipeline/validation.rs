//! Pre-execution validation of a pipeline against element descriptors.
//!
//! ## Checks (all run, errors accumulate)
//!
//! ```text
//! 0. no enabled elements           → EmptyPipeline (returned alone)
//! 1. unknown type id               → MissingRequiredElement
//! 2. position constraints          → InvalidPosition
//! 3. repeated type w/o allowMultiple → DuplicateElement
//! 4. adjacent output/input types   → IncompatibleConnection
//! 5. required predecessor absent   → MissingDependency   (presence only, order-free)
//! 6. requirement loop among types  → CyclicDependency
//! ```
//!
//! Only enabled elements take part. The function is pure: same pipeline and
//! descriptors, same result.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::element::descriptor::{ConstraintSet, ElementDescriptor};

use super::{Pipeline, PipelineElementInstance};

/// Which position constraint an element broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PositionRule {
    MustBeFirst,
    MustBeLast,
    CannotBeFirst,
    CannotBeLast,
}

impl PositionRule {
    const ALL: [PositionRule; 4] = [
        PositionRule::MustBeFirst,
        PositionRule::MustBeLast,
        PositionRule::CannotBeFirst,
        PositionRule::CannotBeLast,
    ];

    fn flag(self) -> ConstraintSet {
        match self {
            PositionRule::MustBeFirst => ConstraintSet::MUST_BE_FIRST,
            PositionRule::MustBeLast => ConstraintSet::MUST_BE_LAST,
            PositionRule::CannotBeFirst => ConstraintSet::CANNOT_BE_FIRST,
            PositionRule::CannotBeLast => ConstraintSet::CANNOT_BE_LAST,
        }
    }

    fn violated(self, index: usize, last: usize) -> bool {
        match self {
            PositionRule::MustBeFirst => index != 0,
            PositionRule::MustBeLast => index != last,
            PositionRule::CannotBeFirst => index == 0,
            PositionRule::CannotBeLast => index == last,
        }
    }
}

impl fmt::Display for PositionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PositionRule::MustBeFirst => "mustBeFirst",
            PositionRule::MustBeLast => "mustBeLast",
            PositionRule::CannotBeFirst => "cannotBeFirst",
            PositionRule::CannotBeLast => "cannotBeLast",
        })
    }
}

/// A structural problem with a pipeline. Returned as data, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ValidationError {
    #[error("pipeline has no enabled elements")]
    EmptyPipeline,

    #[error("element `{instance_id}` uses unregistered type `{type_id}`")]
    MissingRequiredElement { instance_id: String, type_id: String },

    #[error("element `{instance_id}` ({type_id}) at position {index} violates {rule}")]
    InvalidPosition {
        instance_id: String,
        type_id: String,
        index: usize,
        rule: PositionRule,
    },

    #[error("`{from}` cannot feed `{to}`: {reason}")]
    IncompatibleConnection {
        from: String,
        to: String,
        reason: String,
    },

    #[error("type `{type_id}` appears {count} times but allows only one instance")]
    DuplicateElement { type_id: String, count: usize },

    #[error("element `{instance_id}` ({type_id}) requires a `{required}` element")]
    MissingDependency {
        instance_id: String,
        type_id: String,
        required: String,
    },

    #[error("element types require each other in a cycle: {}", .type_ids.join(" -> "))]
    CyclicDependency { type_ids: Vec<String> },
}

/// Verdict of [`validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn from_parts(errors: Vec<ValidationError>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Validate the enabled elements of `pipeline` against `descriptors`
/// (keyed by type id).
pub fn validate(
    pipeline: &Pipeline,
    descriptors: &HashMap<String, ElementDescriptor>,
) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !pipeline.is_enabled {
        warnings.push(format!("pipeline `{}` is disabled", pipeline.name));
    }
    for disabled in pipeline.elements.iter().filter(|e| !e.is_enabled) {
        warnings.push(format!(
            "element `{}` ({}) is disabled and will be skipped",
            disabled.id, disabled.type_id
        ));
    }

    let enabled = pipeline.enabled_elements();
    if enabled.is_empty() {
        return ValidationResult::from_parts(vec![ValidationError::EmptyPipeline], warnings);
    }

    let resolved: Vec<(&PipelineElementInstance, Option<&ElementDescriptor>)> = enabled
        .iter()
        .map(|instance| (*instance, descriptors.get(&instance.type_id)))
        .collect();

    // ── Unknown types ────────────────────────────────────────────────────
    for (instance, descriptor) in &resolved {
        if descriptor.is_none() {
            errors.push(ValidationError::MissingRequiredElement {
                instance_id: instance.id.clone(),
                type_id: instance.type_id.clone(),
            });
        }
    }

    // ── Position constraints ─────────────────────────────────────────────
    let last = resolved.len() - 1;
    for (index, (instance, descriptor)) in resolved.iter().enumerate() {
        let Some(descriptor) = descriptor else {
            continue;
        };
        for rule in PositionRule::ALL {
            if descriptor.constraints.contains(rule.flag()) && rule.violated(index, last) {
                errors.push(ValidationError::InvalidPosition {
                    instance_id: instance.id.clone(),
                    type_id: instance.type_id.clone(),
                    index,
                    rule,
                });
            }
        }
    }

    // ── Duplicates ───────────────────────────────────────────────────────
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for instance in &enabled {
        match counts.iter_mut().find(|(t, _)| *t == instance.type_id) {
            Some((_, count)) => *count += 1,
            None => counts.push((instance.type_id.as_str(), 1)),
        }
    }
    for (type_id, count) in &counts {
        let Some(descriptor) = descriptors.get(*type_id) else {
            continue;
        };
        if *count > 1 && !descriptor.constraints.contains(ConstraintSet::ALLOW_MULTIPLE) {
            errors.push(ValidationError::DuplicateElement {
                type_id: type_id.to_string(),
                count: *count,
            });
        }
    }

    // ── Adjacent type compatibility ──────────────────────────────────────
    for pair in resolved.windows(2) {
        let ((from, Some(from_desc)), (to, Some(to_desc))) = (pair[0], pair[1]) else {
            continue;
        };
        let produced = from_desc.connection_rules.produced_output_type;
        if !to_desc.connection_rules.accepts(produced) {
            let accepted: Vec<&str> = to_desc
                .connection_rules
                .accepted_input_types
                .iter()
                .map(|t| t.label())
                .collect();
            errors.push(ValidationError::IncompatibleConnection {
                from: from.id.clone(),
                to: to.id.clone(),
                reason: format!(
                    "`{}` produces {} but `{}` accepts [{}]",
                    from.type_id,
                    produced,
                    to.type_id,
                    accepted.join(", ")
                ),
            });
        }
    }

    // ── Dependencies ─────────────────────────────────────────────────────
    let mut present_order: Vec<&str> = Vec::new();
    for (instance, descriptor) in &resolved {
        if descriptor.is_some() && !present_order.contains(&instance.type_id.as_str()) {
            present_order.push(instance.type_id.as_str());
        }
    }
    let present: HashSet<&str> = enabled.iter().map(|e| e.type_id.as_str()).collect();

    for (index, (instance, descriptor)) in resolved.iter().enumerate() {
        let Some(descriptor) = descriptor else {
            continue;
        };
        for required in &descriptor.connection_rules.required_predecessor_type_ids {
            if !present.contains(required.as_str()) {
                errors.push(ValidationError::MissingDependency {
                    instance_id: instance.id.clone(),
                    type_id: instance.type_id.clone(),
                    required: required.clone(),
                });
                continue;
            }
            let first = enabled.iter().position(|e| &e.type_id == required);
            if first.is_some_and(|first| first > index) {
                warnings.push(format!(
                    "element `{}` ({}) runs before the `{}` element it depends on",
                    instance.id, instance.type_id, required
                ));
            }
        }
    }

    errors.extend(
        dependency_cycles(&present_order, descriptors)
            .into_iter()
            .map(|type_ids| ValidationError::CyclicDependency { type_ids }),
    );

    ValidationResult::from_parts(errors, warnings)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    OnStack,
    Done,
}

/// Requirement cycles among the present types, each reported once, rotated
/// to start at its smallest type id and closed (`a -> b -> a`).
fn dependency_cycles<'a>(
    present: &[&'a str],
    descriptors: &'a HashMap<String, ElementDescriptor>,
) -> Vec<Vec<String>> {
    let mut marks: HashMap<&'a str, Mark> = present.iter().map(|t| (*t, Mark::New)).collect();
    let mut stack: Vec<&'a str> = Vec::new();
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut cycles = Vec::new();

    for &start in present {
        if marks.get(start) == Some(&Mark::New) {
            visit(start, descriptors, &mut marks, &mut stack, &mut seen, &mut cycles);
        }
    }
    cycles
}

fn visit<'a>(
    node: &'a str,
    descriptors: &'a HashMap<String, ElementDescriptor>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
    seen: &mut HashSet<Vec<String>>,
    cycles: &mut Vec<Vec<String>>,
) {
    marks.insert(node, Mark::OnStack);
    stack.push(node);

    if let Some(descriptor) = descriptors.get(node) {
        for dep in &descriptor.connection_rules.required_predecessor_type_ids {
            let dep = dep.as_str();
            match marks.get(dep).copied() {
                Some(Mark::New) => visit(dep, descriptors, marks, stack, seen, cycles),
                Some(Mark::OnStack) => {
                    let Some(start) = stack.iter().position(|n| *n == dep) else {
                        continue;
                    };
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    let min = cycle
                        .iter()
                        .enumerate()
                        .min_by(|a, b| a.1.cmp(b.1))
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    cycle.rotate_left(min);
                    if seen.insert(cycle.clone()) {
                        let head = cycle[0].clone();
                        cycle.push(head);
                        cycles.push(cycle);
                    }
                }
                // Absent types are reported as missing dependencies.
                Some(Mark::Done) | None => {}
            }
        }
    }

    stack.pop();
    marks.insert(node, Mark::Done);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
