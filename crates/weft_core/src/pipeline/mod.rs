//! Inference steps of the derivation pipeline.
//!
//! # Responsibility
//! - Derive document fields from source pointers in registry-declared order.
//! - Keep every step a pure document transformation.
//!
//! # Invariants
//! - Steps run in declaration order; the order is part of the type
//!   definition and must be reproducible.
//! - Steps read from source pointers and write to target pointers, never the
//!   reverse.

pub mod normalize;

use crate::model::document::{Document, DocumentResult};
use serde_json::{Map, Value};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Registry-supplied derivation hook.
pub type CustomStepFn = Arc<dyn Fn(&mut Document) -> DocumentResult<()> + Send + Sync>;

/// One ordered derivation step.
///
/// A closed set of combinators plus an escape hatch for type-specific hooks;
/// every variant exposes the single `apply` capability.
#[derive(Clone)]
pub enum InferenceStep {
    /// Copies the first resolvable source pointer's value to `target`.
    ///
    /// With `update`, object values are shallow-merged into an existing
    /// object target instead of replacing it.
    FirstOf {
        target: String,
        sources: Vec<String>,
        update: bool,
    },
    /// Unions values from all source pointers into a deduplicated,
    /// lexicographically sorted list at `target`.
    ///
    /// Non-list source values are wrapped as singletons. With `append`, the
    /// pre-existing target value is included among the sources.
    Set {
        target: String,
        sources: Vec<String>,
        append: bool,
    },
    /// Named registry-supplied hook.
    Custom { name: String, func: CustomStepFn },
}

impl Debug for InferenceStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstOf {
                target,
                sources,
                update,
            } => f
                .debug_struct("FirstOf")
                .field("target", target)
                .field("sources", sources)
                .field("update", update)
                .finish(),
            Self::Set {
                target,
                sources,
                append,
            } => f
                .debug_struct("Set")
                .field("target", target)
                .field("sources", sources)
                .field("append", append)
                .finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

impl InferenceStep {
    /// Convenience constructor for `FirstOf`.
    pub fn first_of(
        target: impl Into<String>,
        sources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::FirstOf {
            target: target.into(),
            sources: sources.into_iter().map(Into::into).collect(),
            update: false,
        }
    }

    /// Convenience constructor for `Set`.
    pub fn set(
        target: impl Into<String>,
        sources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::Set {
            target: target.into(),
            sources: sources.into_iter().map(Into::into).collect(),
            append: false,
        }
    }

    /// Applies this step to the working document.
    pub fn apply(&self, doc: &mut Document) -> DocumentResult<()> {
        match self {
            Self::FirstOf {
                target,
                sources,
                update,
            } => apply_first_of(doc, target, sources, *update),
            Self::Set {
                target,
                sources,
                append,
            } => apply_set(doc, target, sources, *append),
            Self::Custom { func, .. } => func(doc),
        }
    }
}

fn apply_first_of(
    doc: &mut Document,
    target: &str,
    sources: &[String],
    update: bool,
) -> DocumentResult<()> {
    let value = sources.iter().find_map(|path| doc.get(path).cloned());
    let Some(value) = value else {
        return Ok(());
    };

    let target_is_object = matches!(doc.get(target), Some(Value::Object(_)));
    if update && target_is_object {
        if let Value::Object(incoming) = &value {
            return doc.merge_object(target, incoming.clone());
        }
    }
    doc.set(target, value)
}

fn apply_set(
    doc: &mut Document,
    target: &str,
    sources: &[String],
    append: bool,
) -> DocumentResult<()> {
    let mut collected: Vec<Value> = Vec::new();
    if append {
        if let Some(existing) = doc.get(target) {
            extend_from(&mut collected, existing);
        }
    }
    for path in sources {
        if let Some(value) = doc.get(path) {
            extend_from(&mut collected, value);
        }
    }
    if collected.is_empty() && doc.get(target).is_none() {
        return Ok(());
    }

    // Dedup and order by canonical JSON text so pipeline output is stable
    // across runs regardless of source ordering.
    let mut keyed: Vec<(String, Value)> = collected
        .into_iter()
        .map(|value| (value.to_string(), value))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);

    doc.set(
        target,
        Value::Array(keyed.into_iter().map(|(_, value)| value).collect()),
    )
}

fn extend_from(collected: &mut Vec<Value>, value: &Value) {
    match value {
        Value::Array(items) => collected.extend(items.iter().cloned()),
        Value::Null => {}
        other => collected.push(other.clone()),
    }
}

/// Seeds the `@source` namespace from source contributions.
pub fn seed_sources<'src>(
    doc: &mut Document,
    contributions: impl IntoIterator<Item = (&'src str, &'src Value)>,
) -> DocumentResult<()> {
    doc.set("@source", Value::Object(Map::new()))?;
    for (source_type, data) in contributions {
        doc.set(&format!("@source/{source_type}"), data.clone())?;
    }
    Ok(())
}
