//! Pointer-addressed working document.
//!
//! # Responsibility
//! - Provide slash-path get/set/default-fill access over a JSON object tree.
//! - Serve as the working substrate for inference and normalization passes.
//!
//! # Invariants
//! - The root is always a JSON object.
//! - `set` creates missing intermediate objects; it never silently traverses
//!   through scalars or arrays.

use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Result type for document path operations.
pub type DocumentResult<T> = Result<T, DocumentPathError>;

/// Errors from pointer-addressed writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentPathError {
    /// Path is empty or contains an empty segment.
    EmptyPath,
    /// An intermediate segment resolved to a non-object value.
    NotTraversable { path: String, segment: String },
}

impl Display for DocumentPathError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPath => write!(f, "document path is empty"),
            Self::NotTraversable { path, segment } => write!(
                f,
                "document path `{path}` is not traversable at segment `{segment}`"
            ),
        }
    }
}

impl Error for DocumentPathError {}

/// JSON object tree with slash-separated path addressing.
///
/// Paths look like `@source/science/label`; array elements are addressed by
/// decimal index segments on read.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Value,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Creates an empty document (`{}` root).
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    /// Wraps an existing JSON object as a document.
    ///
    /// Returns `None` when `value` is not an object.
    pub fn from_value(value: Value) -> Option<Self> {
        if value.is_object() {
            Some(Self { root: value })
        } else {
            None
        }
    }

    /// Returns the underlying JSON tree.
    pub fn as_value(&self) -> &Value {
        &self.root
    }

    /// Consumes the document and returns the JSON tree.
    pub fn take_tree(self) -> Value {
        self.root
    }

    /// Resolves a slash path to a value, if present.
    ///
    /// Resolution fails softly: missing segments, bad array indexes and
    /// scalar intermediates all yield `None`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in segments(path).ok()? {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating missing intermediate objects.
    pub fn set(&mut self, path: &str, value: Value) -> DocumentResult<()> {
        let slot = self.slot_for(path)?;
        *slot = value;
        Ok(())
    }

    /// Writes `value` at `path` only when nothing resolvable is there yet.
    pub fn set_default(&mut self, path: &str, value: Value) -> DocumentResult<()> {
        if self.get(path).is_none() {
            self.set(path, value)?;
        }
        Ok(())
    }

    /// Shallow-merges an object value into the object at `path`.
    ///
    /// A missing or non-object target is treated as an empty object; keys of
    /// `value` win over existing keys.
    pub fn merge_object(&mut self, path: &str, value: Map<String, Value>) -> DocumentResult<()> {
        let slot = self.slot_for(path)?;
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(target) = slot {
            for (key, entry) in value {
                target.insert(key, entry);
            }
        }
        Ok(())
    }

    /// Removes and returns the value at `path`, if present.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let parts = segments(path).ok()?;
        let (last, init) = parts.split_last()?;
        let mut current = &mut self.root;
        for segment in init {
            current = match current {
                Value::Object(map) => map.get_mut(*segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            Value::Object(map) => map.remove(*last),
            _ => None,
        }
    }

    /// Returns the keys of the root object.
    pub fn root_keys(&self) -> Vec<String> {
        match &self.root {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn slot_for(&mut self, path: &str) -> DocumentResult<&mut Value> {
        let parts = segments(path)?;
        let (last, init) = parts.split_last().ok_or(DocumentPathError::EmptyPath)?;
        let mut current = &mut self.root;
        for segment in init {
            let map = match current {
                Value::Object(map) => map,
                _ => {
                    return Err(DocumentPathError::NotTraversable {
                        path: path.to_string(),
                        segment: (*segment).to_string(),
                    })
                }
            };
            let next = map
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if next.is_null() {
                *next = Value::Object(Map::new());
            }
            if !next.is_object() {
                return Err(DocumentPathError::NotTraversable {
                    path: path.to_string(),
                    segment: (*segment).to_string(),
                });
            }
            current = next;
        }
        match current {
            Value::Object(map) => Ok(map
                .entry((*last).to_string())
                .or_insert(Value::Null)),
            _ => Err(DocumentPathError::NotTraversable {
                path: path.to_string(),
                segment: (*last).to_string(),
            }),
        }
    }
}

fn segments(path: &str) -> DocumentResult<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(DocumentPathError::EmptyPath);
    }
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.iter().any(|segment| segment.is_empty()) {
        return Err(DocumentPathError::EmptyPath);
    }
    Ok(parts)
}
