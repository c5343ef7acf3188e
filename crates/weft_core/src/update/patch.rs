//! JSON Patch application and structural diffing.
//!
//! # Responsibility
//! - Apply an RFC 6902 operation subset (`add`, `remove`, `replace`, `test`)
//!   to a JSON value, without mutating the input.
//! - Compute a patch turning one JSON value into another, used by PUT
//!   delegation.
//!
//! # Invariants
//! - `apply_patch(doc, diff(doc, target)) == target` for object-rooted
//!   values.
//! - Paths use RFC 6901 JSON Pointers (`/a/b/0`, `~0`/`~1` escapes, `-`
//!   appends to arrays).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// One JSON Patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Test { path: String, value: Value },
}

impl PatchOp {
    /// Returns the JSON Pointer this operation addresses.
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. }
            | Self::Remove { path }
            | Self::Replace { path, .. }
            | Self::Test { path, .. } => path,
        }
    }
}

/// Errors from patch application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// Pointer syntax is invalid (missing leading `/`, bad index).
    BadPointer(String),
    /// Pointer does not resolve in the target document.
    TargetMissing(String),
    /// `test` operation found a different value.
    TestFailed(String),
    /// Pointer traverses through a scalar.
    NotAContainer(String),
}

impl Display for PatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadPointer(path) => write!(f, "invalid JSON pointer: `{path}`"),
            Self::TargetMissing(path) => write!(f, "patch path does not resolve: `{path}`"),
            Self::TestFailed(path) => write!(f, "patch test failed at `{path}`"),
            Self::NotAContainer(path) => {
                write!(f, "patch path traverses a non-container at `{path}`")
            }
        }
    }
}

impl Error for PatchError {}

/// Applies `patch` to a copy of `doc` and returns the result.
pub fn apply_patch(doc: &Value, patch: &[PatchOp]) -> Result<Value, PatchError> {
    let mut working = doc.clone();
    for op in patch {
        match op {
            PatchOp::Add { path, value } => add(&mut working, path, value.clone())?,
            PatchOp::Remove { path } => {
                remove(&mut working, path)?;
            }
            PatchOp::Replace { path, value } => replace(&mut working, path, value.clone())?,
            PatchOp::Test { path, value } => {
                let found =
                    resolve(&working, path)?.ok_or_else(|| PatchError::TargetMissing(path.clone()))?;
                if found != value {
                    return Err(PatchError::TestFailed(path.clone()));
                }
            }
        }
    }
    Ok(working)
}

/// Computes a patch turning `from` into `to`.
///
/// Objects are diffed key by key (recursively); arrays and scalars are
/// replaced wholesale when unequal. The result applied to `from` always
/// yields `to`.
pub fn diff(from: &Value, to: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into("", from, to, &mut ops);
    ops
}

fn diff_into(prefix: &str, from: &Value, to: &Value, ops: &mut Vec<PatchOp>) {
    match (from, to) {
        (Value::Object(from_map), Value::Object(to_map)) => {
            for key in from_map.keys() {
                if !to_map.contains_key(key) {
                    ops.push(PatchOp::Remove {
                        path: format!("{prefix}/{}", escape(key)),
                    });
                }
            }
            for (key, to_value) in to_map {
                let path = format!("{prefix}/{}", escape(key));
                match from_map.get(key) {
                    None => ops.push(PatchOp::Add {
                        path,
                        value: to_value.clone(),
                    }),
                    Some(from_value) if from_value == to_value => {}
                    Some(from_value) => diff_into(&path, from_value, to_value, ops),
                }
            }
        }
        _ if from == to => {}
        _ => ops.push(PatchOp::Replace {
            path: prefix.to_string(),
            value: to.clone(),
        }),
    }
}

fn tokens(path: &str) -> Result<Vec<String>, PatchError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| PatchError::BadPointer(path.to_string()))?;
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn resolve<'doc>(doc: &'doc Value, path: &str) -> Result<Option<&'doc Value>, PatchError> {
    let mut current = doc;
    for token in tokens(path)? {
        current = match current {
            Value::Object(map) => match map.get(&token) {
                Some(value) => value,
                None => return Ok(None),
            },
            Value::Array(items) => {
                let index = parse_index(&token, path)?;
                match items.get(index) {
                    Some(value) => value,
                    None => return Ok(None),
                }
            }
            _ => return Err(PatchError::NotAContainer(path.to_string())),
        };
    }
    Ok(Some(current))
}

/// Navigates to the parent container of `path` and returns it with the final
/// token.
fn parent_of<'doc>(
    doc: &'doc mut Value,
    path: &str,
) -> Result<(&'doc mut Value, String), PatchError> {
    let mut parts = tokens(path)?;
    let last = parts
        .pop()
        .ok_or_else(|| PatchError::BadPointer(path.to_string()))?;
    let mut current = doc;
    for token in parts {
        current = match current {
            Value::Object(map) => map
                .get_mut(&token)
                .ok_or_else(|| PatchError::TargetMissing(path.to_string()))?,
            Value::Array(items) => {
                let index = parse_index(&token, path)?;
                items
                    .get_mut(index)
                    .ok_or_else(|| PatchError::TargetMissing(path.to_string()))?
            }
            _ => return Err(PatchError::NotAContainer(path.to_string())),
        };
    }
    Ok((current, last))
}

fn add(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, last) = parent_of(doc, path)?;
    match parent {
        Value::Object(map) => {
            map.insert(last, value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index = parse_index(&last, path)?;
            if index > items.len() {
                return Err(PatchError::TargetMissing(path.to_string()));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::NotAContainer(path.to_string())),
    }
}

fn remove(doc: &mut Value, path: &str) -> Result<Value, PatchError> {
    let (parent, last) = parent_of(doc, path)?;
    match parent {
        Value::Object(map) => map
            .remove(&last)
            .ok_or_else(|| PatchError::TargetMissing(path.to_string())),
        Value::Array(items) => {
            let index = parse_index(&last, path)?;
            if index >= items.len() {
                return Err(PatchError::TargetMissing(path.to_string()));
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchError::NotAContainer(path.to_string())),
    }
}

fn replace(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, last) = parent_of(doc, path)?;
    match parent {
        Value::Object(map) => match map.get_mut(&last) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(PatchError::TargetMissing(path.to_string())),
        },
        Value::Array(items) => {
            let index = parse_index(&last, path)?;
            match items.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(PatchError::TargetMissing(path.to_string())),
            }
        }
        _ => Err(PatchError::NotAContainer(path.to_string())),
    }
}

fn parse_index(token: &str, path: &str) -> Result<usize, PatchError> {
    if token != "0" && token.starts_with('0') {
        return Err(PatchError::BadPointer(path.to_string()));
    }
    token
        .parse::<usize>()
        .map_err(|_| PatchError::BadPointer(path.to_string()))
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
