//! Source domain model.
//!
//! # Responsibility
//! - Define the independently editable contribution record for a resource.
//! - Provide lifecycle helpers for tombstone and resurrection semantics.
//!
//! # Invariants
//! - A deleted source has `data = None` and contributes nothing to
//!   regeneration.
//! - Source rows are kept after deletion so history and links survive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author-supplied contribution, one per `(resource, source_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Canonical address, `{resource_href}/source/{type}`.
    pub href: String,
    /// Owning resource href.
    pub resource_href: String,
    /// Source type name. Serialized as `type` to match the wire shape.
    #[serde(rename = "type")]
    pub kind: String,
    /// Raw author-supplied JSON object; `None` when deleted.
    pub data: Option<Value>,
    /// Monotonically increasing edit counter.
    pub version: i64,
    /// Tombstone flag; the row is kept.
    pub deleted: bool,
    /// Original author of this contribution.
    pub author: String,
    /// User whose changeset last touched this row.
    pub committer: String,
}

impl Source {
    /// Creates a new, not-yet-persisted source row.
    pub fn new(
        resource_href: impl Into<String>,
        kind: impl Into<String>,
        author: impl Into<String>,
        committer: impl Into<String>,
    ) -> Self {
        let resource_href = resource_href.into();
        let kind = kind.into();
        let href = super::href::source_href(&resource_href, &kind);
        Self {
            href,
            resource_href,
            kind,
            data: None,
            version: 0,
            deleted: false,
            author: author.into(),
            committer: committer.into(),
        }
    }

    /// Marks the source deleted and clears its payload.
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.data = None;
    }

    /// Returns the data this source contributes to regeneration.
    pub fn contribution(&self) -> Option<&Value> {
        if self.deleted {
            None
        } else {
            self.data.as_ref()
        }
    }
}
