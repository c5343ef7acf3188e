//! Changeset domain model.
//!
//! # Responsibility
//! - Define the atomic batch of source-level update operations.
//! - Define the wire shape persisted in the `changesets.data` column.
//!
//! # Invariants
//! - `perform` succeeds at most once per changeset; the version counter is
//!   the optimistic guard.
//! - Operation targets are resolved against `base_href` at perform time,
//!   never at construction time.

use crate::update::patch::PatchOp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangesetState {
    /// Created, not yet performed.
    PendingApproval,
    /// Deferred perform requested for a later instant.
    Scheduled,
    /// Performed successfully; terminal.
    Performed,
    /// Perform aborted; all operations rolled back. Terminal.
    Failed,
}

impl ChangesetState {
    /// Stable string id used in the `changesets.state` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingApproval => "pending-approval",
            Self::Scheduled => "scheduled",
            Self::Performed => "performed",
            Self::Failed => "failed",
        }
    }

    /// Parses one state from its column value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending-approval" => Some(Self::PendingApproval),
            "scheduled" => Some(Self::Scheduled),
            "performed" => Some(Self::Performed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Addressing for one operation's target source.
///
/// Either an explicit source href, or a `(resourceHref, sourceType)` pair;
/// both are resolved against the changeset's `base_href`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationTarget {
    Href {
        href: String,
    },
    Pair {
        #[serde(rename = "resourceHref")]
        resource_href: String,
        #[serde(rename = "sourceType")]
        source_type: String,
    },
}

/// One source-level update operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "UPPERCASE")]
pub enum UpdateOperation {
    Put {
        #[serde(flatten)]
        target: OperationTarget,
        /// `null` behaves as DELETE.
        data: Option<Value>,
    },
    Patch {
        #[serde(flatten)]
        target: OperationTarget,
        patch: Vec<PatchOp>,
        #[serde(rename = "createEmptyIfMissing", default)]
        create_empty_if_missing: bool,
    },
    Delete {
        #[serde(flatten)]
        target: OperationTarget,
    },
    /// Declared in the update schema; rejected at perform time until a
    /// concrete re-parenting design exists.
    Move {
        #[serde(flatten)]
        target: OperationTarget,
        #[serde(rename = "toResourceHref")]
        to_resource_href: String,
    },
}

impl UpdateOperation {
    /// Returns the operation's target addressing.
    pub fn target(&self) -> &OperationTarget {
        match self {
            Self::Put { target, .. }
            | Self::Patch { target, .. }
            | Self::Delete { target }
            | Self::Move { target, .. } => target,
        }
    }
}

/// A named, versioned batch of update operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: String,
    /// Base for relative-href resolution of operation targets.
    pub base_href: String,
    pub author: String,
    pub committer: String,
    pub state: ChangesetState,
    pub operations: Vec<UpdateOperation>,
    /// Optimistic concurrency counter; 0 means never persisted.
    pub version: i64,
}

impl Changeset {
    /// Creates a pending changeset with a generated id.
    ///
    /// `committer` defaults to `author` when absent.
    pub fn new(
        base_href: impl Into<String>,
        author: impl Into<String>,
        committer: Option<String>,
        operations: Vec<UpdateOperation>,
    ) -> Self {
        let author = author.into();
        let committer = committer.unwrap_or_else(|| author.clone());
        Self {
            id: Uuid::new_v4().to_string(),
            base_href: base_href.into(),
            author,
            committer,
            state: ChangesetState::PendingApproval,
            operations,
            version: 0,
        }
    }
}
