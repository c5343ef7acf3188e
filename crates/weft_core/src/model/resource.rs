//! Resource domain model.
//!
//! # Responsibility
//! - Define the canonical derived-document record addressed by href.
//! - Provide the extant-window computation shared by regeneration and
//!   identifier maintenance.
//!
//! # Invariants
//! - `data` is always the output of the most recent successful regeneration;
//!   clients never edit it directly.
//! - Resources are never hard-deleted; `deleted` reflects the state of their
//!   sources while the row persists for href stability.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical derived entity, one per `(type, identifier)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Canonical address, `/{type}/{identifier}`.
    pub href: String,
    /// Resource type name. Serialized as `type` to match the wire shape.
    #[serde(rename = "type")]
    pub kind: String,
    /// Identifier within the type, client-supplied or generated.
    pub identifier: String,
    /// Derived document; output of the regeneration pipeline.
    pub data: Value,
    /// Monotonically increasing regeneration counter.
    pub version: i64,
    /// True when every source row is deleted (and at least one exists).
    pub deleted: bool,
    /// True when the current time falls inside the `[start_date, end_date)`
    /// window.
    pub extant: bool,
    /// Window start, epoch ms.
    pub start_date: Option<i64>,
    /// Window end, epoch ms.
    pub end_date: Option<i64>,
    /// Optional spatial point `(lat, lon)`.
    pub point: Option<(f64, f64)>,
    /// External `@id` URI, denormalized from the document.
    pub uri: String,
}

impl Resource {
    /// Creates a fresh, never-regenerated resource row.
    pub fn new(kind: impl Into<String>, identifier: impl Into<String>) -> Self {
        let kind = kind.into();
        let identifier = identifier.into();
        let href = super::href::resource_href(&kind, &identifier);
        Self {
            href,
            kind,
            identifier,
            data: Value::Object(serde_json::Map::new()),
            version: 0,
            deleted: false,
            extant: true,
            start_date: None,
            end_date: None,
            point: None,
            uri: String::new(),
        }
    }

    /// Computes the extant flag for a date window at `now` (epoch ms).
    pub fn extant_at(start_date: Option<i64>, end_date: Option<i64>, now: i64) -> bool {
        start_date.map_or(true, |start| start <= now)
            && end_date.map_or(true, |end| now < end)
    }

    /// Returns the next future window boundary after `now`, if any.
    ///
    /// This is the instant at which the extant flag will flip and the
    /// resource needs a re-save.
    pub fn next_boundary(start_date: Option<i64>, end_date: Option<i64>, now: i64) -> Option<i64> {
        [start_date, end_date]
            .into_iter()
            .flatten()
            .filter(|at| *at > now)
            .min()
    }

    /// Current time in epoch ms.
    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}
