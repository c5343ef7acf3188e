//! Domain model for the derived-document graph.
//!
//! # Responsibility
//! - Define canonical data structures used by the consistency core.
//! - Keep one record shape per table; derived state stays derived.
//!
//! # Invariants
//! - Every record is addressed by a stable href.
//! - Deletion is represented by tombstones, not hard deletes.

pub mod changeset;
pub mod document;
pub mod href;
pub mod resource;
pub mod source;
