//! Core consistency engine for the weft derived-document graph.
//! This crate is the single source of truth for regeneration, cascade and
//! changeset invariants; transport and rendering layers sit on top.

pub mod db;
pub mod logging;
pub mod model;
pub mod notify;
pub mod perm;
pub mod pipeline;
pub mod regen;
pub mod registry;
pub mod repo;
pub mod service;
pub mod update;

pub use logging::{default_log_level, init_logging, logging_status};
pub use model::changeset::{Changeset, ChangesetState, OperationTarget, UpdateOperation};
pub use model::document::Document;
pub use model::resource::Resource;
pub use model::source::Source;
pub use notify::{ChangeEvent, ChangeSink, NoopSink};
pub use perm::{AllowAllGate, PermAction, PermissionGate};
pub use pipeline::InferenceStep;
pub use regen::{RegenEngine, SaveReport};
pub use registry::{LinkTypeDef, ResourceTypeDef, SourceTypeDef, TypeRegistry};
pub use service::graph_service::{external_document, GraphService, ServiceError};
pub use update::patch::PatchOp;
pub use update::{ChangesetEngine, OpOutcome, PerformReport, UpdateError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
