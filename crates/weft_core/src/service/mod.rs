//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repositories and engines into the operations the boundary
//!   layer consumes.
//! - Keep transport layers decoupled from storage and engine details.

pub mod graph_service;
