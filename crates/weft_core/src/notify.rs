//! Change notification seam.
//!
//! # Responsibility
//! - Hand successful mutations to the host's fan-out machinery.
//!
//! # Invariants
//! - Notification is fire-and-forget: a sink must never fail the caller,
//!   and sinks are only invoked after the owning transaction committed.

/// One committed mutation worth telling the host about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A resource's derived document changed.
    ResourceSaved { href: String, version: i64 },
    /// A source row was created or modified.
    SourceSaved {
        href: String,
        version: i64,
        created: bool,
    },
    /// A resource's date window begins or ends at `at` (epoch ms); the host
    /// scheduler should re-save it then.
    RegenerationScheduled { href: String, at: i64 },
}

/// Host-supplied notification sink.
pub trait ChangeSink: Send + Sync {
    fn notify(&self, event: &ChangeEvent);
}

/// Sink that drops every event; development and test default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ChangeSink for NoopSink {
    fn notify(&self, _event: &ChangeEvent) {}
}
