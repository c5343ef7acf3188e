//! Regeneration engine and cascade traversal.
//!
//! # Responsibility
//! - Recompute one resource's derived document from its sources and link
//!   neighborhood.
//! - Propagate link-derived changes to affected resources without looping
//!   on cyclic link graphs.
//!
//! # Invariants
//! - Regenerating an unchanged resource is a no-op: no version bump, no
//!   index writes, no cascade.
//! - Within one save call every href is regenerated at most once. Nodes in
//!   a cycle may stay stale until the next independent edit; that window is
//!   accepted.
//! - Callers own the transaction; the engine never commits and never
//!   notifies sinks directly.

use crate::model::document::{Document, DocumentPathError};
use crate::model::resource::Resource;
use crate::model::source::Source;
use crate::notify::ChangeEvent;
use crate::pipeline::normalize::{
    self, date_field_ms, extract_point, outbound_links, NormalizeError,
};
use crate::pipeline::seed_sources;
use crate::registry::TypeRegistry;
use crate::repo::identifier_repo::{IdentifierRepo, IdentifierRepoError};
use crate::repo::link_repo::LinkRepo;
use crate::repo::resource_repo::ResourceRepo;
use crate::repo::source_repo::SourceRepo;
use crate::repo::RepoError;
use log::{debug, info};
use rusqlite::Connection;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type RegenResult<T> = Result<T, RegenError>;

/// Errors from regeneration and cascade persistence.
#[derive(Debug)]
pub enum RegenError {
    /// Resource row has a type the registry does not know.
    UnknownResourceType { href: String, name: String },
    /// Top-level save target does not exist.
    NotFound(String),
    Document(DocumentPathError),
    Normalize(NormalizeError),
    Identifier(IdentifierRepoError),
    Repo(RepoError),
}

impl Display for RegenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownResourceType { href, name } => {
                write!(f, "resource `{href}` has unknown type `{name}`")
            }
            Self::NotFound(href) => write!(f, "resource not found: {href}"),
            Self::Document(err) => write!(f, "{err}"),
            Self::Normalize(err) => write!(f, "{err}"),
            Self::Identifier(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RegenError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UnknownResourceType { .. } | Self::NotFound(_) => None,
            Self::Document(err) => Some(err),
            Self::Normalize(err) => Some(err),
            Self::Identifier(err) => Some(err),
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<DocumentPathError> for RegenError {
    fn from(value: DocumentPathError) -> Self {
        Self::Document(value)
    }
}

impl From<NormalizeError> for RegenError {
    fn from(value: NormalizeError) -> Self {
        Self::Normalize(value)
    }
}

impl From<IdentifierRepoError> for RegenError {
    fn from(value: IdentifierRepoError) -> Self {
        Self::Identifier(value)
    }
}

impl From<RepoError> for RegenError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Outcome of recomputing one resource's document.
#[derive(Debug, Clone)]
pub struct Regeneration {
    /// The freshly derived document.
    pub document: Value,
    /// False when the document equals the stored one.
    pub changed: bool,
    /// Hrefs whose inbound-link view of this resource may have changed:
    /// the union of previous and new outbound link targets.
    pub cascade: BTreeSet<String>,
}

/// Outcome of one save call, including the cascade.
#[derive(Debug, Clone, Default)]
pub struct SaveReport {
    /// Hrefs regenerated, in visit order. Each appears at most once.
    pub visited: Vec<String>,
    /// Subset of `visited` whose rows were actually rewritten.
    pub changed: Vec<String>,
    /// Events to hand to the change sink once the transaction commits.
    pub events: Vec<ChangeEvent>,
}

/// Recomputes derived documents and drives the cascade worklist.
pub struct RegenEngine<'conn> {
    conn: &'conn Connection,
    registry: Arc<TypeRegistry>,
}

impl<'conn> RegenEngine<'conn> {
    pub fn new(conn: &'conn Connection, registry: Arc<TypeRegistry>) -> Self {
        Self { conn, registry }
    }

    /// Recomputes one resource's document without persisting anything.
    pub fn regenerate(
        &self,
        resource: &Resource,
        source_rows: &[Source],
    ) -> RegenResult<Regeneration> {
        let resource_type = self.registry.resource_type(&resource.kind).ok_or_else(|| {
            RegenError::UnknownResourceType {
                href: resource.href.clone(),
                name: resource.kind.clone(),
            }
        })?;

        let mut doc = Document::new();
        seed_sources(
            &mut doc,
            source_rows
                .iter()
                .filter_map(|source| source.contribution().map(|data| (source.kind.as_str(), data))),
        )?;
        for step in &resource_type.inference {
            step.apply(&mut doc)?;
        }

        let inbound = LinkRepo::new(self.conn).inbound(&resource.href)?;
        normalize::normalize(&mut doc, &self.registry, resource_type, resource, &inbound)?;

        let document = doc.take_tree();
        let changed = document != resource.data;
        let cascade: BTreeSet<String> = outbound_links(&resource.data, &self.registry)
            .into_iter()
            .chain(outbound_links(&document, &self.registry))
            .map(|(target, _)| target)
            .filter(|target| target != &resource.href)
            .collect();

        Ok(Regeneration {
            document,
            changed,
            cascade,
        })
    }

    /// Regenerates `href` and every affected resource, worklist-style.
    ///
    /// The visited set is the regeneration path: a href already visited in
    /// this call is never queued again, which terminates cyclic link
    /// graphs. Unchanged resources do not extend the cascade.
    pub fn save(&self, href: &str) -> RegenResult<SaveReport> {
        let resources = ResourceRepo::new(self.conn);
        let sources = SourceRepo::new(self.conn);
        let links = LinkRepo::new(self.conn);
        let identifiers = IdentifierRepo::new(self.conn);

        if resources.get(href)?.is_none() {
            return Err(RegenError::NotFound(href.to_string()));
        }

        let mut report = SaveReport::default();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([href.to_string()]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            // Cascade candidates may be dangling hrefs; they have no rows to
            // maintain and nothing to regenerate.
            let Some(mut resource) = resources.get(&current)? else {
                continue;
            };
            report.visited.push(current.clone());

            let source_rows = sources.list_for_resource(&current)?;
            let regen = self.regenerate(&resource, &source_rows)?;

            let now = Resource::now_ms();
            let start_date = date_field_ms(&regen.document, "startDate");
            let end_date = date_field_ms(&regen.document, "endDate");
            let next = Denormalized {
                deleted: !source_rows.is_empty()
                    && source_rows.iter().all(|source| source.deleted),
                extant: Resource::extant_at(start_date, end_date, now),
                start_date,
                end_date,
                point: extract_point(&regen.document),
                uri: regen
                    .document
                    .get("@id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
            let scalars_changed = next.differs_from(&resource);

            if regen.changed || scalars_changed {
                resource.data = regen.document.clone();
                resource.version += 1;
                next.write_to(&mut resource);
                resources.update_regenerated(&resource)?;

                let outbound: BTreeSet<(String, String)> =
                    outbound_links(&resource.data, &self.registry);
                links.replace_links(&current, &outbound)?;
                identifiers.replace_identifiers(&current, &identifier_entries(&resource))?;

                debug!(
                    "event=resource_regenerate module=regen status=ok href={current} version={}",
                    resource.version
                );
                report.changed.push(current.clone());
                report.events.push(ChangeEvent::ResourceSaved {
                    href: current.clone(),
                    version: resource.version,
                });

                for target in &regen.cascade {
                    if !visited.contains(target) {
                        queue.push_back(target.clone());
                    }
                }
            }

            if let Some(at) = Resource::next_boundary(start_date, end_date, now) {
                report.events.push(ChangeEvent::RegenerationScheduled {
                    href: current.clone(),
                    at,
                });
            }
        }

        info!(
            "event=resource_save module=regen status=ok href={href} visited={} changed={}",
            report.visited.len(),
            report.changed.len()
        );
        Ok(report)
    }
}

struct Denormalized {
    deleted: bool,
    extant: bool,
    start_date: Option<i64>,
    end_date: Option<i64>,
    point: Option<(f64, f64)>,
    uri: String,
}

impl Denormalized {
    fn differs_from(&self, resource: &Resource) -> bool {
        self.deleted != resource.deleted
            || self.extant != resource.extant
            || self.start_date != resource.start_date
            || self.end_date != resource.end_date
            || self.point != resource.point
            || self.uri != resource.uri
    }

    fn write_to(&self, resource: &mut Resource) {
        resource.deleted = self.deleted;
        resource.extant = self.extant;
        resource.start_date = self.start_date;
        resource.end_date = self.end_date;
        resource.point = self.point;
        resource.uri = self.uri.clone();
    }
}

/// Collects the `(scheme, value)` rows a resource should hold.
///
/// Extant resources index their public `identifier` map plus their own
/// `(type, identifier)` pair; non-extant ones keep only stable identifiers.
fn identifier_entries(resource: &Resource) -> Vec<(String, String)> {
    let field = if resource.extant {
        "identifier"
    } else {
        "stableIdentifier"
    };
    let mut entries: BTreeSet<(String, String)> = BTreeSet::new();
    if let Some(Value::Object(map)) = resource.data.get(field) {
        for (scheme, value) in map {
            match value {
                Value::String(text) => {
                    entries.insert((scheme.clone(), text.clone()));
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(text) = item.as_str() {
                            entries.insert((scheme.clone(), text.to_string()));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    if resource.extant {
        entries.insert((resource.kind.clone(), resource.identifier.clone()));
    }
    entries.into_iter().collect()
}
