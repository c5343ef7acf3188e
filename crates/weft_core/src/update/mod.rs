//! Changeset validation and application.
//!
//! # Responsibility
//! - Apply batches of source-level PUT/PATCH/DELETE operations atomically.
//! - Enforce permission, schema and filter-commutativity invariants per
//!   operation.
//! - Trigger regeneration once per distinct owning resource.
//!
//! # Invariants
//! - All-or-nothing: any per-operation failure rolls back the whole batch
//!   and surfaces every collected error at once.
//! - A committer can never patch data the active filter hides from them:
//!   filtering and patch application must commute.
//! - Concurrent changesets serialize on the store's write lock; the
//!   changeset row itself is guarded by an optimistic version check.

pub mod patch;

use crate::model::changeset::{Changeset, ChangesetState, OperationTarget, UpdateOperation};
use crate::model::href::{self, HrefError};
use crate::model::resource::Resource;
use crate::model::source::Source;
use crate::notify::{ChangeEvent, ChangeSink};
use crate::perm::{PermAction, PermissionGate};
use crate::regen::{RegenEngine, RegenError};
use crate::registry::{SourceTypeDef, TypeRegistry};
use crate::repo::changeset_repo::ChangesetRepo;
use crate::repo::resource_repo::ResourceRepo;
use crate::repo::source_repo::SourceRepo;
use crate::repo::RepoError;
use log::{error, info, warn};
use self::patch::{apply_patch, diff, PatchOp};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type UpdateResult<T> = Result<T, UpdateError>;

/// Errors from changeset validation and application.
#[derive(Debug)]
pub enum UpdateError {
    /// Aggregated per-operation failures; the whole batch was rolled back.
    Multiple(Vec<UpdateError>),
    /// Patched source data failed the source type's schema.
    SchemaValidation { href: String, message: String },
    /// Operation references a resource that does not exist.
    SourceDataWithoutResource { href: String },
    /// Stored resource row has a type the registry does not know.
    NoSuchResourceType { name: String },
    /// Operation references an unknown source type.
    NoSuchSourceType { name: String },
    /// Operation requires an existing source row.
    NoSuchSource { href: String },
    /// The source type may not contribute to the resource's type.
    IncompatibleSourceType {
        resource_type: String,
        source_type: String,
    },
    /// PATCH on a tombstoned source.
    CantPatchDeletedSource { href: String },
    /// The patch was rejected: hook refusal, application failure, or a
    /// filter-commutativity violation.
    PatchUnacceptable { href: String, message: String },
    /// Source data must be a JSON object.
    SourceDataNotObject { href: String },
    /// Operation target cannot be parsed or resolved.
    MalformedHref(HrefError),
    /// MOVE is declared but has no defined semantics yet.
    MoveNotSupported { href: String },
    /// Permission predicate refused an authenticated user.
    Forbidden {
        user: String,
        action: PermAction,
        object: String,
    },
    /// Permission predicate refused an unauthenticated user.
    Unauthorized { action: PermAction, object: String },
    /// Stored changeset version differs from the in-memory one.
    ChangesetConflict {
        id: String,
        expected: i64,
        actual: i64,
    },
    /// The changeset already performed successfully.
    AlreadyPerformed { id: String },
    Regen(RegenError),
    Repo(RepoError),
}

impl Display for UpdateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Multiple(errors) => {
                write!(f, "{} operation error(s): ", errors.len())?;
                for (index, err) in errors.iter().enumerate() {
                    if index > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
            Self::SchemaValidation { href, message } => {
                write!(f, "schema validation failed for `{href}`: {message}")
            }
            Self::SourceDataWithoutResource { href } => {
                write!(f, "no resource exists at `{href}`")
            }
            Self::NoSuchResourceType { name } => write!(f, "unknown resource type `{name}`"),
            Self::NoSuchSourceType { name } => write!(f, "unknown source type `{name}`"),
            Self::NoSuchSource { href } => write!(f, "no source exists at `{href}`"),
            Self::IncompatibleSourceType {
                resource_type,
                source_type,
            } => write!(
                f,
                "source type `{source_type}` cannot contribute to resource type `{resource_type}`"
            ),
            Self::CantPatchDeletedSource { href } => {
                write!(f, "cannot patch deleted source `{href}`")
            }
            Self::PatchUnacceptable { href, message } => {
                write!(f, "patch unacceptable for `{href}`: {message}")
            }
            Self::SourceDataNotObject { href } => {
                write!(f, "source data for `{href}` must be a JSON object")
            }
            Self::MalformedHref(err) => write!(f, "{err}"),
            Self::MoveNotSupported { href } => {
                write!(f, "MOVE is not supported (source `{href}`)")
            }
            Self::Forbidden {
                user,
                action,
                object,
            } => write!(
                f,
                "user `{user}` lacks `{}` on `{object}`",
                action.as_str()
            ),
            Self::Unauthorized { action, object } => {
                write!(f, "authentication required for `{}` on `{object}`", action.as_str())
            }
            Self::ChangesetConflict {
                id,
                expected,
                actual,
            } => write!(
                f,
                "changeset `{id}` was modified concurrently (expected version {expected}, found {actual})"
            ),
            Self::AlreadyPerformed { id } => {
                write!(f, "changeset `{id}` has already been performed")
            }
            Self::Regen(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for UpdateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MalformedHref(err) => Some(err),
            Self::Regen(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HrefError> for UpdateError {
    fn from(value: HrefError) -> Self {
        Self::MalformedHref(value)
    }
}

impl From<RegenError> for UpdateError {
    fn from(value: RegenError) -> Self {
        Self::Regen(value)
    }
}

impl From<RepoError> for UpdateError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for UpdateError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}

/// Result of one applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// Source row came into existence (or was resurrected).
    Created,
    /// Existing source data changed.
    Modified,
    /// Operation applied but left the row as it was.
    Unchanged,
    /// Source was tombstoned.
    Deleted,
}

/// Outcome of one performed changeset.
#[derive(Debug, Clone, Default)]
pub struct PerformReport {
    /// One entry per operation; `None` for no-ops.
    pub outcomes: Vec<Option<OpOutcome>>,
    /// Distinct owning resources that were saved (and cascaded).
    pub affected_resources: Vec<String>,
}

/// Applies changesets against the store.
pub struct ChangesetEngine<'conn> {
    conn: &'conn Connection,
    registry: Arc<TypeRegistry>,
    gate: Arc<dyn PermissionGate>,
    sink: Arc<dyn ChangeSink>,
}

struct ResolvedTarget {
    source_href: String,
    resource: Resource,
    source_type: String,
}

struct WorkingSource {
    source: Source,
    /// Row existed before this changeset.
    existed: bool,
    mutated: bool,
    created: bool,
}

impl WorkingSource {
    /// A source is live when it currently carries data: either it
    /// pre-existed non-deleted, or an earlier operation in this batch
    /// staged it.
    fn is_live(&self) -> bool {
        !self.source.deleted && (self.existed || self.mutated)
    }
}

impl<'conn> ChangesetEngine<'conn> {
    pub fn new(
        conn: &'conn Connection,
        registry: Arc<TypeRegistry>,
        gate: Arc<dyn PermissionGate>,
        sink: Arc<dyn ChangeSink>,
    ) -> Self {
        Self {
            conn,
            registry,
            gate,
            sink,
        }
    }

    /// Validates and applies `changeset`, all-or-nothing.
    ///
    /// On success the changeset is marked performed and persisted before the
    /// transaction commits; notifications go out afterwards. On failure
    /// everything rolls back and the failed state is recorded in a separate
    /// write.
    pub fn perform(&self, changeset: &mut Changeset) -> UpdateResult<PerformReport> {
        if changeset.state == ChangesetState::Performed {
            return Err(UpdateError::AlreadyPerformed {
                id: changeset.id.clone(),
            });
        }
        if changeset.version > 0 {
            if let Some(actual) = ChangesetRepo::new(self.conn).stored_version(&changeset.id)? {
                if actual != changeset.version {
                    return Err(UpdateError::ChangesetConflict {
                        id: changeset.id.clone(),
                        expected: changeset.version,
                        actual,
                    });
                }
            }
        }

        info!(
            "event=changeset_perform module=update status=start id={} operations={}",
            changeset.id,
            changeset.operations.len()
        );
        match self.perform_inner(changeset) {
            Ok((report, events)) => {
                info!(
                    "event=changeset_perform module=update status=ok id={} affected={}",
                    changeset.id,
                    report.affected_resources.len()
                );
                for event in &events {
                    self.sink.notify(event);
                }
                Ok(report)
            }
            Err(err) => {
                warn!(
                    "event=changeset_perform module=update status=error id={} error={err}",
                    changeset.id
                );
                self.mark_failed(changeset);
                Err(err)
            }
        }
    }

    fn perform_inner(
        &self,
        changeset: &mut Changeset,
    ) -> UpdateResult<(PerformReport, Vec<ChangeEvent>)> {
        // The immediate transaction takes the store's write lock up front,
        // serializing concurrent changesets that touch overlapping sources.
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;

        let mut errors: Vec<UpdateError> = Vec::new();
        let mut resolved: Vec<Option<ResolvedTarget>> = Vec::new();
        for operation in &changeset.operations {
            match self.resolve_target(operation.target(), &changeset.base_href) {
                Ok(target) => resolved.push(Some(target)),
                Err(err) => {
                    errors.push(err);
                    resolved.push(None);
                }
            }
        }

        let mut working: BTreeMap<String, WorkingSource> = BTreeMap::new();
        let mut outcomes: Vec<Option<OpOutcome>> = Vec::new();
        for (operation, target) in changeset.operations.iter().zip(&resolved) {
            let Some(target) = target else {
                outcomes.push(None);
                continue;
            };
            match self.apply_operation(operation, target, &mut working, changeset) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    errors.push(err);
                    outcomes.push(None);
                }
            }
        }

        if !errors.is_empty() {
            // Dropping `tx` rolls back every staged change.
            return Err(UpdateError::Multiple(errors));
        }

        let source_repo = SourceRepo::new(self.conn);
        let mut affected: BTreeSet<String> = BTreeSet::new();
        let mut events: Vec<ChangeEvent> = Vec::new();
        for working_source in working.values_mut() {
            if !working_source.mutated {
                continue;
            }
            working_source.source.version += 1;
            source_repo.upsert(&working_source.source)?;
            affected.insert(working_source.source.resource_href.clone());
            events.push(ChangeEvent::SourceSaved {
                href: working_source.source.href.clone(),
                version: working_source.source.version,
                created: working_source.created,
            });
        }

        let regen = RegenEngine::new(self.conn, Arc::clone(&self.registry));
        for resource_href in &affected {
            let report = regen.save(resource_href)?;
            events.extend(report.events);
        }

        changeset.state = ChangesetState::Performed;
        changeset.version += 1;
        ChangesetRepo::new(self.conn).upsert(changeset)?;
        tx.commit()?;

        Ok((
            PerformReport {
                outcomes,
                affected_resources: affected.into_iter().collect(),
            },
            events,
        ))
    }

    /// Records the failed state outside the rolled-back transaction.
    fn mark_failed(&self, changeset: &mut Changeset) {
        changeset.state = ChangesetState::Failed;
        changeset.version += 1;
        if let Err(err) = ChangesetRepo::new(self.conn).upsert(changeset) {
            error!(
                "event=changeset_mark_failed module=update status=error id={} error={err}",
                changeset.id
            );
        }
    }

    fn resolve_target(
        &self,
        target: &OperationTarget,
        base_href: &str,
    ) -> UpdateResult<ResolvedTarget> {
        let (resource_href, source_type) = match target {
            OperationTarget::Href { href: raw } => {
                let absolute = href::resolve(base_href, raw)?;
                href::parse_source_href(&absolute)?
            }
            OperationTarget::Pair {
                resource_href,
                source_type,
            } => {
                let absolute = href::resolve(base_href, resource_href)?;
                if !href::is_resource_href(&absolute) {
                    return Err(HrefError::Malformed(absolute).into());
                }
                (absolute, source_type.clone())
            }
        };

        if self.registry.source_type(&source_type).is_none() {
            return Err(UpdateError::NoSuchSourceType { name: source_type });
        }
        let resource = ResourceRepo::new(self.conn)
            .get(&resource_href)?
            .ok_or(UpdateError::SourceDataWithoutResource {
                href: resource_href.clone(),
            })?;
        let resource_type = self
            .registry
            .resource_type(&resource.kind)
            .ok_or_else(|| UpdateError::NoSuchResourceType {
                name: resource.kind.clone(),
            })?;
        if !resource_type.allows_source_type(&source_type) {
            return Err(UpdateError::IncompatibleSourceType {
                resource_type: resource.kind.clone(),
                source_type,
            });
        }

        Ok(ResolvedTarget {
            source_href: href::source_href(&resource_href, &source_type),
            resource,
            source_type,
        })
    }

    fn apply_operation(
        &self,
        operation: &UpdateOperation,
        target: &ResolvedTarget,
        working: &mut BTreeMap<String, WorkingSource>,
        changeset: &Changeset,
    ) -> UpdateResult<Option<OpOutcome>> {
        match operation {
            UpdateOperation::Put { data: None, .. } => self.apply_delete(target, working, changeset),
            UpdateOperation::Put {
                data: Some(data), ..
            } => self.apply_put(target, data, working, changeset),
            UpdateOperation::Patch {
                patch,
                create_empty_if_missing,
                ..
            } => self.apply_patch_op(
                target,
                patch,
                *create_empty_if_missing,
                false,
                working,
                changeset,
            ),
            UpdateOperation::Delete { .. } => self.apply_delete(target, working, changeset),
            UpdateOperation::Move { .. } => Err(UpdateError::MoveNotSupported {
                href: target.source_href.clone(),
            }),
        }
    }

    /// PUT computes a patch from the committer-filtered current data to the
    /// supplied document and delegates to PATCH, so a committer can never
    /// overwrite data the filter hides from them.
    fn apply_put(
        &self,
        target: &ResolvedTarget,
        data: &Value,
        working: &mut BTreeMap<String, WorkingSource>,
        changeset: &Changeset,
    ) -> UpdateResult<Option<OpOutcome>> {
        if !data.is_object() {
            return Err(UpdateError::SourceDataNotObject {
                href: target.source_href.clone(),
            });
        }
        let source_type = self.source_type_def(&target.source_type);
        let current = {
            let working_source = self.working_entry(working, target, changeset)?;
            current_data(working_source)
        };
        let filtered = source_type.filter_for(&changeset.committer, &current);
        let patch = diff(&filtered, data);
        self.apply_patch_op(target, &patch, true, true, working, changeset)
    }

    fn apply_patch_op(
        &self,
        target: &ResolvedTarget,
        patch: &[PatchOp],
        create_if_missing: bool,
        allow_revive: bool,
        working: &mut BTreeMap<String, WorkingSource>,
        changeset: &Changeset,
    ) -> UpdateResult<Option<OpOutcome>> {
        let source_type = self.source_type_def(&target.source_type);
        let row_known = self.source_row_exists(working, &target.source_href)?;
        if patch.is_empty() && row_known && !create_if_missing {
            return Ok(None);
        }
        if !row_known && !create_if_missing {
            if patch.is_empty() {
                return Ok(None);
            }
            return Err(UpdateError::NoSuchSource {
                href: target.source_href.clone(),
            });
        }

        self.check_perm(
            &changeset.committer,
            PermAction::ChangeSource,
            &target.source_href,
        )?;

        let working_source = self.working_entry(working, target, changeset)?;
        let absent_or_dead = !working_source.is_live();
        if working_source.source.deleted && !allow_revive {
            return Err(UpdateError::CantPatchDeletedSource {
                href: target.source_href.clone(),
            });
        }
        if patch.is_empty() && !absent_or_dead {
            return Ok(None);
        }

        if let Some(acceptable) = &source_type.patch_acceptable {
            if !acceptable(patch) {
                return Err(UpdateError::PatchUnacceptable {
                    href: target.source_href.clone(),
                    message: "rejected by source type".to_string(),
                });
            }
        }

        let current = current_data(working_source);
        let patched =
            apply_patch(&current, patch).map_err(|err| UpdateError::PatchUnacceptable {
                href: target.source_href.clone(),
                message: err.to_string(),
            })?;

        // Filter-commutativity: applying then filtering must equal filtering
        // then applying. Divergence means the patch reaches into data the
        // filter hides from this committer.
        if let Some(filter) = &source_type.data_filter {
            let filtered_then_patched = apply_patch(&filter(&changeset.committer, &current), patch)
                .map_err(|_| UpdateError::PatchUnacceptable {
                    href: target.source_href.clone(),
                    message: "patch addresses filtered data".to_string(),
                })?;
            if filter(&changeset.committer, &patched) != filtered_then_patched {
                return Err(UpdateError::PatchUnacceptable {
                    href: target.source_href.clone(),
                    message: "patch does not commute with the data filter".to_string(),
                });
            }
        }

        if !patched.is_object() {
            return Err(UpdateError::SourceDataNotObject {
                href: target.source_href.clone(),
            });
        }
        if let Some(schema) = &source_type.schema {
            schema(&patched).map_err(|message| UpdateError::SchemaValidation {
                href: target.source_href.clone(),
                message,
            })?;
        }

        if !absent_or_dead && working_source.source.data.as_ref() == Some(&patched) {
            return Ok(Some(OpOutcome::Unchanged));
        }

        working_source.source.data = Some(patched);
        working_source.source.deleted = false;
        working_source.source.committer = changeset.committer.clone();
        working_source.mutated = true;
        working_source.created |= absent_or_dead;
        Ok(Some(if absent_or_dead {
            OpOutcome::Created
        } else {
            OpOutcome::Modified
        }))
    }

    fn apply_delete(
        &self,
        target: &ResolvedTarget,
        working: &mut BTreeMap<String, WorkingSource>,
        changeset: &Changeset,
    ) -> UpdateResult<Option<OpOutcome>> {
        if !self.source_row_exists(working, &target.source_href)? {
            return Err(UpdateError::NoSuchSource {
                href: target.source_href.clone(),
            });
        }
        self.check_perm(
            &changeset.committer,
            PermAction::DeleteSource,
            &target.source_href,
        )?;

        let working_source = self.working_entry(working, target, changeset)?;
        if working_source.source.deleted {
            return Ok(None);
        }
        working_source.source.tombstone();
        working_source.source.committer = changeset.committer.clone();
        working_source.mutated = true;
        Ok(Some(OpOutcome::Deleted))
    }

    /// Returns whether a source row exists from this batch's point of view:
    /// the staged working copy wins over the stored row.
    fn source_row_exists(
        &self,
        working: &BTreeMap<String, WorkingSource>,
        source_href: &str,
    ) -> UpdateResult<bool> {
        if let Some(working_source) = working.get(source_href) {
            return Ok(working_source.existed || working_source.mutated);
        }
        Ok(SourceRepo::new(self.conn).get(source_href)?.is_some())
    }

    /// Loads (or stubs) the working copy of one targeted source.
    fn working_entry<'w>(
        &self,
        working: &'w mut BTreeMap<String, WorkingSource>,
        target: &ResolvedTarget,
        changeset: &Changeset,
    ) -> UpdateResult<&'w mut WorkingSource> {
        match working.entry(target.source_href.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let entry = match SourceRepo::new(self.conn).get(&target.source_href)? {
                    Some(source) => WorkingSource {
                        source,
                        existed: true,
                        mutated: false,
                        created: false,
                    },
                    None => WorkingSource {
                        source: Source::new(
                            target.resource.href.clone(),
                            target.source_type.clone(),
                            changeset.author.clone(),
                            changeset.committer.clone(),
                        ),
                        existed: false,
                        mutated: false,
                        created: false,
                    },
                };
                Ok(slot.insert(entry))
            }
        }
    }

    fn source_type_def(&self, name: &str) -> SourceTypeDef {
        self.registry
            .source_type(name)
            .cloned()
            .unwrap_or_else(|| SourceTypeDef::new(name))
    }

    fn check_perm(&self, user: &str, action: PermAction, object: &str) -> UpdateResult<()> {
        if self.gate.has_perm(user, action, object) {
            return Ok(());
        }
        if user.is_empty() {
            return Err(UpdateError::Unauthorized {
                action,
                object: object.to_string(),
            });
        }
        Err(UpdateError::Forbidden {
            user: user.to_string(),
            action,
            object: object.to_string(),
        })
    }
}

fn current_data(working_source: &WorkingSource) -> Value {
    if working_source.is_live() {
        working_source
            .source
            .data
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()))
    } else {
        Value::Object(Map::new())
    }
}
