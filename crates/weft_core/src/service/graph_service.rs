//! Graph use-case service.
//!
//! # Responsibility
//! - Expose the core operations: resource creation, retrieval, changeset
//!   perform, identifier lookup.
//! - Own the transaction around resource creation and hand committed events
//!   to the change sink.
//!
//! # Invariants
//! - A resource row is created exactly once per `(type, identifier)`;
//!   collisions surface as conflicts, never silent overwrites.
//! - Sink failures never roll anything back; notification happens after
//!   commit only.

use crate::model::changeset::{Changeset, UpdateOperation};
use crate::model::resource::Resource;
use crate::notify::{ChangeEvent, ChangeSink};
use crate::perm::{PermAction, PermissionGate};
use crate::pipeline::normalize::{date_field_ms, extract_point, outbound_links};
use crate::regen::{RegenEngine, RegenError};
use crate::registry::TypeRegistry;
use crate::repo::identifier_repo::{IdentifierRepo, IdentifierRepoError};
use crate::repo::link_repo::LinkRepo;
use crate::repo::resource_repo::ResourceRepo;
use crate::repo::RepoError;
use crate::update::{ChangesetEngine, PerformReport, UpdateError};
use log::info;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors from the external interface operations.
#[derive(Debug)]
pub enum ServiceError {
    NoSuchResourceType { name: String },
    Forbidden {
        user: String,
        action: PermAction,
        object: String,
    },
    /// The type does not allow client-assigned identifiers, or the creator
    /// lacks the assignment permission.
    CannotAssignIdentifier { resource_type: String },
    ResourceAlreadyExists { href: String },
    NotFound { href: String },
    Update(UpdateError),
    Regen(RegenError),
    Identifier(IdentifierRepoError),
    Repo(RepoError),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchResourceType { name } => write!(f, "unknown resource type `{name}`"),
            Self::Forbidden {
                user,
                action,
                object,
            } => write!(f, "user `{user}` lacks `{}` on `{object}`", action.as_str()),
            Self::CannotAssignIdentifier { resource_type } => write!(
                f,
                "identifiers of resource type `{resource_type}` cannot be client-assigned"
            ),
            Self::ResourceAlreadyExists { href } => {
                write!(f, "resource already exists: {href}")
            }
            Self::NotFound { href } => write!(f, "resource not found: {href}"),
            Self::Update(err) => write!(f, "{err}"),
            Self::Regen(err) => write!(f, "{err}"),
            Self::Identifier(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Update(err) => Some(err),
            Self::Regen(err) => Some(err),
            Self::Identifier(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<UpdateError> for ServiceError {
    fn from(value: UpdateError) -> Self {
        Self::Update(value)
    }
}

impl From<RegenError> for ServiceError {
    fn from(value: RegenError) -> Self {
        Self::Regen(value)
    }
}

impl From<IdentifierRepoError> for ServiceError {
    fn from(value: IdentifierRepoError) -> Self {
        Self::Identifier(value)
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}

/// External interface over the consistency core.
pub struct GraphService<'conn> {
    conn: &'conn Connection,
    registry: Arc<TypeRegistry>,
    gate: Arc<dyn PermissionGate>,
    sink: Arc<dyn ChangeSink>,
}

impl<'conn> GraphService<'conn> {
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

    /// Creates a resource row and derives its initial (sourceless) document.
    ///
    /// The version stays at 0; the first source edit bumps it to 1.
    pub fn create_resource(
        &self,
        creator: &str,
        resource_type: &str,
        identifier: Option<&str>,
    ) -> ServiceResult<Resource> {
        let type_def = self.registry.resource_type(resource_type).ok_or_else(|| {
            ServiceError::NoSuchResourceType {
                name: resource_type.to_string(),
            }
        })?;
        if !self
            .gate
            .has_perm(creator, PermAction::CreateResource, resource_type)
        {
            return Err(ServiceError::Forbidden {
                user: creator.to_string(),
                action: PermAction::CreateResource,
                object: resource_type.to_string(),
            });
        }

        let identifier = match identifier {
            Some(supplied) => {
                let may_assign = type_def.allow_client_identifier
                    && self
                        .gate
                        .has_perm(creator, PermAction::AssignIdentifier, resource_type);
                if !may_assign {
                    return Err(ServiceError::CannotAssignIdentifier {
                        resource_type: resource_type.to_string(),
                    });
                }
                supplied.to_string()
            }
            None => Uuid::new_v4().simple().to_string(),
        };

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let resources = ResourceRepo::new(self.conn);

        let mut resource = Resource::new(resource_type, &identifier);
        if resources.get(&resource.href)?.is_some() {
            return Err(ServiceError::ResourceAlreadyExists {
                href: resource.href.clone(),
            });
        }

        let regen = RegenEngine::new(self.conn, Arc::clone(&self.registry));
        let initial = regen.regenerate(&resource, &[])?;
        resource.data = initial.document;
        resource.start_date = date_field_ms(&resource.data, "startDate");
        resource.end_date = date_field_ms(&resource.data, "endDate");
        resource.extant =
            Resource::extant_at(resource.start_date, resource.end_date, Resource::now_ms());
        resource.point = extract_point(&resource.data);
        resource.uri = resource
            .data
            .get("@id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        resources.insert(&resource)?;
        LinkRepo::new(self.conn)
            .replace_links(&resource.href, &outbound_links(&resource.data, &self.registry))?;
        IdentifierRepo::new(self.conn)
            .replace_identifiers(&resource.href, &initial_identifier_entries(&resource))?;
        tx.commit()?;

        info!(
            "event=resource_create module=service status=ok href={} creator={creator}",
            resource.href
        );
        self.sink.notify(&ChangeEvent::ResourceSaved {
            href: resource.href.clone(),
            version: resource.version,
        });
        Ok(resource)
    }

    /// Loads one resource by href.
    pub fn get_resource(&self, href: &str) -> ServiceResult<Resource> {
        ResourceRepo::new(self.conn)
            .get(href)?
            .ok_or_else(|| ServiceError::NotFound {
                href: href.to_string(),
            })
    }

    /// Builds and performs a changeset over the given operations.
    pub fn perform_changeset(
        &self,
        base_href: &str,
        author: &str,
        committer: Option<&str>,
        operations: Vec<UpdateOperation>,
    ) -> ServiceResult<(Changeset, PerformReport)> {
        let mut changeset = Changeset::new(
            base_href,
            author,
            committer.map(str::to_string),
            operations,
        );
        let engine = ChangesetEngine::new(
            self.conn,
            Arc::clone(&self.registry),
            Arc::clone(&self.gate),
            Arc::clone(&self.sink),
        );
        let report = engine.perform(&mut changeset)?;
        Ok((changeset, report))
    }

    /// Maps each requested identifier value to its resource, `None` when
    /// unclaimed.
    pub fn lookup_by_identifier(
        &self,
        scheme: &str,
        values: &[&str],
    ) -> ServiceResult<BTreeMap<String, Option<Resource>>> {
        let owners = IdentifierRepo::new(self.conn).lookup(scheme, values)?;
        let resources = ResourceRepo::new(self.conn);
        let mut result = BTreeMap::new();
        for (value, owner) in owners {
            let resource = match owner {
                Some(owner_href) => resources.get(&owner_href)?,
                None => None,
            };
            result.insert(value, resource);
        }
        Ok(result)
    }

    /// Returns every claimed value of one scheme with its resource.
    pub fn lookup_scheme(&self, scheme: &str) -> ServiceResult<BTreeMap<String, Resource>> {
        let owners = IdentifierRepo::new(self.conn).lookup_scheme(scheme)?;
        let resources = ResourceRepo::new(self.conn);
        let mut result = BTreeMap::new();
        for (value, owner_href) in owners {
            if let Some(resource) = resources.get(&owner_href)? {
                result.insert(value, resource);
            }
        }
        Ok(result)
    }
}

/// Identifier rows for a freshly created, sourceless resource.
fn initial_identifier_entries(resource: &Resource) -> Vec<(String, String)> {
    if resource.extant {
        vec![(resource.kind.clone(), resource.identifier.clone())]
    } else {
        Vec::new()
    }
}

/// Renders a resource the way the boundary layer serves it: the derived
/// document plus a `_meta` block of denormalized state.
pub fn external_document(resource: &Resource) -> Value {
    let mut doc = resource.data.clone();
    if let Value::Object(map) = &mut doc {
        map.insert(
            "_meta".to_string(),
            serde_json::json!({
                "version": resource.version,
                "deleted": resource.deleted,
                "extant": resource.extant,
            }),
        );
    }
    doc
}
