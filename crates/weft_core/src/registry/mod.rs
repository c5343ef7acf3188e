//! Immutable catalog of resource, source and link type definitions.
//!
//! # Responsibility
//! - Hold the process-wide type records driving inference, normalization,
//!   validation and permission checks.
//! - Validate cross-references once, at build time.
//!
//! # Invariants
//! - The registry is immutable after `build()`; it is shared by reference
//!   (`Arc`), never through ambient global lookup.
//! - `inverse_of` is a pure derivation over link records, not generated
//!   types.

use crate::pipeline::InferenceStep;
use crate::update::patch::PatchOp;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Schema predicate for one source type's raw data.
pub type SchemaCheck = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;
/// Acceptance predicate over a raw patch before it is applied.
pub type PatchCheck = Arc<dyn Fn(&[PatchOp]) -> bool + Send + Sync>;
/// Viewer-specific redaction of one source's data.
pub type DataFilter = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

/// Errors from registry construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName { kind: &'static str, name: String },
    UnknownSourceType { resource_type: String, source_type: String },
    InverseCollision { name: String },
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName { kind, name } => {
                write!(f, "duplicate {kind} type name: `{name}`")
            }
            Self::UnknownSourceType {
                resource_type,
                source_type,
            } => write!(
                f,
                "resource type `{resource_type}` references unknown source type `{source_type}`"
            ),
            Self::InverseCollision { name } => {
                write!(f, "link type `{name}` collides with its own inverse name")
            }
        }
    }
}

impl Error for RegistryError {}

/// Link type record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTypeDef {
    pub name: String,
    /// Field name under which inverted links surface on the target.
    pub inverse_name: String,
    /// At most one outbound link of this type per resource.
    pub functional: bool,
    /// Target documents are embedded by the rendering layer.
    pub embed: bool,
    /// Targets live underneath the source resource's href space.
    pub subresource: bool,
}

impl LinkTypeDef {
    pub fn new(name: impl Into<String>, inverse_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inverse_name: inverse_name.into(),
            functional: false,
            embed: false,
            subresource: false,
        }
    }
}

/// Source type record with validation and redaction hooks.
#[derive(Clone)]
pub struct SourceTypeDef {
    pub name: String,
    pub schema: Option<SchemaCheck>,
    pub patch_acceptable: Option<PatchCheck>,
    pub data_filter: Option<DataFilter>,
}

impl SourceTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            patch_acceptable: None,
            data_filter: None,
        }
    }

    pub fn with_schema(mut self, schema: SchemaCheck) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_patch_acceptable(mut self, check: PatchCheck) -> Self {
        self.patch_acceptable = Some(check);
        self
    }

    pub fn with_data_filter(mut self, filter: DataFilter) -> Self {
        self.data_filter = Some(filter);
        self
    }

    /// Applies the viewer-specific filter, identity when none is declared.
    pub fn filter_for(&self, viewer: &str, data: &Value) -> Value {
        match &self.data_filter {
            Some(filter) => filter(viewer, data),
            None => data.clone(),
        }
    }
}

impl Debug for SourceTypeDef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceTypeDef")
            .field("name", &self.name)
            .field("schema", &self.schema.is_some())
            .field("patch_acceptable", &self.patch_acceptable.is_some())
            .field("data_filter", &self.data_filter.is_some())
            .finish()
    }
}

/// Resource type record: allowed sources, ordered inference, addressing.
#[derive(Clone)]
pub struct ResourceTypeDef {
    pub name: String,
    /// Source types that may contribute to this resource type.
    pub source_types: Vec<String>,
    /// Ordered derivation pipeline; order is part of the definition.
    pub inference: Vec<InferenceStep>,
    /// Clients may supply the identifier at creation.
    pub allow_client_identifier: bool,
    /// Clients may override the derived `@id`.
    pub allow_client_id_override: bool,
    /// `{identifier}` templates tried in order when deriving `@id`.
    pub uri_templates: Vec<String>,
}

impl ResourceTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_types: Vec::new(),
            inference: Vec::new(),
            allow_client_identifier: false,
            allow_client_id_override: false,
            uri_templates: Vec::new(),
        }
    }

    pub fn with_source_types(
        mut self,
        source_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.source_types = source_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inference(mut self, inference: Vec<InferenceStep>) -> Self {
        self.inference = inference;
        self
    }

    pub fn with_client_identifier(mut self) -> Self {
        self.allow_client_identifier = true;
        self
    }

    pub fn with_client_id_override(mut self) -> Self {
        self.allow_client_id_override = true;
        self
    }

    pub fn with_uri_templates(
        mut self,
        templates: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.uri_templates = templates.into_iter().map(Into::into).collect();
        self
    }

    pub fn allows_source_type(&self, source_type: &str) -> bool {
        self.source_types.iter().any(|name| name == source_type)
    }
}

impl Debug for ResourceTypeDef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTypeDef")
            .field("name", &self.name)
            .field("source_types", &self.source_types)
            .field("inference_steps", &self.inference.len())
            .field("allow_client_identifier", &self.allow_client_identifier)
            .field("allow_client_id_override", &self.allow_client_id_override)
            .field("uri_templates", &self.uri_templates)
            .finish()
    }
}

/// Builder for [`TypeRegistry`].
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    resource_types: Vec<ResourceTypeDef>,
    source_types: Vec<SourceTypeDef>,
    link_types: Vec<LinkTypeDef>,
}

impl TypeRegistryBuilder {
    pub fn resource_type(mut self, def: ResourceTypeDef) -> Self {
        self.resource_types.push(def);
        self
    }

    pub fn source_type(mut self, def: SourceTypeDef) -> Self {
        self.source_types.push(def);
        self
    }

    pub fn link_type(mut self, def: LinkTypeDef) -> Self {
        self.link_types.push(def);
        self
    }

    /// Validates cross-references and freezes the registry.
    pub fn build(self) -> Result<TypeRegistry, RegistryError> {
        let mut source_types = BTreeMap::new();
        for def in self.source_types {
            if source_types.contains_key(&def.name) {
                return Err(RegistryError::DuplicateName {
                    kind: "source",
                    name: def.name,
                });
            }
            source_types.insert(def.name.clone(), def);
        }

        let mut link_types = BTreeMap::new();
        for def in self.link_types {
            if def.name == def.inverse_name {
                return Err(RegistryError::InverseCollision { name: def.name });
            }
            if link_types.contains_key(&def.name) {
                return Err(RegistryError::DuplicateName {
                    kind: "link",
                    name: def.name,
                });
            }
            link_types.insert(def.name.clone(), def);
        }

        let mut resource_types = BTreeMap::new();
        for def in self.resource_types {
            for source_type in &def.source_types {
                if !source_types.contains_key(source_type) {
                    return Err(RegistryError::UnknownSourceType {
                        resource_type: def.name.clone(),
                        source_type: source_type.clone(),
                    });
                }
            }
            if resource_types.contains_key(&def.name) {
                return Err(RegistryError::DuplicateName {
                    kind: "resource",
                    name: def.name,
                });
            }
            resource_types.insert(def.name.clone(), def);
        }

        Ok(TypeRegistry {
            resource_types,
            source_types,
            link_types,
        })
    }
}

/// Immutable, process-wide type catalog.
#[derive(Debug)]
pub struct TypeRegistry {
    resource_types: BTreeMap<String, ResourceTypeDef>,
    source_types: BTreeMap<String, SourceTypeDef>,
    link_types: BTreeMap<String, LinkTypeDef>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn resource_type(&self, name: &str) -> Option<&ResourceTypeDef> {
        self.resource_types.get(name)
    }

    pub fn source_type(&self, name: &str) -> Option<&SourceTypeDef> {
        self.source_types.get(name)
    }

    pub fn link_type(&self, name: &str) -> Option<&LinkTypeDef> {
        self.link_types.get(name)
    }

    /// Sorted link type names; used to recognize link fields in documents.
    pub fn link_type_names(&self) -> impl Iterator<Item = &str> {
        self.link_types.keys().map(String::as_str)
    }

    /// Inverse field name for a link type, if one is declared.
    pub fn inverse_of(&self, name: &str) -> Option<&str> {
        self.link_types
            .get(name)
            .map(|def| def.inverse_name.as_str())
    }
}
