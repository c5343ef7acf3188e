//! Canonical-form normalization of derived documents.
//!
//! # Responsibility
//! - Reshape link fields into `{href, ...}` object lists with resolved hrefs.
//! - Inject inbound links by inverting stored link rows.
//! - Canonicalize date fields and finalize the external document shape.
//!
//! # Invariants
//! - Normalization passes run in fixed order: links, inbound, sort, dates,
//!   finalize.
//! - Every link list is sorted by `href` and href-deduplicated.
//! - The `@source` namespace never leaves the pipeline.

use crate::model::document::{Document, DocumentPathError};
use crate::model::href;
use crate::model::resource::Resource;
use crate::registry::{ResourceTypeDef, TypeRegistry};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::warn;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// A stored link row targeting the resource being normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundLink {
    /// Href of the resource the link originates from.
    pub source_href: String,
    /// Forward link type name.
    pub link_type: String,
}

/// Errors from normalization passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    Document(DocumentPathError),
}

impl Display for NormalizeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Document(err) => write!(f, "{err}"),
        }
    }
}

impl Error for NormalizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Document(err) => Some(err),
        }
    }
}

impl From<DocumentPathError> for NormalizeError {
    fn from(value: DocumentPathError) -> Self {
        Self::Document(value)
    }
}

/// Runs every normalization pass and finalizes the external shape.
pub fn normalize(
    doc: &mut Document,
    registry: &TypeRegistry,
    resource_type: &ResourceTypeDef,
    resource: &Resource,
    inbound: &[InboundLink],
) -> Result<(), NormalizeError> {
    normalize_link_fields(doc, registry, &resource.href)?;
    inject_inbound_links(doc, registry, inbound)?;
    sort_link_lists(doc, registry)?;
    normalize_date_fields(doc)?;
    finalize(doc, resource_type, resource)?;
    Ok(())
}

/// Reshapes every declared link field into a list of `{href, ...}` objects,
/// resolving relative hrefs against the resource href.
pub fn normalize_link_fields(
    doc: &mut Document,
    registry: &TypeRegistry,
    base_href: &str,
) -> Result<(), NormalizeError> {
    let link_names: Vec<String> = registry.link_type_names().map(str::to_string).collect();
    for name in link_names {
        let Some(raw) = doc.get(&name).cloned() else {
            continue;
        };
        let entries = match raw {
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut normalized = Vec::with_capacity(entries.len());
        for entry in entries {
            match link_entry(entry, base_href) {
                Some(link) => normalized.push(link),
                None => warn!(
                    "event=link_normalize module=pipeline status=dropped field={name} base={base_href}"
                ),
            }
        }
        doc.set(&name, Value::Array(normalized))?;
    }
    Ok(())
}

fn link_entry(entry: Value, base_href: &str) -> Option<Value> {
    match entry {
        Value::String(target) => {
            let resolved = href::resolve(base_href, &target).ok()?;
            let mut map = Map::new();
            map.insert("href".to_string(), Value::String(resolved));
            Some(Value::Object(map))
        }
        Value::Object(mut map) => {
            let target = map.get("href")?.as_str()?.to_string();
            let resolved = href::resolve(base_href, &target).ok()?;
            map.insert("href".to_string(), Value::String(resolved));
            Some(Value::Object(map))
        }
        _ => None,
    }
}

/// Surfaces stored links targeting this resource under their inverse names.
pub fn inject_inbound_links(
    doc: &mut Document,
    registry: &TypeRegistry,
    inbound: &[InboundLink],
) -> Result<(), NormalizeError> {
    for link in inbound {
        let Some(inverse) = registry.inverse_of(&link.link_type) else {
            continue;
        };
        let mut entries = match doc.get(inverse).cloned() {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        };
        let mut map = Map::new();
        map.insert(
            "href".to_string(),
            Value::String(link.source_href.clone()),
        );
        map.insert("inbound".to_string(), Value::Bool(true));
        entries.push(Value::Object(map));
        let inverse = inverse.to_string();
        doc.set(&inverse, Value::Array(entries))?;
    }
    Ok(())
}

/// Sorts every link list by href and drops duplicate hrefs (first wins).
pub fn sort_link_lists(doc: &mut Document, registry: &TypeRegistry) -> Result<(), NormalizeError> {
    let mut fields: Vec<String> = registry.link_type_names().map(str::to_string).collect();
    fields.extend(
        registry
            .link_type_names()
            .filter_map(|name| registry.inverse_of(name))
            .map(str::to_string),
    );
    for field in fields {
        let Some(Value::Array(items)) = doc.get(&field).cloned() else {
            continue;
        };
        let mut sorted = items;
        sorted.sort_by(|a, b| entry_href(a).cmp(&entry_href(b)));
        sorted.dedup_by(|a, b| {
            let (left, right) = (entry_href(a), entry_href(b));
            left.is_some() && left == right
        });
        doc.set(&field, Value::Array(sorted))?;
    }
    Ok(())
}

fn entry_href(entry: &Value) -> Option<&str> {
    entry.get("href").and_then(Value::as_str)
}

const DATE_FIELDS: &[&str] = &["date", "startDate", "endDate"];

/// Rewrites root-level date fields into canonical form.
///
/// Plain dates stay `YYYY-MM-DD`; timestamps become UTC RFC 3339 with second
/// precision. Unparseable values are left untouched.
pub fn normalize_date_fields(doc: &mut Document) -> Result<(), NormalizeError> {
    for field in DATE_FIELDS {
        let Some(Value::String(raw)) = doc.get(field) else {
            continue;
        };
        if let Some(canonical) = canonical_date_text(raw) {
            doc.set(field, Value::String(canonical))?;
        }
    }
    Ok(())
}

fn canonical_date_text(raw: &str) -> Option<String> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.format("%Y-%m-%d").to_string());
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(
            instant
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(
            Utc.from_utc_datetime(&naive)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    None
}

/// Parses a canonical date field into epoch ms (start of day for plain
/// dates).
pub fn date_field_ms(doc_value: &Value, field: &str) -> Option<i64> {
    let raw = doc_value.get(field)?.as_str()?;
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&midnight).timestamp_millis());
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.timestamp_millis());
    }
    None
}

/// Extracts the optional spatial point from a document.
pub fn extract_point(doc_value: &Value) -> Option<(f64, f64)> {
    let point = doc_value.get("point")?;
    Some((
        point.get("lat")?.as_f64()?,
        point.get("lon")?.as_f64()?,
    ))
}

/// Strips the `@source` namespace, merges stable identifiers and derives
/// `@id`.
fn finalize(
    doc: &mut Document,
    resource_type: &ResourceTypeDef,
    resource: &Resource,
) -> Result<(), NormalizeError> {
    doc.remove("@source");

    if let Some(Value::Object(stable)) = doc.get("stableIdentifier").cloned() {
        for (scheme, value) in stable {
            doc.set_default(&format!("identifier/{scheme}"), value)?;
        }
    }

    doc.set("href", Value::String(resource.href.clone()))?;
    doc.set("type", Value::String(resource.kind.clone()))?;

    let client_id = doc.get("@id").and_then(Value::as_str).map(str::to_string);
    let keep_client_id = resource_type.allow_client_id_override && client_id.is_some();
    if !keep_client_id {
        doc.set("@id", Value::String(derive_id(resource_type, resource)))?;
    }
    Ok(())
}

fn derive_id(resource_type: &ResourceTypeDef, resource: &Resource) -> String {
    for template in &resource_type.uri_templates {
        let expanded = template.replace("{identifier}", &resource.identifier);
        if !expanded.contains('{') {
            return expanded;
        }
    }
    // Canonical id-redirect URL when no template matches.
    format!("/id{}", resource.href)
}

/// Collects the outbound link set of a stored or working document.
///
/// Inbound entries are excluded; they are someone else's outbound links.
pub fn outbound_links(doc_value: &Value, registry: &TypeRegistry) -> BTreeSet<(String, String)> {
    let mut links = BTreeSet::new();
    for name in registry.link_type_names() {
        let Some(Value::Array(entries)) = doc_value.get(name) else {
            continue;
        };
        for entry in entries {
            if entry.get("inbound").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            if let Some(target) = entry_href(entry) {
                links.insert((target.to_string(), name.to_string()));
            }
        }
    }
    links
}
