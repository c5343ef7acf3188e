//! Resource row persistence.
//!
//! # Responsibility
//! - Provide CRUD over the canonical `resources` table.
//! - Persist the denormalized columns refreshed on regeneration.
//!
//! # Invariants
//! - Resource rows are never deleted; `deleted` is a derived flag.
//! - `data` is only written through `update_regenerated`.

use super::{bool_to_int, parse_bool, RepoError, RepoResult};
use crate::model::resource::Resource;
use rusqlite::{params, Connection, OptionalExtension, Row};

const RESOURCE_SELECT_SQL: &str = "SELECT
    href,
    type,
    identifier,
    data,
    version,
    deleted,
    extant,
    start_date,
    end_date,
    point_lat,
    point_lon,
    uri
FROM resources";

/// SQLite-backed resource repository.
pub struct ResourceRepo<'conn> {
    conn: &'conn Connection,
}

impl<'conn> ResourceRepo<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Loads one resource by href.
    pub fn get(&self, href: &str) -> RepoResult<Option<Resource>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{RESOURCE_SELECT_SQL} WHERE href = ?1;"))?;
        stmt.query_row(params![href], parse_resource_row)
            .optional()?
            .transpose()
    }

    /// Loads one resource by `(type, identifier)`.
    pub fn get_by_identity(
        &self,
        resource_type: &str,
        identifier: &str,
    ) -> RepoResult<Option<Resource>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RESOURCE_SELECT_SQL} WHERE type = ?1 AND identifier = ?2;"
        ))?;
        stmt.query_row(params![resource_type, identifier], parse_resource_row)
            .optional()?
            .transpose()
    }

    /// Inserts a fresh, never-regenerated resource row.
    pub fn insert(&self, resource: &Resource) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO resources (
                href, type, identifier, data, version, deleted, extant,
                start_date, end_date, point_lat, point_lon, uri
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
            params![
                resource.href,
                resource.kind,
                resource.identifier,
                resource.data.to_string(),
                resource.version,
                bool_to_int(resource.deleted),
                bool_to_int(resource.extant),
                resource.start_date,
                resource.end_date,
                resource.point.map(|point| point.0),
                resource.point.map(|point| point.1),
                resource.uri,
            ],
        )?;
        Ok(())
    }

    /// Persists the outcome of one regeneration: document, denormalized
    /// columns and the bumped version.
    pub fn update_regenerated(&self, resource: &Resource) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE resources
             SET
                data = ?1,
                version = ?2,
                deleted = ?3,
                extant = ?4,
                start_date = ?5,
                end_date = ?6,
                point_lat = ?7,
                point_lon = ?8,
                uri = ?9,
                modified_at = (strftime('%s', 'now') * 1000)
             WHERE href = ?10;",
            params![
                resource.data.to_string(),
                resource.version,
                bool_to_int(resource.deleted),
                bool_to_int(resource.extant),
                resource.start_date,
                resource.end_date,
                resource.point.map(|point| point.0),
                resource.point.map(|point| point.1),
                resource.uri,
                resource.href,
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(resource.href.clone()));
        }
        Ok(())
    }
}

fn parse_resource_row(row: &Row<'_>) -> rusqlite::Result<RepoResult<Resource>> {
    Ok(build_resource(row))
}

fn build_resource(row: &Row<'_>) -> RepoResult<Resource> {
    let href: String = row.get("href")?;
    let data_text: String = row.get("data")?;
    let data = serde_json::from_str(&data_text).map_err(|err| {
        RepoError::InvalidData(format!("invalid document JSON for `{href}`: {err}"))
    })?;
    let point = match (
        row.get::<_, Option<f64>>("point_lat")?,
        row.get::<_, Option<f64>>("point_lon")?,
    ) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };
    Ok(Resource {
        kind: row.get("type")?,
        identifier: row.get("identifier")?,
        data,
        version: row.get("version")?,
        deleted: parse_bool(row.get("deleted")?, "resources.deleted")?,
        extant: parse_bool(row.get("extant")?, "resources.extant")?,
        start_date: row.get("start_date")?,
        end_date: row.get("end_date")?,
        point,
        uri: row.get("uri")?,
        href,
    })
}
