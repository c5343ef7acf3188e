//! Source row persistence.
//!
//! # Responsibility
//! - Provide CRUD over the `sources` table.
//! - Keep tombstoned rows addressable for history and resurrection.
//!
//! # Invariants
//! - A deleted row has `data = NULL`.
//! - `upsert` is the single write path; version bumps happen in the caller.

use super::{bool_to_int, parse_bool, RepoError, RepoResult};
use crate::model::source::Source;
use rusqlite::{params, Connection, OptionalExtension, Row};

const SOURCE_SELECT_SQL: &str = "SELECT
    href,
    resource_href,
    type,
    data,
    version,
    deleted,
    author,
    committer
FROM sources";

/// SQLite-backed source repository.
pub struct SourceRepo<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SourceRepo<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Loads one source by href, tombstones included.
    pub fn get(&self, href: &str) -> RepoResult<Option<Source>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SOURCE_SELECT_SQL} WHERE href = ?1;"))?;
        stmt.query_row(params![href], parse_source_row)
            .optional()?
            .transpose()
    }

    /// Lists every source row of one resource, tombstones included, in
    /// source-type order.
    pub fn list_for_resource(&self, resource_href: &str) -> RepoResult<Vec<Source>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SOURCE_SELECT_SQL} WHERE resource_href = ?1 ORDER BY type ASC;"
        ))?;
        let mut rows = stmt.query(params![resource_href])?;
        let mut sources = Vec::new();
        while let Some(row) = rows.next()? {
            sources.push(parse_source_row(row)??);
        }
        Ok(sources)
    }

    /// Inserts or fully replaces one source row.
    pub fn upsert(&self, source: &Source) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO sources (
                href, resource_href, type, data, version, deleted, author, committer
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(href) DO UPDATE SET
                data = excluded.data,
                version = excluded.version,
                deleted = excluded.deleted,
                committer = excluded.committer,
                modified_at = (strftime('%s', 'now') * 1000);",
            params![
                source.href,
                source.resource_href,
                source.kind,
                source.data.as_ref().map(|data| data.to_string()),
                source.version,
                bool_to_int(source.deleted),
                source.author,
                source.committer,
            ],
        )?;
        Ok(())
    }
}

fn parse_source_row(row: &Row<'_>) -> rusqlite::Result<RepoResult<Source>> {
    Ok(build_source(row))
}

fn build_source(row: &Row<'_>) -> RepoResult<Source> {
    let href: String = row.get("href")?;
    let data = match row.get::<_, Option<String>>("data")? {
        Some(text) => Some(serde_json::from_str(&text).map_err(|err| {
            RepoError::InvalidData(format!("invalid source JSON for `{href}`: {err}"))
        })?),
        None => None,
    };
    Ok(Source {
        resource_href: row.get("resource_href")?,
        kind: row.get("type")?,
        data,
        version: row.get("version")?,
        deleted: parse_bool(row.get("deleted")?, "sources.deleted")?,
        author: row.get("author")?,
        committer: row.get("committer")?,
        href,
    })
}
