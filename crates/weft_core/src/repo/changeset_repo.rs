//! Changeset row persistence.
//!
//! # Responsibility
//! - Persist changeset batches and their optimistic version counter.
//!
//! # Invariants
//! - The stored version is the optimistic guard read before perform.

use super::{RepoError, RepoResult};
use crate::model::changeset::{Changeset, ChangesetState, UpdateOperation};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct ChangesetPayload {
    operations: Vec<UpdateOperation>,
}

/// SQLite-backed changeset repository.
pub struct ChangesetRepo<'conn> {
    conn: &'conn Connection,
}

impl<'conn> ChangesetRepo<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Loads one changeset by id.
    pub fn get(&self, id: &str) -> RepoResult<Option<Changeset>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, base_href, author, committer, state, data, version
             FROM changesets WHERE id = ?1;",
        )?;
        stmt.query_row(params![id], parse_changeset_row)
            .optional()?
            .transpose()
    }

    /// Returns the stored version counter, if the changeset was persisted.
    pub fn stored_version(&self, id: &str) -> RepoResult<Option<i64>> {
        let version = self
            .conn
            .query_row(
                "SELECT version FROM changesets WHERE id = ?1;",
                params![id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(version)
    }

    /// Inserts or fully replaces one changeset row.
    pub fn upsert(&self, changeset: &Changeset) -> RepoResult<()> {
        let payload = ChangesetPayload {
            operations: changeset.operations.clone(),
        };
        let data = serde_json::to_string(&payload).map_err(|err| {
            RepoError::InvalidData(format!(
                "cannot serialize changeset `{}`: {err}",
                changeset.id
            ))
        })?;
        self.conn.execute(
            "INSERT INTO changesets (id, base_href, author, committer, state, data, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                data = excluded.data,
                version = excluded.version,
                modified_at = (strftime('%s', 'now') * 1000);",
            params![
                changeset.id,
                changeset.base_href,
                changeset.author,
                changeset.committer,
                changeset.state.as_str(),
                data,
                changeset.version,
            ],
        )?;
        Ok(())
    }
}

fn parse_changeset_row(row: &Row<'_>) -> rusqlite::Result<RepoResult<Changeset>> {
    Ok(build_changeset(row))
}

fn build_changeset(row: &Row<'_>) -> RepoResult<Changeset> {
    let id: String = row.get("id")?;
    let state_text: String = row.get("state")?;
    let state = ChangesetState::parse(&state_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid changeset state `{state_text}` for `{id}`"
        ))
    })?;
    let data_text: String = row.get("data")?;
    let payload: ChangesetPayload = serde_json::from_str(&data_text).map_err(|err| {
        RepoError::InvalidData(format!("invalid changeset payload for `{id}`: {err}"))
    })?;
    Ok(Changeset {
        base_href: row.get("base_href")?,
        author: row.get("author")?,
        committer: row.get("committer")?,
        state,
        operations: payload.operations,
        version: row.get("version")?,
        id,
    })
}
