//! Secondary identifier index persistence.
//!
//! # Responsibility
//! - Keep the unique `(scheme, value) -> resource` index in step with each
//!   resource's derived document.
//! - Name the offending pair on uniqueness conflicts instead of failing the
//!   whole batch opaquely.
//!
//! # Invariants
//! - No two resources ever hold the same `(scheme, value)` row.
//! - Replacement is wholesale; partial inserts are undone by the enclosing
//!   transaction.

use super::RepoResult;
use crate::db::DbError;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type IdentifierResult<T> = Result<T, IdentifierRepoError>;

/// Errors from identifier index maintenance.
#[derive(Debug)]
pub enum IdentifierRepoError {
    Db(DbError),
    /// Another resource already claims this `(scheme, value)` pair.
    DuplicatedIdentifier {
        scheme: String,
        value: String,
        claimed_by: Option<String>,
    },
}

impl Display for IdentifierRepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::DuplicatedIdentifier {
                scheme,
                value,
                claimed_by,
            } => match claimed_by {
                Some(owner) => write!(
                    f,
                    "identifier {scheme}:{value} is already claimed by {owner}"
                ),
                None => write!(f, "identifier {scheme}:{value} is already claimed"),
            },
        }
    }
}

impl Error for IdentifierRepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::DuplicatedIdentifier { .. } => None,
        }
    }
}

impl From<DbError> for IdentifierRepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for IdentifierRepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// SQLite-backed identifier repository.
pub struct IdentifierRepo<'conn> {
    conn: &'conn Connection,
}

impl<'conn> IdentifierRepo<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Replaces every identifier row of one resource.
    ///
    /// The bulk insert is retried row-by-row on a uniqueness violation so
    /// the offending `(scheme, value)` pair can be named. The rows written
    /// before the failure are rolled back by the enclosing transaction.
    pub fn replace_identifiers(
        &self,
        resource_href: &str,
        entries: &[(String, String)],
    ) -> IdentifierResult<()> {
        self.conn.execute(
            "DELETE FROM identifiers WHERE resource_href = ?1;",
            params![resource_href],
        )?;
        if entries.is_empty() {
            return Ok(());
        }

        match self.insert_all(resource_href, entries) {
            Ok(()) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(self.isolate_duplicate(resource_href, entries))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn insert_all(
        &self,
        resource_href: &str,
        entries: &[(String, String)],
    ) -> rusqlite::Result<()> {
        let placeholders: Vec<String> = (0..entries.len())
            .map(|index| format!("(?1, ?{}, ?{})", index * 2 + 2, index * 2 + 3))
            .collect();
        let sql = format!(
            "INSERT INTO identifiers (resource_href, scheme, value) VALUES {};",
            placeholders.join(", ")
        );
        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&resource_href];
        for (scheme, value) in entries {
            bind.push(scheme);
            bind.push(value);
        }
        self.conn.execute(&sql, bind.as_slice())?;
        Ok(())
    }

    fn isolate_duplicate(
        &self,
        resource_href: &str,
        entries: &[(String, String)],
    ) -> IdentifierRepoError {
        for (scheme, value) in entries {
            let attempt = self.conn.execute(
                "INSERT INTO identifiers (resource_href, scheme, value) VALUES (?1, ?2, ?3);",
                params![resource_href, scheme, value],
            );
            match attempt {
                Ok(_) => continue,
                Err(err) if is_unique_violation(&err) => {
                    let claimed_by = self.owner_of(scheme, value).ok().flatten();
                    return IdentifierRepoError::DuplicatedIdentifier {
                        scheme: scheme.clone(),
                        value: value.clone(),
                        claimed_by,
                    };
                }
                Err(err) => return err.into(),
            }
        }
        // Unreachable in practice: the bulk insert failed, so some row must
        // also fail individually inside the same transaction.
        IdentifierRepoError::Db(DbError::Sqlite(rusqlite::Error::StatementChangedRows(0)))
    }

    fn owner_of(&self, scheme: &str, value: &str) -> RepoResult<Option<String>> {
        let owner = self
            .conn
            .query_row(
                "SELECT resource_href FROM identifiers WHERE scheme = ?1 AND value = ?2;",
                params![scheme, value],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// Maps each requested value of one scheme to its owning resource href.
    pub fn lookup(
        &self,
        scheme: &str,
        values: &[&str],
    ) -> RepoResult<BTreeMap<String, Option<String>>> {
        let mut result: BTreeMap<String, Option<String>> = values
            .iter()
            .map(|value| ((*value).to_string(), None))
            .collect();
        let mut stmt = self.conn.prepare(
            "SELECT value, resource_href FROM identifiers WHERE scheme = ?1 AND value = ?2;",
        )?;
        for value in values {
            let owner = stmt
                .query_row(params![scheme, value], |row| row.get::<_, String>(1))
                .optional()?;
            result.insert((*value).to_string(), owner);
        }
        Ok(result)
    }

    /// Returns every `(value, resource_href)` pair of one scheme.
    pub fn lookup_scheme(&self, scheme: &str) -> RepoResult<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare(
            "SELECT value, resource_href FROM identifiers WHERE scheme = ?1 ORDER BY value;",
        )?;
        let mut rows = stmt.query(params![scheme])?;
        let mut result = BTreeMap::new();
        while let Some(row) = rows.next()? {
            result.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }
        Ok(result)
    }

    /// Returns the stored `(scheme, value)` pairs of one resource.
    pub fn for_resource(&self, resource_href: &str) -> RepoResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT scheme, value FROM identifiers WHERE resource_href = ?1 ORDER BY scheme, value;",
        )?;
        let mut rows = stmt.query(params![resource_href])?;
        let mut pairs = Vec::new();
        while let Some(row) = rows.next()? {
            pairs.push((row.get(0)?, row.get(1)?));
        }
        Ok(pairs)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

#[cfg(test)]
mod tests {
    use super::{IdentifierRepo, IdentifierRepoError};
    use crate::db::open_db_in_memory;
    use crate::model::resource::Resource;
    use crate::repo::resource_repo::ResourceRepo;

    fn entry(scheme: &str, value: &str) -> (String, String) {
        (scheme.to_string(), value.to_string())
    }

    fn seeded(conn: &rusqlite::Connection, identifier: &str) {
        ResourceRepo::new(conn)
            .insert(&Resource::new("snake", identifier))
            .unwrap();
    }

    #[test]
    fn replace_is_wholesale() {
        let conn = open_db_in_memory().unwrap();
        seeded(&conn, "python");
        let repo = IdentifierRepo::new(&conn);

        repo.replace_identifiers("/snake/python", &[entry("taxon", "p-123")])
            .unwrap();
        repo.replace_identifiers("/snake/python", &[entry("taxon", "p-456")])
            .unwrap();

        assert_eq!(
            repo.for_resource("/snake/python").unwrap(),
            vec![entry("taxon", "p-456")]
        );
    }

    #[test]
    fn duplicate_claim_names_the_offending_pair() {
        let conn = open_db_in_memory().unwrap();
        seeded(&conn, "python");
        seeded(&conn, "boa");
        let repo = IdentifierRepo::new(&conn);

        repo.replace_identifiers("/snake/python", &[entry("taxon", "p-123")])
            .unwrap();
        let err = repo
            .replace_identifiers(
                "/snake/boa",
                &[entry("taxon", "b-789"), entry("taxon", "p-123")],
            )
            .unwrap_err();

        match err {
            IdentifierRepoError::DuplicatedIdentifier {
                scheme,
                value,
                claimed_by,
            } => {
                assert_eq!(scheme, "taxon");
                assert_eq!(value, "p-123");
                assert_eq!(claimed_by.as_deref(), Some("/snake/python"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lookup_maps_missing_values_to_none() {
        let conn = open_db_in_memory().unwrap();
        seeded(&conn, "python");
        let repo = IdentifierRepo::new(&conn);
        repo.replace_identifiers("/snake/python", &[entry("taxon", "p-123")])
            .unwrap();

        let result = repo.lookup("taxon", &["p-123", "missing"]).unwrap();
        assert_eq!(
            result.get("p-123").cloned().flatten().as_deref(),
            Some("/snake/python")
        );
        assert_eq!(result.get("missing").cloned().flatten(), None);
    }

    #[test]
    fn lookup_scheme_returns_all_values() {
        let conn = open_db_in_memory().unwrap();
        seeded(&conn, "python");
        let repo = IdentifierRepo::new(&conn);
        repo.replace_identifiers(
            "/snake/python",
            &[entry("taxon", "p-123"), entry("gbif", "42")],
        )
        .unwrap();

        let taxa = repo.lookup_scheme("taxon").unwrap();
        assert_eq!(taxa.len(), 1);
        assert_eq!(taxa.get("p-123").map(String::as_str), Some("/snake/python"));
    }
}
