//! Persistence repositories for the graph tables.
//!
//! # Responsibility
//! - Keep SQL details inside the core persistence boundary.
//! - Reject invalid persisted state instead of masking it.
//!
//! # Invariants
//! - Multi-row mutations run inside the caller's Immediate transaction; a
//!   repository never commits on its own.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod changeset_repo;
pub mod identifier_repo;
pub mod link_repo;
pub mod resource_repo;
pub mod source_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Generic repository error for row persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    /// No row for the given href/id.
    NotFound(String),
    /// Persisted state cannot be converted to a valid read model.
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(href) => write!(f, "row not found: {href}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::NotFound(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn parse_bool(value: i64, column: &str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid boolean value `{other}` in {column}"
        ))),
    }
}
