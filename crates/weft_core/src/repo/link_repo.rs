//! Materialized link edge persistence.
//!
//! # Responsibility
//! - Keep the `links` table exactly equal to the outbound link set of each
//!   resource's current derived document.
//!
//! # Invariants
//! - Replacement is wholesale: delete-all then bulk insert. No incremental
//!   diffing.

use super::RepoResult;
use crate::pipeline::normalize::InboundLink;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;

/// SQLite-backed link repository.
pub struct LinkRepo<'conn> {
    conn: &'conn Connection,
}

impl<'conn> LinkRepo<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Replaces the outbound link rows of one resource with `links`, a set
    /// of `(target_href, link_type)` pairs.
    pub fn replace_links(
        &self,
        resource_href: &str,
        links: &BTreeSet<(String, String)>,
    ) -> RepoResult<()> {
        self.conn.execute(
            "DELETE FROM links WHERE source_href = ?1;",
            params![resource_href],
        )?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO links (source_href, target_href, type) VALUES (?1, ?2, ?3);")?;
        for (target_href, link_type) in links {
            stmt.execute(params![resource_href, target_href, link_type])?;
        }
        Ok(())
    }

    /// Returns the stored outbound link set of one resource.
    pub fn outbound(&self, resource_href: &str) -> RepoResult<BTreeSet<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_href, type FROM links WHERE source_href = ?1 ORDER BY target_href, type;",
        )?;
        let mut rows = stmt.query(params![resource_href])?;
        let mut links = BTreeSet::new();
        while let Some(row) = rows.next()? {
            links.insert((row.get(0)?, row.get(1)?));
        }
        Ok(links)
    }

    /// Returns every stored link targeting `target_href`, in deterministic
    /// order, for inbound injection.
    pub fn inbound(&self, target_href: &str) -> RepoResult<Vec<InboundLink>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_href, type FROM links WHERE target_href = ?1 ORDER BY source_href, type;",
        )?;
        let mut rows = stmt.query(params![target_href])?;
        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            links.push(InboundLink {
                source_href: row.get(0)?,
                link_type: row.get(1)?,
            });
        }
        Ok(links)
    }
}
