//! CRUD operations for [`Identity`] records.

use rusqlite::{params, OptionalExtension};

use enclave_shared::types::{DomainId, IdentityId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::Identity;
use crate::rows::{domain_at, identity_at, now, ts, ts_at};

const IDENTITY_COLUMNS: &str = "id, domain, display_name, first_seen_at, last_seen_at";

impl Database {
    /// Record that an identity was seen. A missing display name keeps the
    /// previously known one.
    pub fn upsert_identity(
        &self,
        id: &IdentityId,
        domain: &DomainId,
        display_name: Option<&str>,
    ) -> Result<Identity> {
        let seen = ts(&now());
        self.conn().execute(
            "INSERT INTO identities (id, domain, display_name, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 domain = excluded.domain,
                 display_name = COALESCE(excluded.display_name, identities.display_name),
                 last_seen_at = excluded.last_seen_at",
            params![id.as_str(), domain.as_str(), display_name, seen],
        )?;
        self.get_identity(id)
    }

    pub fn get_identity(&self, id: &IdentityId) -> Result<Identity> {
        self.conn()
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
                params![id.as_str()],
                row_to_identity,
            )
            .map_err(not_found)
    }

    pub fn find_identity(&self, id: &IdentityId) -> Result<Option<Identity>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
                params![id.as_str()],
                row_to_identity,
            )
            .optional()?)
    }

    /// Whether any identity of this domain has been seen before.
    pub fn domain_known(&self, domain: &DomainId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM identities WHERE domain = ?1",
            params![domain.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: identity_at(row, 0)?,
        domain: domain_at(row, 1)?,
        display_name: row.get(2)?,
        first_seen_at: ts_at(row, 3)?,
        last_seen_at: ts_at(row, 4)?,
    })
}
