//! Per-identity block list.

use rusqlite::{params, OptionalExtension};

use enclave_shared::types::IdentityId;

use crate::database::Database;
use crate::error::Result;
use crate::rows::{now, ts};

impl Database {
    /// Returns `true` if the block is new.
    pub fn block(&self, blocker: &IdentityId, blocked: &IdentityId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO blocks (blocker_id, blocked_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![blocker.as_str(), blocked.as_str(), ts(&now())],
        )?;
        Ok(affected > 0)
    }

    /// Returns `true` if a block was lifted.
    pub fn unblock(&self, blocker: &IdentityId, blocked: &IdentityId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker.as_str(), blocked.as_str()],
        )?;
        Ok(affected > 0)
    }

    pub fn is_blocked(&self, blocker: &IdentityId, blocked: &IdentityId) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
                params![blocker.as_str(), blocked.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
