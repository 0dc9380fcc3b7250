//! Membership rows. Leaving sets `left_at` instead of deleting, so a
//! departed participant stays provable for direct-conversation revival.

use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};

use enclave_shared::types::{ConversationId, IdentityId, Role};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Membership;
use crate::rows::{identity_at, now, opt_ts_at, parse_at, ts, ts_at, uuid_at};

const MEMBERSHIP_COLUMNS: &str = "conversation_id, identity_id, role, joined_at, left_at";

impl Database {
    /// Make `identity` a current member. A departed row is revived with the
    /// given role and a fresh `joined_at`; a current row is left untouched.
    pub fn add_membership(
        &self,
        conversation: ConversationId,
        identity: &IdentityId,
        role: Role,
    ) -> Result<Membership> {
        // Surface a missing conversation as NotFound rather than an FK error.
        self.get_conversation(conversation)?;

        self.conn().execute(
            "INSERT INTO memberships (conversation_id, identity_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id, identity_id) DO UPDATE SET
                 role = CASE WHEN memberships.left_at IS NULL
                             THEN memberships.role ELSE excluded.role END,
                 joined_at = CASE WHEN memberships.left_at IS NULL
                                  THEN memberships.joined_at ELSE excluded.joined_at END,
                 left_at = NULL",
            params![
                conversation.to_string(),
                identity.as_str(),
                role.as_str(),
                ts(&now()),
            ],
        )?;

        self.membership(conversation, identity)?
            .ok_or(StoreError::NotFound)
    }

    /// Mark a current member as departed.
    pub fn remove_membership(
        &self,
        conversation: ConversationId,
        identity: &IdentityId,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE memberships SET left_at = ?3
             WHERE conversation_id = ?1 AND identity_id = ?2 AND left_at IS NULL",
            params![conversation.to_string(), identity.as_str(), ts(&now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn is_member(&self, conversation: ConversationId, identity: &IdentityId) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM memberships
                 WHERE conversation_id = ?1 AND identity_id = ?2 AND left_at IS NULL",
                params![conversation.to_string(), identity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The row for `identity`, current or departed.
    pub fn membership(
        &self,
        conversation: ConversationId,
        identity: &IdentityId,
    ) -> Result<Option<Membership>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MEMBERSHIP_COLUMNS} FROM memberships
                     WHERE conversation_id = ?1 AND identity_id = ?2"
                ),
                params![conversation.to_string(), identity.as_str()],
                row_to_membership,
            )
            .optional()?)
    }

    /// Current members, longest-standing first.
    pub fn current_memberships(&self, conversation: ConversationId) -> Result<Vec<Membership>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships
             WHERE conversation_id = ?1 AND left_at IS NULL
             ORDER BY joined_at ASC, identity_id ASC"
        ))?;
        let rows = stmt.query_map(params![conversation.to_string()], row_to_membership)?;

        let mut memberships = Vec::new();
        for row in rows {
            memberships.push(row?);
        }
        Ok(memberships)
    }

    pub fn current_members(&self, conversation: ConversationId) -> Result<BTreeSet<IdentityId>> {
        Ok(self
            .current_memberships(conversation)?
            .into_iter()
            .map(|m| m.identity_id)
            .collect())
    }

    pub fn member_count(&self, conversation: ConversationId) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM memberships WHERE conversation_id = ?1 AND left_at IS NULL",
            params![conversation.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn set_role(
        &self,
        conversation: ConversationId,
        identity: &IdentityId,
        role: Role,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE memberships SET role = ?3
             WHERE conversation_id = ?1 AND identity_id = ?2 AND left_at IS NULL",
            params![conversation.to_string(), identity.as_str(), role.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        conversation_id: ConversationId(uuid_at(row, 0)?),
        identity_id: identity_at(row, 1)?,
        role: parse_at(row, 2)?,
        joined_at: ts_at(row, 3)?,
        left_at: opt_ts_at(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_shared::types::ConversationKind;

    fn id(raw: &str) -> IdentityId {
        IdentityId::new(raw).unwrap()
    }

    fn group(db: &mut Database) -> ConversationId {
        db.create_conversation(
            ConversationKind::Group,
            Some("design"),
            &[(id("alice"), Role::Admin), (id("bob"), Role::Member)],
        )
        .unwrap()
        .id
    }

    #[test]
    fn remove_then_add_revives_row() {
        let mut db = Database::open_in_memory().unwrap();
        let conversation = group(&mut db);

        db.remove_membership(conversation, &id("bob")).unwrap();
        assert!(!db.is_member(conversation, &id("bob")).unwrap());
        let departed = db.membership(conversation, &id("bob")).unwrap().unwrap();
        assert!(!departed.is_current());

        let revived = db.add_membership(conversation, &id("bob"), Role::Member).unwrap();
        assert!(revived.is_current());
        assert!(db.is_member(conversation, &id("bob")).unwrap());
        assert_eq!(db.member_count(conversation).unwrap(), 2);
    }

    #[test]
    fn add_is_idempotent_for_current_member() {
        let mut db = Database::open_in_memory().unwrap();
        let conversation = group(&mut db);

        let again = db.add_membership(conversation, &id("alice"), Role::Member).unwrap();
        assert_eq!(again.role, Role::Admin);
        assert_eq!(db.member_count(conversation).unwrap(), 2);
    }

    #[test]
    fn remove_non_member_is_not_found() {
        let mut db = Database::open_in_memory().unwrap();
        let conversation = group(&mut db);

        assert!(matches!(
            db.remove_membership(conversation, &id("carol")),
            Err(StoreError::NotFound)
        ));
        db.remove_membership(conversation, &id("bob")).unwrap();
        assert!(matches!(
            db.remove_membership(conversation, &id("bob")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn add_to_missing_conversation_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.add_membership(ConversationId::new(), &id("alice"), Role::Member),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn members_listed_in_join_order() {
        let mut db = Database::open_in_memory().unwrap();
        let conversation = group(&mut db);
        db.add_membership(conversation, &id("carol"), Role::Member).unwrap();
        db.set_role(conversation, &id("carol"), Role::Admin).unwrap();

        let members = db.current_memberships(conversation).unwrap();
        assert_eq!(members.last().unwrap().identity_id, id("carol"));
        assert_eq!(members.last().unwrap().role, Role::Admin);

        let set = db.current_members(conversation).unwrap();
        assert!(set.contains(&id("alice")) && set.contains(&id("bob")) && set.contains(&id("carol")));
    }
}
