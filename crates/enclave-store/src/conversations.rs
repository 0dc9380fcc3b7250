//! CRUD operations for [`Conversation`] records, including the lookups the
//! direct-conversation deduplication relies on.

use rusqlite::{params, OptionalExtension};

use enclave_shared::types::{ConversationId, ConversationKind, IdentityId, Role};

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::Conversation;
use crate::rows::{now, parse_at, ts, ts_at, uuid_at};

const CONVERSATION_COLUMNS: &str = "c.id, c.kind, c.name, c.created_at, c.last_activity_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a conversation together with its initial members in one
    /// transaction.
    pub fn create_conversation(
        &mut self,
        kind: ConversationKind,
        name: Option<&str>,
        members: &[(IdentityId, Role)],
    ) -> Result<Conversation> {
        match kind {
            ConversationKind::Direct if members.len() != 2 => {
                return Err(StoreError::Invalid(
                    "a direct conversation has exactly two members".into(),
                ));
            }
            ConversationKind::Group if name.map_or(true, |n| n.trim().is_empty()) => {
                return Err(StoreError::Invalid("a group needs a name".into()));
            }
            ConversationKind::Channel => {
                return Err(StoreError::Invalid(
                    "channels are not stored as conversations".into(),
                ));
            }
            _ => {}
        }

        let created_at = now();
        let conversation = Conversation {
            id: ConversationId::new(),
            kind,
            name: name.map(str::to_string),
            created_at,
            last_activity_at: created_at,
        };

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, kind, name, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                conversation.id.to_string(),
                kind.as_str(),
                conversation.name,
                ts(&created_at),
            ],
        )?;
        for (identity, role) in members {
            tx.execute(
                "INSERT INTO memberships (conversation_id, identity_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    conversation.id.to_string(),
                    identity.as_str(),
                    role.as_str(),
                    ts(&created_at),
                ],
            )?;
        }
        tx.commit()?;

        tracing::debug!(
            conversation = %conversation.id,
            kind = kind.as_str(),
            members = members.len(),
            "created conversation"
        );

        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(not_found)
    }

    /// The DIRECT conversation whose current members are exactly `{a, b}`.
    pub fn find_direct_between(
        &self,
        a: &IdentityId,
        b: &IdentityId,
    ) -> Result<Option<Conversation>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations c
             WHERE c.kind = 'direct'
               AND EXISTS (SELECT 1 FROM memberships m
                           WHERE m.conversation_id = c.id AND m.identity_id = ?1
                             AND m.left_at IS NULL)
               AND EXISTS (SELECT 1 FROM memberships m
                           WHERE m.conversation_id = c.id AND m.identity_id = ?2
                             AND m.left_at IS NULL)
               AND (SELECT COUNT(*) FROM memberships m
                    WHERE m.conversation_id = c.id AND m.left_at IS NULL) = 2
             ORDER BY c.created_at ASC
             LIMIT 1"
        );
        Ok(self
            .conn()
            .query_row(&sql, params![a.as_str(), b.as_str()], row_to_conversation)
            .optional()?)
    }

    /// A DIRECT conversation in which `present` is the only current member
    /// and `absent` provably took part before: it either holds a departed
    /// membership row or authored a message there.
    pub fn find_direct_to_resurrect(
        &self,
        present: &IdentityId,
        absent: &IdentityId,
    ) -> Result<Option<Conversation>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations c
             WHERE c.kind = 'direct'
               AND EXISTS (SELECT 1 FROM memberships m
                           WHERE m.conversation_id = c.id AND m.identity_id = ?1
                             AND m.left_at IS NULL)
               AND (SELECT COUNT(*) FROM memberships m
                    WHERE m.conversation_id = c.id AND m.left_at IS NULL) = 1
               AND (EXISTS (SELECT 1 FROM memberships m
                            WHERE m.conversation_id = c.id AND m.identity_id = ?2
                              AND m.left_at IS NOT NULL)
                    OR EXISTS (SELECT 1 FROM messages msg
                               WHERE msg.conversation_id = c.id AND msg.sender_id = ?2))
             ORDER BY c.last_activity_at DESC
             LIMIT 1"
        );
        Ok(self
            .conn()
            .query_row(&sql, params![present.as_str(), absent.as_str()], row_to_conversation)
            .optional()?)
    }

    /// Conversations the identity currently belongs to, most recently
    /// active first.
    pub fn list_conversations_for(&self, identity: &IdentityId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations c
             JOIN memberships m ON m.conversation_id = c.id
             WHERE m.identity_id = ?1 AND m.left_at IS NULL
             ORDER BY c.last_activity_at DESC, c.id ASC"
        ))?;

        let rows = stmt.query_map(params![identity.as_str()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Hard-delete a conversation. Memberships and messages cascade.
    /// Returns `true` if a row was deleted.
    pub fn delete_conversation(&self, id: ConversationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: ConversationId(uuid_at(row, 0)?),
        kind: parse_at(row, 1)?,
        name: row.get(2)?,
        created_at: ts_at(row, 3)?,
        last_activity_at: ts_at(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;
    use enclave_shared::types::RoomId;

    fn id(raw: &str) -> IdentityId {
        IdentityId::new(raw).unwrap()
    }

    fn direct(db: &mut Database, a: &str, b: &str) -> Conversation {
        db.create_conversation(
            ConversationKind::Direct,
            None,
            &[(id(a), Role::Member), (id(b), Role::Member)],
        )
        .unwrap()
    }

    #[test]
    fn direct_needs_two_members_and_group_needs_name() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db
            .create_conversation(ConversationKind::Direct, None, &[(id("a"), Role::Member)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        let err = db
            .create_conversation(ConversationKind::Group, Some("  "), &[(id("a"), Role::Admin)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn find_direct_between_is_order_independent() {
        let mut db = Database::open_in_memory().unwrap();
        let conversation = direct(&mut db, "alice", "bob");

        let ab = db.find_direct_between(&id("alice"), &id("bob")).unwrap();
        let ba = db.find_direct_between(&id("bob"), &id("alice")).unwrap();
        assert_eq!(ab.unwrap().id, conversation.id);
        assert_eq!(ba.unwrap().id, conversation.id);
        assert!(db.find_direct_between(&id("alice"), &id("carol")).unwrap().is_none());
    }

    #[test]
    fn departed_member_makes_resurrection_candidate() {
        let mut db = Database::open_in_memory().unwrap();
        let conversation = direct(&mut db, "alice", "bob");
        db.remove_membership(conversation.id, &id("alice")).unwrap();

        assert!(db.find_direct_between(&id("alice"), &id("bob")).unwrap().is_none());

        let candidate = db
            .find_direct_to_resurrect(&id("bob"), &id("alice"))
            .unwrap()
            .expect("bob still holds the thread alice left");
        assert_eq!(candidate.id, conversation.id);

        // A stranger has no claim on bob's thread.
        assert!(db
            .find_direct_to_resurrect(&id("bob"), &id("mallory"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn authored_message_makes_resurrection_candidate() {
        let mut db = Database::open_in_memory().unwrap();
        let conversation = direct(&mut db, "alice", "bob");
        db.append_message(&NewMessage {
            target: RoomId::Conversation(conversation.id),
            sender_id: &id("alice"),
            body: "hello",
            client_ref: None,
        })
        .unwrap();

        // Simulate a row that carries no departure marker.
        db.conn()
            .execute(
                "DELETE FROM memberships WHERE identity_id = 'alice'",
                [],
            )
            .unwrap();

        let candidate = db.find_direct_to_resurrect(&id("bob"), &id("alice")).unwrap();
        assert_eq!(candidate.map(|c| c.id), Some(conversation.id));
    }

    #[test]
    fn delete_cascades_memberships_and_messages() {
        let mut db = Database::open_in_memory().unwrap();
        let conversation = direct(&mut db, "alice", "bob");
        db.append_message(&NewMessage {
            target: RoomId::Conversation(conversation.id),
            sender_id: &id("bob"),
            body: "bye",
            client_ref: None,
        })
        .unwrap();

        assert!(db.delete_conversation(conversation.id).unwrap());
        assert!(matches!(
            db.get_conversation(conversation.id),
            Err(StoreError::NotFound)
        ));

        let leftover: i64 = db
            .conn()
            .query_row(
                "SELECT (SELECT COUNT(*) FROM memberships) + (SELECT COUNT(*) FROM messages)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn list_for_identity_skips_departed() {
        let mut db = Database::open_in_memory().unwrap();
        let first = direct(&mut db, "alice", "bob");
        let second = direct(&mut db, "alice", "carol");
        db.remove_membership(first.id, &id("alice")).unwrap();

        let listed: Vec<_> = db
            .list_conversations_for(&id("alice"))
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(listed, vec![second.id]);
    }
}
