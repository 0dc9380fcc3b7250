//! Message persistence: append, history, delivery-state transitions.
//!
//! Callers must serialize appends per target. The store assigns `seq` as
//! `max + 1` inside a transaction, which is only gap-free and unique under
//! that discipline; the unique index turns a violation into an error rather
//! than a silent duplicate.

use chrono::Duration;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Transaction};

use enclave_shared::types::{
    ChannelId, ConversationId, DeliveryState, IdentityId, MessageId, MessageType, RoomId,
};

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::{Message, NewMessage};
use crate::rows::{identity_at, now, opt_uuid_at, parse_at, parse_ts, ts, ts_at, uuid_at};

const MESSAGE_COLUMNS: &str = "id, conversation_id, channel_id, seq, sender_id, \
     sender_display_name, body, message_type, client_ref, delivery_state, created_at";

/// Table and column that hold a target.
fn target_column(target: &RoomId) -> (&'static str, &'static str, String) {
    match target {
        RoomId::Conversation(id) => ("conversations", "conversation_id", id.to_string()),
        RoomId::Channel(id) => ("channels", "channel_id", id.to_string()),
    }
}

impl Database {
    // ------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------

    /// Persist a new message with state `Sent`. The flag is `false` when a
    /// repeated `(sender, client_ref)` with the same target and body returned
    /// the message stored by the first submission; reusing the ref for
    /// anything else is rejected. `created_at` never goes backwards within a target.
    pub fn append_message(&mut self, new: &NewMessage<'_>) -> Result<(Message, bool)> {
        if new.body.trim().is_empty() {
            return Err(StoreError::Invalid("message body is empty".into()));
        }

        let tx = self.conn_mut().transaction()?;

        if let Some(client_ref) = new.client_ref {
            if let Some(existing) = find_by_client_ref(&tx, new.sender_id, client_ref)? {
                if existing.target != new.target || existing.body != new.body {
                    return Err(StoreError::Invalid(format!(
                        "client_ref {client_ref} was already used for another message"
                    )));
                }
                return Ok((existing, false));
            }
        }

        let (table, column, target_id) = target_column(&new.target);

        let exists: Option<i64> = tx
            .query_row(
                &format!("SELECT 1 FROM {table} WHERE id = ?1"),
                params![target_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let (last_seq, last_created): (i64, Option<String>) = tx.query_row(
            &format!("SELECT COALESCE(MAX(seq), 0), MAX(created_at) FROM messages WHERE {column} = ?1"),
            params![target_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut created_at = now();
        if let Some(last) = last_created {
            let last = parse_ts(&last).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
            })?;
            if created_at <= last {
                created_at = last + Duration::microseconds(1);
            }
        }

        let sender_display_name: Option<String> = tx
            .query_row(
                "SELECT display_name FROM identities WHERE id = ?1",
                params![new.sender_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let message = Message {
            id: MessageId::new(),
            target: new.target,
            seq: last_seq + 1,
            sender_id: new.sender_id.clone(),
            sender_display_name,
            body: new.body.to_string(),
            message_type: MessageType::Text,
            client_ref: new.client_ref.map(str::to_string),
            delivery_state: DeliveryState::Sent,
            created_at,
        };

        tx.execute(
            &format!(
                "INSERT INTO messages (id, {column}, seq, sender_id, sender_display_name, body,
                                       message_type, client_ref, delivery_state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                message.id.to_string(),
                target_id,
                message.seq,
                message.sender_id.as_str(),
                message.sender_display_name,
                message.body,
                message.message_type.as_str(),
                message.client_ref,
                message.delivery_state.as_str(),
                ts(&created_at),
            ],
        )?;
        tx.execute(
            &format!("UPDATE {table} SET last_activity_at = ?2 WHERE id = ?1"),
            params![target_id, ts(&created_at)],
        )?;
        tx.commit()?;

        tracing::debug!(
            message = %message.id,
            target = %message.target,
            seq = message.seq,
            "appended message"
        );

        Ok((message, true))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// The most recent `limit` messages of a target, oldest first.
    pub fn history(&self, target: &RoomId, limit: u32) -> Result<Vec<Message>> {
        let (_, column, target_id) = target_column(target);
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE {column} = ?1
             ORDER BY seq DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![target_id, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    pub fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .optional()?)
    }

    // ------------------------------------------------------------------
    // Delivery state
    // ------------------------------------------------------------------

    /// Move a message forward to `state`. Returns the stored message and
    /// whether anything changed; a state at or behind the current one is
    /// a no-op.
    pub fn advance_delivery_state(
        &self,
        id: MessageId,
        state: DeliveryState,
    ) -> Result<(Message, bool)> {
        let current = self.get_message(id)?;
        if state <= current.delivery_state {
            return Ok((current, false));
        }

        // The guard keeps a racing writer from moving the row backwards.
        let affected = self.conn().execute(
            "UPDATE messages SET delivery_state = ?2
             WHERE id = ?1
               AND CASE delivery_state WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END
                 < CASE ?2 WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 ELSE 2 END",
            params![id.to_string(), state.as_str()],
        )?;

        Ok((self.get_message(id)?, affected > 0))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn find_by_client_ref(
    tx: &Transaction<'_>,
    sender: &IdentityId,
    client_ref: &str,
) -> Result<Option<Message>> {
    Ok(tx
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender_id = ?1 AND client_ref = ?2"
            ),
            params![sender.as_str(), client_ref],
            row_to_message,
        )
        .optional()?)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let conversation = opt_uuid_at(row, 1)?.map(ConversationId);
    let channel = opt_uuid_at(row, 2)?.map(ChannelId);
    let target = match (conversation, channel) {
        (Some(id), None) => RoomId::Conversation(id),
        (None, Some(id)) => RoomId::Channel(id),
        _ => return Err(rusqlite::Error::InvalidColumnType(1, "target".into(), Type::Null)),
    };

    Ok(Message {
        id: MessageId(uuid_at(row, 0)?),
        target,
        seq: row.get(3)?,
        sender_id: identity_at(row, 4)?,
        sender_display_name: row.get(5)?,
        body: row.get(6)?,
        message_type: parse_at(row, 7)?,
        client_ref: row.get(8)?,
        delivery_state: parse_at(row, 9)?,
        created_at: ts_at(row, 10)?,
    })
}
