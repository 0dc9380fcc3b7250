use enclave_shared::types::{DeliveryState, IdentityId, MessageId, RoomId};
use enclave_store::{Message, NewMessage};

use crate::db::SharedDatabase;
use crate::error::{EngineError, Result};

/// Result of [`MessageStore::append`].
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    /// `false` when a resubmission returned the earlier copy.
    pub fresh: bool,
}

/// Result of [`MessageStore::advance_state`].
#[derive(Debug, Clone)]
pub struct AdvanceOutcome {
    pub message: Message,
    pub changed: bool,
}

/// Validating front of the message table.
#[derive(Clone)]
pub struct MessageStore {
    db: SharedDatabase,
    max_body_bytes: usize,
}

impl MessageStore {
    pub fn new(db: SharedDatabase, max_body_bytes: usize) -> Self {
        Self { db, max_body_bytes }
    }

    /// Persist a message. Callers hold the target's lock.
    pub fn append(
        &self,
        target: RoomId,
        sender: &IdentityId,
        body: &str,
        client_ref: Option<&str>,
    ) -> Result<Appended> {
        if body.trim().is_empty() {
            return Err(EngineError::invalid("message body is empty"));
        }
        if body.len() > self.max_body_bytes {
            return Err(EngineError::invalid(format!(
                "message body exceeds {} bytes",
                self.max_body_bytes
            )));
        }

        let new = NewMessage {
            target,
            sender_id: sender,
            body,
            client_ref,
        };
        let (message, fresh) = self
            .db
            .with(|db| Ok(db.append_message(&new)?))
            .map_err(|e| match e {
                EngineError::NotFound(_) => EngineError::not_found(target),
                other => other,
            })?;

        Ok(Appended { message, fresh })
    }

    /// Oldest first.
    pub fn history(&self, target: &RoomId, limit: u32) -> Result<Vec<Message>> {
        self.db.with(|db| Ok(db.history(target, limit)?))
    }

    pub fn find(&self, id: MessageId) -> Result<Option<Message>> {
        self.db.with(|db| Ok(db.find_message(id)?))
    }

    pub fn advance_state(&self, id: MessageId, state: DeliveryState) -> Result<AdvanceOutcome> {
        let (message, changed) = self
            .db
            .with(|db| Ok(db.advance_delivery_state(id, state)?))
            .map_err(|e| match e {
                EngineError::NotFound(_) => EngineError::not_found(format!("message {id}")),
                other => other,
            })?;
        Ok(AdvanceOutcome { message, changed })
    }
}
