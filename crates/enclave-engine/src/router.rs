//! Broadcast Router.
//!
//! A submitted message moves RECEIVED -> PERSISTED -> FANNED_OUT. Nothing
//! is fanned out unless the append succeeded, and a failure is reported to
//! the originating connection only. Appends and state advances are
//! serialized per target; the lock is held through fanout so receivers see
//! messages in `seq` order.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use enclave_shared::protocol::ServerEvent;
use enclave_shared::types::{Caller, ConnectionId, DeliveryState, IdentityId, MessageId, RoomId};
use enclave_store::Message;

use crate::contacts::BlockList;
use crate::directory::{Directory, RoomAccess};
use crate::error::{EngineError, Result};
use crate::locks::KeyedLocks;
use crate::messages::{AdvanceOutcome, MessageStore};
use crate::presence::PresenceRegistry;

pub struct BroadcastRouter {
    directory: Arc<Directory>,
    presence: PresenceRegistry,
    messages: MessageStore,
    blocks: Arc<dyn BlockList>,
    target_locks: KeyedLocks<RoomId>,
}

impl BroadcastRouter {
    pub fn new(
        directory: Arc<Directory>,
        presence: PresenceRegistry,
        messages: MessageStore,
        blocks: Arc<dyn BlockList>,
    ) -> Self {
        Self {
            directory,
            presence,
            messages,
            blocks,
            target_locks: KeyedLocks::new(),
        }
    }

    /// Persist a message from `origin` and fan it out.
    ///
    /// The originating connection gets `MessageSent`; every other connection
    /// joined to the room gets `MessageReceived`, including the sender's
    /// other devices. A resubmitted `client_ref` is acknowledged again but
    /// not fanned out a second time.
    pub async fn submit(
        &self,
        origin: ConnectionId,
        target: RoomId,
        body: &str,
        client_ref: Option<String>,
    ) -> Result<Message> {
        let caller = self.origin(origin).await?;
        self.directory.authorize(&caller, &target)?;

        let _target = self.target_locks.lock(&target).await;
        let appended = self
            .messages
            .append(target, &caller.identity, body, client_ref.as_deref())?;
        let message = appended.message;

        self.presence
            .send_to(
                origin,
                ServerEvent::MessageSent {
                    client_ref,
                    message: message.clone(),
                },
            )
            .await;

        if !appended.fresh {
            debug!(message = %message.id, "resubmission acknowledged without fanout");
            return Ok(message);
        }

        let suppressed = self.suppressed_recipients(&caller.identity, &target);
        let event = ServerEvent::MessageReceived {
            message: message.clone(),
        };
        let delivered = self
            .presence
            .broadcast(&target, &event, |id, owner| {
                id == origin || suppressed.contains(&owner.identity)
            })
            .await;

        debug!(
            message = %message.id,
            target = %target,
            delivered,
            suppressed = suppressed.len(),
            "message fanned out"
        );
        Ok(message)
    }

    /// Apply a delivered/read acknowledgment and re-broadcast the new state
    /// to the whole room.
    ///
    /// Returns `None` when nothing was applied: the message no longer
    /// exists or the caller is its sender.
    pub async fn acknowledge(
        &self,
        origin: ConnectionId,
        message_id: MessageId,
        state: DeliveryState,
    ) -> Result<Option<AdvanceOutcome>> {
        if state == DeliveryState::Sent {
            return Err(EngineError::invalid("only delivered or read can be acknowledged"));
        }
        let caller = self.origin(origin).await?;

        let Some(message) = self.messages.find(message_id)? else {
            debug!(message = %message_id, "acknowledgment for missing message dropped");
            return Ok(None);
        };
        self.directory.authorize(&caller, &message.target)?;
        if message.sender_id == caller.identity {
            return Ok(None);
        }

        let _target = self.target_locks.lock(&message.target).await;
        let outcome = match self.messages.advance_state(message_id, state) {
            Ok(outcome) => outcome,
            // Deleted along with its conversation since the lookup.
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if outcome.changed {
            let event = ServerEvent::StatusUpdated {
                message_id,
                room: message.target,
                state: outcome.message.delivery_state,
            };
            self.presence
                .broadcast(&message.target, &event, |_, _| false)
                .await;
        }
        Ok(Some(outcome))
    }

    async fn origin(&self, connection: ConnectionId) -> Result<Caller> {
        self.presence
            .caller_of(connection)
            .await
            .ok_or_else(|| EngineError::not_found(format!("connection {connection}")))
    }

    /// Members of a DIRECT room who blocked the sender. Channels and groups
    /// are never suppressed. A lookup failure suppresses nobody.
    fn suppressed_recipients(&self, sender: &IdentityId, target: &RoomId) -> BTreeSet<IdentityId> {
        let members = match self.directory.direct_members(target) {
            Ok(Some(members)) => members,
            Ok(None) => return BTreeSet::new(),
            Err(e) => {
                warn!(target = %target, error = %e, "block lookup failed, not suppressing");
                return BTreeSet::new();
            }
        };

        members
            .into_iter()
            .filter(|member| member != sender)
            .filter(|member| match self.blocks.is_blocked(member, sender) {
                Ok(blocked) => blocked,
                Err(e) => {
                    warn!(member = %member, error = %e, "block lookup failed, not suppressing");
                    false
                }
            })
            .collect()
    }
}
