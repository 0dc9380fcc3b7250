use std::collections::BTreeSet;

use enclave_shared::types::{ConversationId, IdentityId, Role};
use enclave_store::{Database, Membership, StoreError};

use crate::error::{EngineError, Result};

/// Current membership of DIRECT and GROUP conversations.
///
/// Borrowed from a database handle inside a `SharedDatabase::with` closure,
/// so it never outlives the caller's exclusive access. Mutations happen only
/// in the Directory while it holds the conversation's lock.
pub struct MembershipStore<'a> {
    db: &'a Database,
}

impl<'a> MembershipStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn is_member(&self, conversation: ConversationId, identity: &IdentityId) -> Result<bool> {
        Ok(self.db.is_member(conversation, identity)?)
    }

    /// Adding a current member returns their row unchanged; a departed
    /// member is revived with `role`.
    pub fn add(
        &self,
        conversation: ConversationId,
        identity: &IdentityId,
        role: Role,
    ) -> Result<Membership> {
        self.db
            .add_membership(conversation, identity, role)
            .map_err(|e| match e {
                StoreError::NotFound => EngineError::not_found(format!("conversation {conversation}")),
                other => other.into(),
            })
    }

    /// Fails with `NotFound` when `identity` is not a current member.
    pub fn remove(&self, conversation: ConversationId, identity: &IdentityId) -> Result<()> {
        self.db
            .remove_membership(conversation, identity)
            .map_err(|e| match e {
                StoreError::NotFound => {
                    EngineError::not_found(format!("{identity} in conversation {conversation}"))
                }
                other => other.into(),
            })
    }

    pub fn members_of(&self, conversation: ConversationId) -> Result<BTreeSet<IdentityId>> {
        Ok(self.db.current_members(conversation)?)
    }

    pub fn count(&self, conversation: ConversationId) -> Result<usize> {
        Ok(self.db.member_count(conversation)?)
    }

    /// Current members with their roles, longest-standing first.
    pub fn memberships(&self, conversation: ConversationId) -> Result<Vec<Membership>> {
        Ok(self.db.current_memberships(conversation)?)
    }

    /// Role of a current member, `None` for non-members.
    pub fn role_of(&self, conversation: ConversationId, identity: &IdentityId) -> Result<Option<Role>> {
        Ok(self
            .db
            .membership(conversation, identity)?
            .filter(Membership::is_current)
            .map(|m| m.role))
    }

    pub fn set_role(&self, conversation: ConversationId, identity: &IdentityId, role: Role) -> Result<()> {
        Ok(self.db.set_role(conversation, identity, role)?)
    }
}
