//! Conversation Directory: the single authority for creating conversations,
//! resolving the one DIRECT conversation of a pair, and changing membership.
//!
//! Membership changes of one conversation are serialized on a keyed lock so
//! that "remove, then count, then maybe destroy" cannot interleave with a
//! concurrent removal or resurrection. Direct resolution additionally holds
//! a lock on the unordered identity pair, which makes two concurrent
//! `create_or_resolve_direct` calls for the same pair produce one
//! conversation.

use std::collections::BTreeSet;

use serde::Serialize;

use enclave_shared::constants::MAX_NAME_CHARS;
use enclave_shared::types::{Caller, ConversationId, ConversationKind, IdentityId, Role, RoomId};
use enclave_store::{Channel, Conversation, Database, Identity, Membership, StoreError};

use crate::db::SharedDatabase;
use crate::error::{EngineError, Result};
use crate::locks::KeyedLocks;
use crate::membership::MembershipStore;

/// Decides whether a caller may see a room.
pub trait RoomAccess: Send + Sync {
    /// `NotFound` when the room does not exist, `Forbidden` when the caller
    /// is not a current member (conversation) or not of the owning domain
    /// (channel).
    fn authorize(&self, caller: &Caller, room: &RoomId) -> Result<()>;
}

/// A conversation with its current members.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub members: Vec<Membership>,
}

/// Everything an identity can currently see.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationList {
    pub conversations: Vec<ConversationSummary>,
    pub channels: Vec<Channel>,
}

/// What happened to a conversation after a member was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Departure {
    /// The conversation lives on for the remaining members.
    Detached { remaining: usize },
    /// The last member left; the conversation and its messages are gone.
    Destroyed,
}

pub struct Directory {
    db: SharedDatabase,
    pair_locks: KeyedLocks<(IdentityId, IdentityId)>,
    conversation_locks: KeyedLocks<ConversationId>,
    default_channels: Vec<String>,
}

impl Directory {
    pub fn new(db: SharedDatabase, default_channels: Vec<String>) -> Self {
        Self {
            db,
            pair_locks: KeyedLocks::new(),
            conversation_locks: KeyedLocks::new(),
            default_channels,
        }
    }

    /// Record the caller as seen. The first identity of a domain seeds the
    /// domain's default channels.
    pub fn register(&self, caller: &Caller) -> Result<Identity> {
        self.db.with(|db| {
            let domain_seen = db.domain_known(&caller.domain)?;
            let identity = db.upsert_identity(
                &caller.identity,
                &caller.domain,
                caller.display_name.as_deref(),
            )?;
            if !domain_seen {
                let names: Vec<&str> = self.default_channels.iter().map(String::as_str).collect();
                db.ensure_channels(&caller.domain, &names)?;
            }
            Ok(identity)
        })
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Return the DIRECT conversation between the requester and `peer`.
    ///
    /// 1. An existing conversation whose current members are exactly the
    ///    pair is returned unchanged.
    /// 2. A conversation one of them left is revived by re-adding the
    ///    absent side, history intact.
    /// 3. Otherwise a new conversation is created.
    pub async fn create_or_resolve_direct(
        &self,
        requester: &Caller,
        peer: &IdentityId,
    ) -> Result<ConversationSummary> {
        if *peer == requester.identity {
            return Err(EngineError::invalid(
                "a direct conversation needs two different identities",
            ));
        }
        self.db.with(|db| colleague(db, requester, peer).map(drop))?;

        let pair = if requester.identity <= *peer {
            (requester.identity.clone(), peer.clone())
        } else {
            (peer.clone(), requester.identity.clone())
        };
        let _pair = self.pair_locks.lock(&pair).await;

        let existing = self
            .db
            .with(|db| Ok(db.find_direct_between(&requester.identity, peer)?))?;
        if let Some(conversation) = existing {
            return self.summarize(conversation);
        }

        // Either side may be the one that left.
        for (present, absent) in [(peer, &requester.identity), (&requester.identity, peer)] {
            let candidate = self
                .db
                .with(|db| Ok(db.find_direct_to_resurrect(present, absent)?))?;
            let Some(candidate) = candidate else {
                continue;
            };

            let _conversation = self.conversation_locks.lock(&candidate.id).await;
            let revived = self.db.with(|db| {
                match db.find_direct_to_resurrect(present, absent)? {
                    Some(current) if current.id == candidate.id => {
                        MembershipStore::new(db).add(current.id, absent, Role::Member)?;
                        Ok(Some(current))
                    }
                    // Destroyed or changed while we waited for the lock.
                    _ => Ok(None),
                }
            })?;

            if let Some(conversation) = revived {
                tracing::info!(
                    conversation = %conversation.id,
                    identity = %absent,
                    "resurrected direct conversation"
                );
                return self.summarize(conversation);
            }
        }

        let conversation = self.db.with(|db| {
            Ok(db.create_conversation(
                ConversationKind::Direct,
                None,
                &[
                    (requester.identity.clone(), Role::Member),
                    (peer.clone(), Role::Member),
                ],
            )?)
        })?;
        tracing::info!(conversation = %conversation.id, "created direct conversation");
        self.summarize(conversation)
    }

    /// Create a GROUP with the creator as ADMIN and every other participant
    /// as MEMBER.
    pub fn create_group(
        &self,
        creator: &Caller,
        name: &str,
        participants: &[IdentityId],
    ) -> Result<ConversationSummary> {
        let name = validate_name(name)?;
        let invited: BTreeSet<&IdentityId> = participants
            .iter()
            .filter(|p| **p != creator.identity)
            .collect();
        if invited.is_empty() {
            return Err(EngineError::invalid(
                "a group needs at least one participant besides its creator",
            ));
        }

        let conversation = self.db.with(|db| {
            for participant in &invited {
                colleague(db, creator, participant)?;
            }
            let mut members = vec![(creator.identity.clone(), Role::Admin)];
            members.extend(invited.iter().map(|p| ((*p).clone(), Role::Member)));
            Ok(db.create_conversation(ConversationKind::Group, Some(name), &members)?)
        })?;

        tracing::info!(
            conversation = %conversation.id,
            members = invited.len() + 1,
            "created group"
        );
        self.summarize(conversation)
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove the requester from a conversation of any kind. The last
    /// member out destroys it.
    pub async fn delete(&self, id: ConversationId, requester: &Caller) -> Result<Departure> {
        let _guard = self.conversation_locks.lock(&id).await;
        self.db.with(|db| {
            let conversation = load_conversation(db, id)?;
            require_member(db, &conversation, &requester.identity)?;
            depart(db, &conversation, &requester.identity)
        })
    }

    pub async fn leave_group(&self, id: ConversationId, requester: &Caller) -> Result<Departure> {
        let _guard = self.conversation_locks.lock(&id).await;
        self.db.with(|db| {
            let conversation = load_conversation(db, id)?;
            require_group(&conversation)?;
            require_member(db, &conversation, &requester.identity)?;
            depart(db, &conversation, &requester.identity)
        })
    }

    /// ADMIN-only removal of another member.
    pub async fn remove_member(
        &self,
        id: ConversationId,
        requester: &Caller,
        member: &IdentityId,
    ) -> Result<Departure> {
        let _guard = self.conversation_locks.lock(&id).await;
        self.db.with(|db| {
            let conversation = load_conversation(db, id)?;
            require_group(&conversation)?;
            require_admin(db, &conversation, &requester.identity)?;
            if !MembershipStore::new(db).is_member(id, member)? {
                return Err(EngineError::not_found(format!(
                    "{member} in conversation {id}"
                )));
            }
            depart(db, &conversation, member)
        })
    }

    /// ADMIN-only addition. Adding a current member returns their row.
    pub async fn add_member(
        &self,
        id: ConversationId,
        requester: &Caller,
        member: &IdentityId,
    ) -> Result<Membership> {
        let _guard = self.conversation_locks.lock(&id).await;
        self.db.with(|db| {
            let conversation = load_conversation(db, id)?;
            require_group(&conversation)?;
            require_admin(db, &conversation, &requester.identity)?;
            colleague(db, requester, member)?;
            let membership = MembershipStore::new(db).add(id, member, Role::Member)?;
            tracing::info!(conversation = %id, member = %member, "member added");
            Ok(membership)
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current conversations, most recently active first, plus the
    /// caller's domain channels.
    pub fn conversations_for(&self, caller: &Caller) -> Result<ConversationList> {
        self.db.with(|db| {
            let mut conversations = Vec::new();
            for conversation in db.list_conversations_for(&caller.identity)? {
                let members = MembershipStore::new(db).memberships(conversation.id)?;
                conversations.push(ConversationSummary {
                    conversation,
                    members,
                });
            }
            let channels = db.list_channels(&caller.domain)?;
            Ok(ConversationList {
                conversations,
                channels,
            })
        })
    }

    /// Current members of a DIRECT room, `None` for any other room.
    pub fn direct_members(&self, room: &RoomId) -> Result<Option<BTreeSet<IdentityId>>> {
        let Some(id) = room.conversation() else {
            return Ok(None);
        };
        self.db.with(|db| {
            let conversation = load_conversation(db, id)?;
            if conversation.kind != ConversationKind::Direct {
                return Ok(None);
            }
            Ok(Some(MembershipStore::new(db).members_of(id)?))
        })
    }

    pub fn list_channels(&self, caller: &Caller) -> Result<Vec<Channel>> {
        self.db.with(|db| Ok(db.list_channels(&caller.domain)?))
    }

    pub fn create_channel(
        &self,
        caller: &Caller,
        name: &str,
        description: Option<&str>,
    ) -> Result<Channel> {
        let name = validate_name(name)?;
        let description = description.map(str::trim).filter(|d| !d.is_empty());
        let channel = self
            .db
            .with(|db| Ok(db.create_channel(&caller.domain, name, description)?))?;
        tracing::info!(channel = %channel.id, domain = %caller.domain, "created channel");
        Ok(channel)
    }

    /// Current members with their roles, visible to members only.
    pub fn members(&self, caller: &Caller, id: ConversationId) -> Result<Vec<Membership>> {
        self.db.with(|db| {
            let conversation = load_conversation(db, id)?;
            require_member(db, &conversation, &caller.identity)?;
            MembershipStore::new(db).memberships(id)
        })
    }

    fn summarize(&self, conversation: Conversation) -> Result<ConversationSummary> {
        let members = self
            .db
            .with(|db| MembershipStore::new(db).memberships(conversation.id))?;
        Ok(ConversationSummary {
            conversation,
            members,
        })
    }
}

impl RoomAccess for Directory {
    fn authorize(&self, caller: &Caller, room: &RoomId) -> Result<()> {
        self.db.with(|db| match room {
            RoomId::Conversation(id) => {
                let conversation = load_conversation(db, *id)?;
                require_member(db, &conversation, &caller.identity)
            }
            RoomId::Channel(id) => {
                let channel = db.get_channel(*id).map_err(|e| match e {
                    StoreError::NotFound => EngineError::not_found(room),
                    other => other.into(),
                })?;
                if channel.domain != caller.domain {
                    return Err(EngineError::forbidden(format!(
                        "{} is not part of channel {id}",
                        caller.identity
                    )));
                }
                Ok(())
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers (run inside one database closure)
// ---------------------------------------------------------------------------

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::invalid("name is empty"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(EngineError::invalid(format!(
            "name exceeds {MAX_NAME_CHARS} characters"
        )));
    }
    Ok(name)
}

/// A known identity of the caller's own domain.
fn colleague(db: &Database, caller: &Caller, id: &IdentityId) -> Result<Identity> {
    let identity = db
        .find_identity(id)?
        .ok_or_else(|| EngineError::not_found(format!("identity {id}")))?;
    if identity.domain != caller.domain {
        return Err(EngineError::forbidden(format!(
            "{id} belongs to another domain"
        )));
    }
    Ok(identity)
}

fn load_conversation(db: &Database, id: ConversationId) -> Result<Conversation> {
    db.get_conversation(id).map_err(|e| match e {
        StoreError::NotFound => EngineError::not_found(format!("conversation {id}")),
        other => other.into(),
    })
}

fn require_group(conversation: &Conversation) -> Result<()> {
    if conversation.kind != ConversationKind::Group {
        return Err(EngineError::invalid(format!(
            "conversation {} is not a group",
            conversation.id
        )));
    }
    Ok(())
}

fn require_member(db: &Database, conversation: &Conversation, identity: &IdentityId) -> Result<()> {
    if !MembershipStore::new(db).is_member(conversation.id, identity)? {
        return Err(EngineError::forbidden(format!(
            "{identity} is not a member of conversation {}",
            conversation.id
        )));
    }
    Ok(())
}

fn require_admin(db: &Database, conversation: &Conversation, identity: &IdentityId) -> Result<()> {
    match MembershipStore::new(db).role_of(conversation.id, identity)? {
        Some(Role::Admin) => Ok(()),
        Some(_) => Err(EngineError::forbidden(format!(
            "{identity} is not an admin of conversation {}",
            conversation.id
        ))),
        _ => Err(EngineError::forbidden(format!(
            "{identity} is not a member of conversation {}",
            conversation.id
        ))),
    }
}

/// Remove `identity`, destroy the conversation if nobody is left, and keep
/// a group administrable. All of it commits or none of it does.
fn depart(db: &Database, conversation: &Conversation, identity: &IdentityId) -> Result<Departure> {
    db.atomically(|db| depart_in(db, conversation, identity))
}

fn depart_in(db: &Database, conversation: &Conversation, identity: &IdentityId) -> Result<Departure> {
    let members = MembershipStore::new(db);
    members.remove(conversation.id, identity)?;
    let remaining = members.count(conversation.id)?;

    if remaining == 0 {
        db.delete_conversation(conversation.id)?;
        tracing::info!(conversation = %conversation.id, "conversation destroyed");
        return Ok(Departure::Destroyed);
    }

    if conversation.kind == ConversationKind::Group {
        let current = members.memberships(conversation.id)?;
        if !current.iter().any(|m| m.role == Role::Admin) {
            if let Some(oldest) = current.first() {
                members.set_role(conversation.id, &oldest.identity_id, Role::Admin)?;
                tracing::info!(
                    conversation = %conversation.id,
                    identity = %oldest.identity_id,
                    "promoted longest-standing member to admin"
                );
            }
        }
    }

    tracing::debug!(
        conversation = %conversation.id,
        identity = %identity,
        remaining,
        "member departed"
    );
    Ok(Departure::Detached { remaining })
}
