//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the
//! HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use enclave_shared::types::{
    ChannelId, ConversationId, ConversationKind, DomainId, IdentityId, RoomId, Role,
};

/// Messages are stored in exactly the shape they travel over the wire.
pub use enclave_shared::protocol::ChatMessage as Message;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// What the session collaborator last told us about an identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: IdentityId,
    pub domain: DomainId,
    pub display_name: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A DIRECT or GROUP conversation. Channels live in their own table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Present for groups, absent for direct conversations.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every appended message.
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    pub fn room(&self) -> RoomId {
        RoomId::Conversation(self.id)
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub conversation_id: ConversationId,
    pub identity_id: IdentityId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    /// Set when the member left or was removed; `None` while current.
    pub left_at: Option<DateTime<Utc>>,
}

impl Membership {
    pub fn is_current(&self) -> bool {
        self.left_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A domain-wide channel. Every identity of the domain may read and post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub domain: DomainId,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Channel {
    pub fn room(&self) -> RoomId {
        RoomId::Channel(self.id)
    }
}

// ---------------------------------------------------------------------------
// Message input
// ---------------------------------------------------------------------------

/// Everything the caller supplies for an append; the store assigns the rest.
#[derive(Debug, Clone, Copy)]
pub struct NewMessage<'a> {
    pub target: RoomId,
    pub sender_id: &'a IdentityId,
    pub body: &'a str,
    pub client_ref: Option<&'a str>,
}
