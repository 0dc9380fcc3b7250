use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_ID_CHARS;
use crate::error::ParseError;

// ---------------------------------------------------------------------------
// Opaque ids supplied by the identity collaborator
// ---------------------------------------------------------------------------

fn validate_opaque(raw: &str) -> Result<(), ParseError> {
    if raw.is_empty() || raw.chars().count() > MAX_ID_CHARS || raw.chars().any(char::is_control) {
        return Err(ParseError::InvalidId(raw.to_string()));
    }
    Ok(())
}

/// Identity of an employee, issued by the session collaborator.
/// The core never interprets it beyond equality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ParseError> {
        let raw = raw.into();
        validate_opaque(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdentityId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdentityId> for String {
    fn from(id: IdentityId) -> Self {
        id.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verified email domain an identity belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct DomainId(String);

impl DomainId {
    /// Domains compare case-insensitively, so they are stored lowercased.
    pub fn new(raw: impl Into<String>) -> Result<Self, ParseError> {
        let raw = raw.into().trim().to_ascii_lowercase();
        validate_opaque(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DomainId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DomainId> for String {
    fn from(id: DomainId) -> Self {
        id.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The verified caller of a request or owner of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: IdentityId,
    pub domain: DomainId,
    pub display_name: Option<String>,
}

impl Caller {
    pub fn new(identity: IdentityId, domain: DomainId) -> Self {
        Self {
            identity,
            domain,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Server-issued ids
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| ParseError::InvalidId(s.to_string()))
            }
        }
    };
}

uuid_id!(
    /// A DIRECT or GROUP conversation.
    ConversationId
);
uuid_id!(
    /// A domain-wide channel.
    ChannelId
);
uuid_id!(MessageId);
uuid_id!(
    /// One live client connection. Only meaningful inside the process.
    ConnectionId
);

/// A fanout target: exactly one of a conversation or a channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomId {
    Conversation(ConversationId),
    Channel(ChannelId),
}

impl RoomId {
    pub fn conversation(&self) -> Option<ConversationId> {
        match self {
            RoomId::Conversation(id) => Some(*id),
            RoomId::Channel(_) => None,
        }
    }

    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            RoomId::Channel(id) => Some(*id),
            RoomId::Conversation(_) => None,
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::Conversation(id) => write!(f, "conversation:{id}"),
            RoomId::Channel(id) => write!(f, "channel:{id}"),
        }
    }
}

impl From<ConversationId> for RoomId {
    fn from(id: ConversationId) -> Self {
        RoomId::Conversation(id)
    }
}

impl From<ChannelId> for RoomId {
    fn from(id: ChannelId) -> Self {
        RoomId::Channel(id)
    }
}

// ---------------------------------------------------------------------------
// Enumerations persisted as text
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
    /// Domain-scoped, membership is implicit.
    Channel,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
            ConversationKind::Channel => "channel",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            "channel" => Ok(Self::Channel),
            other => Err(ParseError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Self::Member),
            "admin" => Ok(Self::Admin),
            other => Err(ParseError::UnknownRole(other.to_string())),
        }
    }
}

/// Per-message delivery lifecycle. Variant order is the transition order,
/// so `Ord` answers "is this state at or past that one".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
        }
    }
}

impl FromStr for DeliveryState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(ParseError::UnknownDeliveryState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
        }
    }
}

impl FromStr for MessageType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            other => Err(ParseError::UnknownMessageType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_state_order() {
        assert!(DeliveryState::Sent < DeliveryState::Delivered);
        assert!(DeliveryState::Delivered < DeliveryState::Read);
        assert_eq!(
            DeliveryState::Read.max(DeliveryState::Delivered),
            DeliveryState::Read
        );
    }

    #[test]
    fn test_enum_text_forms() {
        for state in [DeliveryState::Sent, DeliveryState::Delivered, DeliveryState::Read] {
            assert_eq!(state.as_str().parse::<DeliveryState>().unwrap(), state);
        }
        assert_eq!("group".parse::<ConversationKind>().unwrap(), ConversationKind::Group);
        assert!(matches!(
            "broadcast".parse::<ConversationKind>(),
            Err(ParseError::UnknownKind(_))
        ));
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_identity_id_rejects_blank_and_oversized() {
        assert!(IdentityId::new("").is_err());
        assert!(IdentityId::new("a\nb").is_err());
        assert!(IdentityId::new("x".repeat(MAX_ID_CHARS + 1)).is_err());
        assert_eq!(IdentityId::new("u-42").unwrap().as_str(), "u-42");
    }

    #[test]
    fn test_domain_is_lowercased() {
        let domain = DomainId::new("  Example.COM ").unwrap();
        assert_eq!(domain.as_str(), "example.com");
    }

    #[test]
    fn test_identity_id_deserialize_validates() {
        let ok: IdentityId = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(ok.as_str(), "alice");
        assert!(serde_json::from_str::<IdentityId>("\"\"").is_err());
    }

    #[test]
    fn test_room_id_json_shape() {
        let id = ConversationId::new();
        let room = RoomId::Conversation(id);
        let json = serde_json::to_value(room).unwrap();
        assert_eq!(json, serde_json::json!({ "conversation": id.0.to_string() }));

        let back: RoomId = serde_json::from_value(json).unwrap();
        assert_eq!(back, room);
        assert_eq!(back.conversation(), Some(id));
        assert_eq!(back.channel(), None);
    }
}
