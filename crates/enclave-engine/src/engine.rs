use std::sync::Arc;

use enclave_shared::constants::{
    DEFAULT_CHANNELS, DEFAULT_HISTORY_LIMIT, DEFAULT_OUTBOUND_QUEUE, MAX_HISTORY_LIMIT,
    MAX_MESSAGE_BYTES,
};
use enclave_shared::types::{
    Caller, ChannelId, ConnectionId, ConversationId, DeliveryState, IdentityId, MessageId, RoomId,
};
use enclave_shared::protocol::ServerEvent;
use enclave_store::{Channel, Database, Identity, Membership, Message};

use crate::contacts::StoreBlockList;
use crate::db::SharedDatabase;
use crate::directory::{ConversationList, ConversationSummary, Departure, Directory, RoomAccess};
use crate::error::Result;
use crate::messages::MessageStore;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::router::BroadcastRouter;

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub history_limit: u32,
    pub max_history_limit: u32,
    pub max_message_bytes: usize,
    pub outbound_queue: usize,
    /// Channels created for every newly seen domain.
    pub default_channels: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_history_limit: MAX_HISTORY_LIMIT,
            max_message_bytes: MAX_MESSAGE_BYTES,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            default_channels: DEFAULT_CHANNELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

struct Inner {
    config: EngineConfig,
    directory: Arc<Directory>,
    presence: PresenceRegistry,
    messages: MessageStore,
    blocks: StoreBlockList,
    router: BroadcastRouter,
}

/// Entry point used by the transport layer. Cheap to clone.
///
/// Removing someone from a conversation also unsubscribes their live
/// connections from its room, and destroying a conversation closes the room.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<Inner>,
}

impl ChatEngine {
    pub fn new(db: Database, config: EngineConfig) -> Self {
        let db = SharedDatabase::new(db);
        let directory = Arc::new(Directory::new(db.clone(), config.default_channels.clone()));
        let presence = PresenceRegistry::new(directory.clone(), config.outbound_queue);
        let messages = MessageStore::new(db.clone(), config.max_message_bytes);
        let blocks = StoreBlockList::new(db);
        let router = BroadcastRouter::new(
            directory.clone(),
            presence.clone(),
            messages.clone(),
            Arc::new(blocks.clone()),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                directory,
                presence,
                messages,
                blocks,
                router,
            }),
        }
    }

    /// Upsert the caller's identity; seeds channels for a new domain.
    pub fn register(&self, caller: &Caller) -> Result<Identity> {
        self.inner.directory.register(caller)
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub async fn create_or_resolve_direct(
        &self,
        requester: &Caller,
        peer: &IdentityId,
    ) -> Result<ConversationSummary> {
        self.inner
            .directory
            .create_or_resolve_direct(requester, peer)
            .await
    }

    pub fn create_group(
        &self,
        creator: &Caller,
        name: &str,
        participants: &[IdentityId],
    ) -> Result<ConversationSummary> {
        self.inner.directory.create_group(creator, name, participants)
    }

    pub fn conversations_for(&self, caller: &Caller) -> Result<ConversationList> {
        self.inner.directory.conversations_for(caller)
    }

    pub async fn delete_conversation(
        &self,
        requester: &Caller,
        id: ConversationId,
    ) -> Result<Departure> {
        let departure = self.inner.directory.delete(id, requester).await?;
        self.after_departure(id, &requester.identity, departure).await;
        Ok(departure)
    }

    pub async fn leave_group(&self, requester: &Caller, id: ConversationId) -> Result<Departure> {
        let departure = self.inner.directory.leave_group(id, requester).await?;
        self.after_departure(id, &requester.identity, departure).await;
        Ok(departure)
    }

    pub async fn remove_member(
        &self,
        requester: &Caller,
        id: ConversationId,
        member: &IdentityId,
    ) -> Result<Departure> {
        let departure = self.inner.directory.remove_member(id, requester, member).await?;
        self.after_departure(id, member, departure).await;
        Ok(departure)
    }

    pub async fn add_member(
        &self,
        requester: &Caller,
        id: ConversationId,
        member: &IdentityId,
    ) -> Result<Membership> {
        self.inner.directory.add_member(id, requester, member).await
    }

    /// Current members with their roles, visible to members only.
    pub fn members(&self, caller: &Caller, id: ConversationId) -> Result<Vec<Membership>> {
        self.inner.directory.members(caller, id)
    }

    /// The latest messages of a room the caller may see, oldest first.
    /// `limit` defaults to the configured page and is clamped to the
    /// configured maximum.
    pub fn history(&self, caller: &Caller, room: RoomId, limit: Option<u32>) -> Result<Vec<Message>> {
        self.inner.directory.authorize(caller, &room)?;
        let config = &self.inner.config;
        let limit = limit
            .unwrap_or(config.history_limit)
            .clamp(1, config.max_history_limit.max(1));
        self.inner.messages.history(&room, limit)
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub fn list_channels(&self, caller: &Caller) -> Result<Vec<Channel>> {
        self.inner.directory.list_channels(caller)
    }

    pub fn create_channel(
        &self,
        caller: &Caller,
        name: &str,
        description: Option<&str>,
    ) -> Result<Channel> {
        self.inner.directory.create_channel(caller, name, description)
    }

    pub fn channel_history(
        &self,
        caller: &Caller,
        id: ChannelId,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        self.history(caller, RoomId::Channel(id), limit)
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub fn block(&self, caller: &Caller, target: &IdentityId) -> Result<bool> {
        self.inner.blocks.block(&caller.identity, target)
    }

    pub fn unblock(&self, caller: &Caller, target: &IdentityId) -> Result<bool> {
        self.inner.blocks.unblock(&caller.identity, target)
    }

    // ------------------------------------------------------------------
    // Live connections
    // ------------------------------------------------------------------

    pub async fn connect(&self, caller: Caller) -> ConnectionHandle {
        self.inner.presence.connect(caller).await
    }

    /// Subscribe and confirm with `Joined`.
    pub async fn join(&self, connection: ConnectionId, room: RoomId) -> Result<()> {
        self.inner.presence.join(connection, room).await?;
        self.inner
            .presence
            .send_to(connection, ServerEvent::Joined { room })
            .await;
        Ok(())
    }

    /// Unsubscribe and confirm with `Left`.
    pub async fn leave(&self, connection: ConnectionId, room: RoomId) {
        self.inner.presence.leave(connection, &room).await;
        self.inner
            .presence
            .send_to(connection, ServerEvent::Left { room })
            .await;
    }

    pub async fn send(
        &self,
        connection: ConnectionId,
        target: RoomId,
        body: &str,
        client_ref: Option<String>,
    ) -> Result<Message> {
        self.inner
            .router
            .submit(connection, target, body, client_ref)
            .await
    }

    pub async fn acknowledge(
        &self,
        connection: ConnectionId,
        message_id: MessageId,
        state: DeliveryState,
    ) -> Result<()> {
        self.inner
            .router
            .acknowledge(connection, message_id, state)
            .await
            .map(drop)
    }

    /// Queue an event for a single connection.
    pub async fn notify(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        self.inner.presence.send_to(connection, event).await
    }

    pub async fn disconnect(&self, connection: ConnectionId) {
        self.inner.presence.on_disconnect(connection).await;
    }

    async fn after_departure(&self, id: ConversationId, identity: &IdentityId, departure: Departure) {
        let room = RoomId::Conversation(id);
        match departure {
            Departure::Destroyed => self.inner.presence.close_room(&room).await,
            Departure::Detached { .. } => {
                self.inner.presence.evict_identity(identity, &room).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_shared::types::DomainId;
    use futures::future::join_all;

    fn caller(id: &str) -> Caller {
        Caller::new(IdentityId::new(id).unwrap(), DomainId::new("eng.example").unwrap())
    }

    fn engine(config: EngineConfig) -> ChatEngine {
        ChatEngine::new(Database::open_in_memory().unwrap(), config)
    }

    #[tokio::test]
    async fn history_limit_is_defaulted_and_clamped() {
        let engine = engine(EngineConfig {
            history_limit: 2,
            max_history_limit: 3,
            ..EngineConfig::default()
        });
        let (alice, bob) = (caller("alice"), caller("bob"));
        engine.register(&alice).unwrap();
        engine.register(&bob).unwrap();

        let dm = engine.create_or_resolve_direct(&alice, &bob.identity).await.unwrap();
        let room = dm.conversation.room();
        let conn = engine.connect(alice.clone()).await;
        for n in 0..5 {
            engine.send(conn.id, room, &format!("m{n}"), None).await.unwrap();
        }

        assert_eq!(engine.history(&alice, room, None).unwrap().len(), 2);
        assert_eq!(engine.history(&alice, room, Some(100)).unwrap().len(), 3);
        let page = engine.history(&alice, room, Some(0)).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].body, "m4");

        let outsider = caller("carol");
        engine.register(&outsider).unwrap();
        assert_eq!(
            engine.history(&outsider, room, None).unwrap_err().code(),
            "forbidden"
        );
    }

    #[tokio::test]
    async fn removed_member_stops_receiving() {
        let engine = engine(EngineConfig::default());
        let (u1, u2, u3) = (caller("u1"), caller("u2"), caller("u3"));
        for c in [&u1, &u2, &u3] {
            engine.register(c).unwrap();
        }
        let group = engine
            .create_group(&u1, "eng", &[u2.identity.clone(), u3.identity.clone()])
            .unwrap();
        let room = group.conversation.room();

        let c1 = engine.connect(u1.clone()).await;
        let mut c3 = engine.connect(u3.clone()).await;
        engine.join(c1.id, room).await.unwrap();
        engine.join(c3.id, room).await.unwrap();
        assert_eq!(c3.events.try_recv().unwrap(), ServerEvent::Joined { room });

        engine.remove_member(&u1, group.conversation.id, &u3.identity).await.unwrap();
        assert_eq!(c3.events.try_recv().unwrap(), ServerEvent::Left { room });

        engine.send(c1.id, room, "after", None).await.unwrap();
        assert!(c3.events.try_recv().is_err());

        let rejoin = engine.join(c3.id, room).await;
        assert_eq!(rejoin.unwrap_err().code(), "forbidden");

        let members: Vec<_> = engine
            .members(&u1, group.conversation.id)
            .unwrap()
            .into_iter()
            .map(|m| m.identity_id)
            .collect();
        assert_eq!(members, vec![u1.identity.clone(), u2.identity.clone()]);
        assert_eq!(
            engine.members(&u3, group.conversation.id).unwrap_err().code(),
            "forbidden"
        );
    }

    #[tokio::test]
    async fn destroying_a_conversation_closes_its_room() {
        let engine = engine(EngineConfig::default());
        let (alice, bob) = (caller("alice"), caller("bob"));
        engine.register(&alice).unwrap();
        engine.register(&bob).unwrap();
        let dm = engine.create_or_resolve_direct(&alice, &bob.identity).await.unwrap();
        let id = dm.conversation.id;
        let room = dm.conversation.room();

        let mut b = engine.connect(bob.clone()).await;
        engine.join(b.id, room).await.unwrap();
        let _ = b.events.try_recv();

        engine.delete_conversation(&alice, id).await.unwrap();
        let outcome = engine.delete_conversation(&bob, id).await.unwrap();
        assert_eq!(outcome, Departure::Destroyed);
        assert_eq!(b.events.try_recv().unwrap(), ServerEvent::Left { room });

        let history = engine.history(&bob, room, None);
        assert_eq!(history.unwrap_err().code(), "not_found");
    }

    #[tokio::test]
    async fn channel_is_shared_by_the_domain() {
        let engine = engine(EngineConfig::default());
        let (alice, bob) = (caller("alice"), caller("bob"));
        engine.register(&alice).unwrap();
        engine.register(&bob).unwrap();

        let channels = engine.list_channels(&alice).unwrap();
        let names: Vec<_> = channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["general", "random"]);
        let general = channels[0].room();

        let a = engine.connect(alice.clone()).await;
        let mut b = engine.connect(bob.clone()).await;
        engine.join(a.id, general).await.unwrap();
        engine.join(b.id, general).await.unwrap();
        let _ = b.events.try_recv();

        engine.send(a.id, general, "hello all", None).await.unwrap();
        assert!(matches!(
            b.events.try_recv().unwrap(),
            ServerEvent::MessageReceived { .. }
        ));
        assert_eq!(
            engine.channel_history(&bob, channels[0].id, None).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn disconnect_keeps_membership() {
        let engine = engine(EngineConfig::default());
        let (alice, bob) = (caller("alice"), caller("bob"));
        engine.register(&alice).unwrap();
        engine.register(&bob).unwrap();
        let dm = engine.create_or_resolve_direct(&alice, &bob.identity).await.unwrap();

        let conn = engine.connect(alice.clone()).await;
        engine.join(conn.id, dm.conversation.room()).await.unwrap();
        engine.disconnect(conn.id).await;

        let listing = engine.conversations_for(&alice).unwrap();
        assert_eq!(listing.conversations.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_sends_keep_sequence_dense() {
        let engine = engine(EngineConfig::default());
        let (alice, bob) = (caller("alice"), caller("bob"));
        engine.register(&alice).unwrap();
        engine.register(&bob).unwrap();
        let dm = engine.create_or_resolve_direct(&alice, &bob.identity).await.unwrap();
        let room = dm.conversation.room();
        let a = engine.connect(alice.clone()).await;
        let b = engine.connect(bob.clone()).await;

        let sends = (0..20).map(|n| {
            let engine = engine.clone();
            let origin = if n % 2 == 0 { a.id } else { b.id };
            async move { engine.send(origin, room, &format!("m{n}"), None).await }
        });
        for result in join_all(sends).await {
            result.unwrap();
        }

        let seqs: Vec<i64> = engine
            .history(&alice, room, Some(50))
            .unwrap()
            .iter()
            .map(|m| m.seq)
            .collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    }
}
