//! Presence Registry: which live connection is subscribed to which room.
//!
//! Process-local and rebuilt from explicit joins after every reconnect.
//! Each connection owns a bounded outbound queue; a full queue drops the
//! event for that connection only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use enclave_shared::protocol::ServerEvent;
use enclave_shared::types::{Caller, ConnectionId, IdentityId, RoomId};

use crate::directory::RoomAccess;
use crate::error::{EngineError, Result};

/// Returned by [`PresenceRegistry::connect`]; the transport drains `events`.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub events: mpsc::Receiver<ServerEvent>,
}

struct Connection {
    caller: Caller,
    outbound: mpsc::Sender<ServerEvent>,
    rooms: HashSet<RoomId>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    /// Bumped whenever access to a room is withdrawn from someone.
    revocations: HashMap<RoomId, u64>,
}

impl Registry {
    fn revision(&self, room: &RoomId) -> u64 {
        self.revocations.get(room).copied().unwrap_or(0)
    }

    fn revoke(&mut self, room: &RoomId) {
        *self.revocations.entry(*room).or_default() += 1;
    }

    fn unsubscribe(&mut self, connection: ConnectionId, room: &RoomId) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(members) => members.remove(&connection),
            None => false,
        };
        if self.rooms.get(room).is_some_and(HashSet::is_empty) {
            self.rooms.remove(room);
        }
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.rooms.remove(room);
        }
        removed
    }
}

#[derive(Clone)]
pub struct PresenceRegistry {
    state: Arc<RwLock<Registry>>,
    access: Arc<dyn RoomAccess>,
    capacity: usize,
}

impl PresenceRegistry {
    pub fn new(access: Arc<dyn RoomAccess>, capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(Registry::default())),
            access,
            capacity: capacity.max(1),
        }
    }

    /// Register a live connection for an already verified caller.
    pub async fn connect(&self, caller: Caller) -> ConnectionHandle {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = ConnectionId::new();

        let mut state = self.state.write().await;
        info!(
            connection = %id,
            identity = %caller.identity,
            connections = state.connections.len() + 1,
            "connection registered"
        );
        state.connections.insert(
            id,
            Connection {
                caller,
                outbound: tx,
                rooms: HashSet::new(),
            },
        );

        ConnectionHandle { id, events: rx }
    }

    /// Subscribe a connection to a room on behalf of its owner. Returns
    /// `false` if it was already subscribed.
    ///
    /// Access is checked without holding the registry lock. If the room saw
    /// an eviction or was closed meanwhile, the check is repeated.
    pub async fn join(&self, connection: ConnectionId, room: RoomId) -> Result<bool> {
        loop {
            let (caller, revision) = {
                let state = self.state.read().await;
                let conn = state
                    .connections
                    .get(&connection)
                    .ok_or_else(|| EngineError::not_found(format!("connection {connection}")))?;
                (conn.caller.clone(), state.revision(&room))
            };

            self.access.authorize(&caller, &room)?;

            let mut state = self.state.write().await;
            if state.revision(&room) != revision {
                debug!(connection = %connection, room = %room, "access revoked during join, rechecking");
                continue;
            }
            let Some(conn) = state.connections.get_mut(&connection) else {
                return Err(EngineError::not_found(format!("connection {connection}")));
            };
            conn.rooms.insert(room);
            let newly = state.rooms.entry(room).or_default().insert(connection);
            if newly {
                debug!(connection = %connection, room = %room, "joined room");
            }
            return Ok(newly);
        }
    }

    pub async fn leave(&self, connection: ConnectionId, room: &RoomId) -> bool {
        self.state.write().await.unsubscribe(connection, room)
    }

    pub async fn connections_in_room(&self, room: &RoomId) -> HashSet<ConnectionId> {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget the connection and every room it joined. Membership is not
    /// touched.
    pub async fn on_disconnect(&self, connection: ConnectionId) {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.remove(&connection) else {
            return;
        };
        for room in &conn.rooms {
            if let Some(members) = state.rooms.get_mut(room) {
                members.remove(&connection);
                if members.is_empty() {
                    state.rooms.remove(room);
                }
            }
        }
        info!(
            connection = %connection,
            identity = %conn.caller.identity,
            rooms = conn.rooms.len(),
            "connection closed"
        );
    }

    /// Unsubscribe every connection of `identity` from `room` and tell them.
    pub async fn evict_identity(&self, identity: &IdentityId, room: &RoomId) -> usize {
        let mut state = self.state.write().await;
        state.revoke(room);
        let targets: Vec<ConnectionId> = state
            .rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter(|id| {
                state
                    .connections
                    .get(*id)
                    .is_some_and(|c| c.caller.identity == *identity)
            })
            .copied()
            .collect();

        for id in &targets {
            state.unsubscribe(*id, room);
            if let Some(conn) = state.connections.get(id) {
                deliver(*id, &conn.outbound, ServerEvent::Left { room: *room });
            }
        }
        targets.len()
    }

    /// Drop a room that no longer exists, telling every subscriber.
    pub async fn close_room(&self, room: &RoomId) {
        let mut state = self.state.write().await;
        state.revoke(room);
        let Some(members) = state.rooms.remove(room) else {
            return;
        };
        for id in members {
            if let Some(conn) = state.connections.get_mut(&id) {
                conn.rooms.remove(room);
                deliver(id, &conn.outbound, ServerEvent::Left { room: *room });
            }
        }
        debug!(room = %room, "room closed");
    }

    pub async fn caller_of(&self, connection: ConnectionId) -> Option<Caller> {
        self.state
            .read()
            .await
            .connections
            .get(&connection)
            .map(|c| c.caller.clone())
    }

    /// Queue an event for one connection.
    pub async fn send_to(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        let state = self.state.read().await;
        match state.connections.get(&connection) {
            Some(conn) => deliver(connection, &conn.outbound, event),
            None => false,
        }
    }

    /// Queue an event for every connection in `room` except those `skip`
    /// selects. Returns how many connections accepted it.
    pub async fn broadcast<F>(&self, room: &RoomId, event: &ServerEvent, skip: F) -> usize
    where
        F: Fn(ConnectionId, &Caller) -> bool,
    {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members {
            let Some(conn) = state.connections.get(id) else {
                continue;
            };
            if skip(*id, &conn.caller) {
                continue;
            }
            if deliver(*id, &conn.outbound, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

fn deliver(connection: ConnectionId, outbound: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
    match outbound.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(connection = %connection, "dropping event for slow connection");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(connection = %connection, "connection already closed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc as std_mpsc, Mutex as StdMutex};

    use enclave_shared::types::{ChannelId, ConversationId, DomainId};
    use tokio::sync::oneshot;

    /// Grants every room except the ones listed.
    struct Rooms {
        denied: HashSet<RoomId>,
    }

    impl RoomAccess for Rooms {
        fn authorize(&self, caller: &Caller, room: &RoomId) -> Result<()> {
            if self.denied.contains(room) {
                return Err(EngineError::forbidden(format!("{} may not join", caller.identity)));
            }
            Ok(())
        }
    }

    fn registry(denied: &[RoomId], capacity: usize) -> PresenceRegistry {
        let access = Rooms {
            denied: denied.iter().copied().collect(),
        };
        PresenceRegistry::new(Arc::new(access), capacity)
    }

    fn caller(id: &str) -> Caller {
        Caller::new(IdentityId::new(id).unwrap(), DomainId::new("acme.io").unwrap())
    }

    #[tokio::test]
    async fn join_is_idempotent_and_checked() {
        let secret = RoomId::Conversation(ConversationId::new());
        let open = RoomId::Channel(ChannelId::new());
        let presence = registry(&[secret], 8);
        let conn = presence.connect(caller("alice")).await;

        assert!(presence.join(conn.id, open).await.unwrap());
        assert!(!presence.join(conn.id, open).await.unwrap());
        assert_eq!(presence.connections_in_room(&open).await.len(), 1);

        let err = presence.join(conn.id, secret).await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(presence.connections_in_room(&secret).await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_clears_every_room() {
        let presence = registry(&[], 8);
        let a = RoomId::Channel(ChannelId::new());
        let b = RoomId::Conversation(ConversationId::new());
        let conn = presence.connect(caller("alice")).await;
        let other = presence.connect(caller("alice")).await;

        presence.join(conn.id, a).await.unwrap();
        presence.join(conn.id, b).await.unwrap();
        presence.join(other.id, b).await.unwrap();

        presence.on_disconnect(conn.id).await;
        assert!(presence.connections_in_room(&a).await.is_empty());
        assert_eq!(
            presence.connections_in_room(&b).await,
            HashSet::from([other.id])
        );
        assert_eq!(presence.connection_count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_stays_in_room_and_honours_skip() {
        let presence = registry(&[], 8);
        let room = RoomId::Channel(ChannelId::new());
        let elsewhere = RoomId::Channel(ChannelId::new());

        let origin = presence.connect(caller("alice")).await;
        let mut peer = presence.connect(caller("bob")).await;
        let mut outsider = presence.connect(caller("carol")).await;
        presence.join(origin.id, room).await.unwrap();
        presence.join(peer.id, room).await.unwrap();
        presence.join(outsider.id, elsewhere).await.unwrap();

        let sent = presence
            .broadcast(&room, &ServerEvent::Pong, |id, _| id == origin.id)
            .await;
        assert_eq!(sent, 1);
        assert_eq!(peer.events.try_recv().unwrap(), ServerEvent::Pong);
        assert!(outsider.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let presence = registry(&[], 1);
        let room = RoomId::Channel(ChannelId::new());
        let mut slow = presence.connect(caller("bob")).await;
        presence.join(slow.id, room).await.unwrap();

        assert_eq!(presence.broadcast(&room, &ServerEvent::Pong, |_, _| false).await, 1);
        assert_eq!(presence.broadcast(&room, &ServerEvent::Pong, |_, _| false).await, 0);

        assert_eq!(slow.events.try_recv().unwrap(), ServerEvent::Pong);
        assert!(slow.events.try_recv().is_err());
    }

    /// Parks the first check until released, then answers from `revoked`.
    struct Gate {
        entered: StdMutex<Option<oneshot::Sender<()>>>,
        release: StdMutex<std_mpsc::Receiver<()>>,
        revoked: AtomicBool,
    }

    impl RoomAccess for Gate {
        fn authorize(&self, caller: &Caller, _room: &RoomId) -> Result<()> {
            if let Some(entered) = self.entered.lock().unwrap().take() {
                let _ = entered.send(());
                let _ = self.release.lock().unwrap().recv();
            }
            if self.revoked.load(Ordering::SeqCst) {
                return Err(EngineError::forbidden(format!("{} was removed", caller.identity)));
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn eviction_during_join_check_is_not_undone() {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let gate = Arc::new(Gate {
            entered: StdMutex::new(Some(entered_tx)),
            release: StdMutex::new(release_rx),
            revoked: AtomicBool::new(false),
        });
        let presence = PresenceRegistry::new(gate.clone(), 8);
        let room = RoomId::Conversation(ConversationId::new());
        let conn = presence.connect(caller("alice")).await;

        let joining = tokio::spawn({
            let presence = presence.clone();
            let id = conn.id;
            async move { presence.join(id, room).await }
        });
        entered_rx.await.unwrap();

        // The registry stays usable while the check is parked.
        gate.revoked.store(true, Ordering::SeqCst);
        presence
            .evict_identity(&IdentityId::new("alice").unwrap(), &room)
            .await;
        release_tx.send(()).unwrap();

        let err = joining.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(presence.connections_in_room(&room).await.is_empty());
    }

    #[tokio::test]
    async fn eviction_targets_one_identity() {
        let presence = registry(&[], 8);
        let room = RoomId::Conversation(ConversationId::new());
        let mut alice_phone = presence.connect(caller("alice")).await;
        let mut alice_laptop = presence.connect(caller("alice")).await;
        let bob = presence.connect(caller("bob")).await;
        for id in [alice_phone.id, alice_laptop.id, bob.id] {
            presence.join(id, room).await.unwrap();
        }

        let evicted = presence
            .evict_identity(&IdentityId::new("alice").unwrap(), &room)
            .await;
        assert_eq!(evicted, 2);
        assert_eq!(presence.connections_in_room(&room).await, HashSet::from([bob.id]));
        assert_eq!(alice_phone.events.try_recv().unwrap(), ServerEvent::Left { room });
        assert_eq!(alice_laptop.events.try_recv().unwrap(), ServerEvent::Left { room });

        presence.close_room(&room).await;
        assert!(presence.connections_in_room(&room).await.is_empty());
    }
}
