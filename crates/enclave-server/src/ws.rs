//! Live connection endpoint.
//!
//! Each socket is registered with the engine as one connection. Client
//! frames are decoded as [`ClientEvent`]s and dispatched; everything the
//! engine queues for the connection is written back as JSON text frames.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use enclave_shared::protocol::{ClientEvent, ServerEvent};
use enclave_shared::types::{Caller, ConnectionId, DeliveryState};

use crate::api::AppState;
use crate::auth::Authenticated;

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    info!(identity = %caller.identity, domain = %caller.domain, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, state, caller))
}

async fn handle_socket(socket: WebSocket, state: AppState, caller: Caller) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut handle = state.engine.connect(caller.clone()).await;
    let connection = handle.id;

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, connection, &caller, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let event = ServerEvent::error("bad_frame", "binary frames are not supported", None);
                        state.engine.notify(connection, event).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%connection, "WebSocket closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%connection, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
            outgoing = handle.events.recv() => {
                // The registry dropped our queue.
                let Some(event) = outgoing else { break };
                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(%connection, "Failed to encode event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                    debug!(%connection, "Failed to write frame: {}", e);
                    break;
                }
            }
        }
    }

    state.engine.disconnect(connection).await;
    info!(%connection, identity = %caller.identity, "WebSocket disconnected");
}

/// Dispatch one client frame. Failures are reported to the connection as
/// `error` events; nothing here closes the socket.
pub(crate) async fn handle_frame(
    state: &AppState,
    connection: ConnectionId,
    caller: &Caller,
    text: &str,
) {
    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(%connection, "Undecodable frame: {}", e);
            let reply = ServerEvent::error("bad_frame", e.to_string(), None);
            state.engine.notify(connection, reply).await;
            return;
        }
    };

    let engine = &state.engine;
    let outcome = match event {
        ClientEvent::JoinRoom { room } => engine.join(connection, room).await.map_err(|e| (e, None)),
        ClientEvent::LeaveRoom { room } => {
            engine.leave(connection, room).await;
            Ok(())
        }
        ClientEvent::SendMessage {
            client_ref,
            target,
            body,
        } => {
            if !state.throttle.check(&caller.identity).await {
                warn!(identity = %caller.identity, "send throttled");
                let reply = ServerEvent::error("rate_limited", "slow down", client_ref);
                engine.notify(connection, reply).await;
                return;
            }
            engine
                .send(connection, target, &body, client_ref.clone())
                .await
                .map(drop)
                .map_err(|e| (e, client_ref))
        }
        ClientEvent::AckDelivered { message_id } => engine
            .acknowledge(connection, message_id, DeliveryState::Delivered)
            .await
            .map_err(|e| (e, None)),
        ClientEvent::AckRead { message_id } => engine
            .acknowledge(connection, message_id, DeliveryState::Read)
            .await
            .map_err(|e| (e, None)),
        ClientEvent::Ping => {
            engine.notify(connection, ServerEvent::Pong).await;
            Ok(())
        }
    };

    if let Err((e, client_ref)) = outcome {
        debug!(%connection, code = e.code(), "frame rejected: {}", e);
        let reply = ServerEvent::error(e.code(), e.to_string(), client_ref);
        engine.notify(connection, reply).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_engine::ChatEngine;
    use enclave_shared::types::{DomainId, IdentityId, MessageId, RoomId};
    use enclave_store::Database;
    use serde_json::json;

    use crate::config::ServerConfig;

    fn state(send_burst: f64) -> AppState {
        let config = ServerConfig {
            send_rate: 0.001,
            send_burst,
            ..ServerConfig::default()
        };
        let engine = ChatEngine::new(Database::open_in_memory().unwrap(), config.engine.clone());
        AppState::new(engine, &config)
    }

    fn caller(id: &str) -> Caller {
        Caller::new(IdentityId::new(id).unwrap(), DomainId::new("eng.example").unwrap())
    }

    async fn direct_room(state: &AppState, a: &Caller, b: &Caller) -> RoomId {
        state.engine.register(a).unwrap();
        state.engine.register(b).unwrap();
        let dm = state
            .engine
            .create_or_resolve_direct(a, &b.identity)
            .await
            .unwrap();
        dm.conversation.room()
    }

    #[tokio::test]
    async fn test_undecodable_frame() {
        let state = state(10.0);
        let alice = caller("alice");
        let mut conn = state.engine.connect(alice.clone()).await;

        handle_frame(&state, conn.id, &alice, "{not json").await;

        match conn.events.try_recv().unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(code, "bad_frame"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let state = state(10.0);
        let alice = caller("alice");
        let mut conn = state.engine.connect(alice.clone()).await;

        handle_frame(&state, conn.id, &alice, r#"{"type":"ping"}"#).await;

        assert_eq!(conn.events.try_recv().unwrap(), ServerEvent::Pong);
    }

    #[tokio::test]
    async fn test_join_send_and_receive() {
        let state = state(10.0);
        let (alice, bob) = (caller("alice"), caller("bob"));
        let room = direct_room(&state, &alice, &bob).await;
        let mut a = state.engine.connect(alice.clone()).await;
        let mut b = state.engine.connect(bob.clone()).await;

        let join = json!({ "type": "join_room", "room": room }).to_string();
        handle_frame(&state, a.id, &alice, &join).await;
        handle_frame(&state, b.id, &bob, &join).await;
        assert_eq!(a.events.try_recv().unwrap(), ServerEvent::Joined { room });
        assert_eq!(b.events.try_recv().unwrap(), ServerEvent::Joined { room });

        let send = json!({
            "type": "send_message",
            "client_ref": "c-1",
            "target": room,
            "body": "hi bob",
        })
        .to_string();
        handle_frame(&state, a.id, &alice, &send).await;

        match a.events.try_recv().unwrap() {
            ServerEvent::MessageSent { client_ref, message } => {
                assert_eq!(client_ref.as_deref(), Some("c-1"));
                assert_eq!(message.seq, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        let received = match b.events.try_recv().unwrap() {
            ServerEvent::MessageReceived { message } => message,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(received.body, "hi bob");

        let ack = json!({ "type": "ack_read", "message_id": received.id }).to_string();
        handle_frame(&state, b.id, &bob, &ack).await;
        match a.events.try_recv().unwrap() {
            ServerEvent::StatusUpdated { message_id, state, .. } => {
                assert_eq!(message_id, received.id);
                assert_eq!(state, DeliveryState::Read);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_forbidden_room() {
        let state = state(10.0);
        let (alice, bob, carol) = (caller("alice"), caller("bob"), caller("carol"));
        let room = direct_room(&state, &alice, &bob).await;
        let mut c = state.engine.connect(carol.clone()).await;

        let join = json!({ "type": "join_room", "room": room }).to_string();
        handle_frame(&state, c.id, &carol, &join).await;

        match c.events.try_recv().unwrap() {
            ServerEvent::Error { code, client_ref, .. } => {
                assert_eq!(code, "forbidden");
                assert!(client_ref.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_send_echoes_client_ref() {
        let state = state(10.0);
        let (alice, bob) = (caller("alice"), caller("bob"));
        let room = direct_room(&state, &alice, &bob).await;
        let mut a = state.engine.connect(alice.clone()).await;

        let send = json!({
            "type": "send_message",
            "client_ref": "c-empty",
            "target": room,
            "body": "",
        })
        .to_string();
        handle_frame(&state, a.id, &alice, &send).await;

        match a.events.try_recv().unwrap() {
            ServerEvent::Error { code, client_ref, .. } => {
                assert_eq!(code, "validation");
                assert_eq!(client_ref.as_deref(), Some("c-empty"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_is_throttled() {
        let state = state(1.0);
        let (alice, bob) = (caller("alice"), caller("bob"));
        let room = direct_room(&state, &alice, &bob).await;
        let mut a = state.engine.connect(alice.clone()).await;

        for n in 0..2 {
            let send = json!({
                "type": "send_message",
                "client_ref": format!("c-{n}"),
                "target": room,
                "body": "spam",
            })
            .to_string();
            handle_frame(&state, a.id, &alice, &send).await;
        }

        assert!(matches!(
            a.events.try_recv().unwrap(),
            ServerEvent::MessageSent { .. }
        ));
        match a.events.try_recv().unwrap() {
            ServerEvent::Error { code, client_ref, .. } => {
                assert_eq!(code, "rate_limited");
                assert_eq!(client_ref.as_deref(), Some("c-1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.engine.history(&alice, room, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ack_of_unknown_message_is_ignored() {
        let state = state(10.0);
        let alice = caller("alice");
        state.engine.register(&alice).unwrap();
        let mut a = state.engine.connect(alice.clone()).await;

        let ack = json!({ "type": "ack_delivered", "message_id": MessageId::new() }).to_string();
        handle_frame(&state, a.id, &alice, &ack).await;

        assert!(a.events.try_recv().is_err());
    }
}
