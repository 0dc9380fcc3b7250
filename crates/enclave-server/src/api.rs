use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use enclave_engine::directory::{ConversationList, ConversationSummary, Departure};
use enclave_engine::ChatEngine;
use enclave_shared::types::{ChannelId, ConversationId, IdentityId, RoomId};
use enclave_store::{Channel, Membership, Message};

use crate::auth::Authenticated;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::throttle::SendThrottle;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub engine: ChatEngine,
    pub throttle: SendThrottle,
}

impl AppState {
    pub fn new(engine: ChatEngine, config: &ServerConfig) -> Self {
        Self {
            engine,
            throttle: SendThrottle::new(config.send_rate, config.send_burst),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .route("/conversations", get(list_conversations))
        .route("/conversations/direct", post(create_direct))
        .route("/conversations/group", post(create_group))
        .route("/conversations/{id}", delete(delete_conversation))
        .route("/conversations/{id}/leave", post(leave_group))
        .route("/conversations/{id}/members", get(list_members).post(add_member))
        .route("/conversations/{id}/members/{member}", delete(remove_member))
        .route("/conversations/{id}/messages", get(conversation_history))
        .route("/channels", get(list_channels).post(create_channel))
        .route("/channels/{id}/messages", get(channel_history))
        .route("/blocks/{id}", post(block).delete(unblock))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct DirectRequest {
    peer_id: IdentityId,
}

#[derive(Deserialize)]
struct GroupRequest {
    name: String,
    participant_ids: Vec<IdentityId>,
}

#[derive(Deserialize)]
struct MemberRequest {
    identity_id: IdentityId,
}

#[derive(Deserialize)]
struct ChannelRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct BlockResponse {
    identity_id: IdentityId,
    blocked: bool,
    /// False when the request matched the existing state.
    changed: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_conversations(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> Result<Json<ConversationList>, ServerError> {
    Ok(Json(state.engine.conversations_for(&caller)?))
}

/// Idempotent: repeated calls for the same pair return the same conversation.
async fn create_direct(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(req): Json<DirectRequest>,
) -> Result<Json<ConversationSummary>, ServerError> {
    let summary = state
        .engine
        .create_or_resolve_direct(&caller, &req.peer_id)
        .await?;
    Ok(Json(summary))
}

async fn create_group(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(req): Json<GroupRequest>,
) -> Result<(StatusCode, Json<ConversationSummary>), ServerError> {
    let summary = state
        .engine
        .create_group(&caller, &req.name, &req.participant_ids)?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<ConversationId>,
) -> Result<Json<Departure>, ServerError> {
    Ok(Json(state.engine.delete_conversation(&caller, id).await?))
}

async fn leave_group(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<ConversationId>,
) -> Result<Json<Departure>, ServerError> {
    Ok(Json(state.engine.leave_group(&caller, id).await?))
}

async fn list_members(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<ConversationId>,
) -> Result<Json<Vec<Membership>>, ServerError> {
    Ok(Json(state.engine.members(&caller, id)?))
}

async fn add_member(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<ConversationId>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<Membership>, ServerError> {
    let membership = state
        .engine
        .add_member(&caller, id, &req.identity_id)
        .await?;
    Ok(Json(membership))
}

async fn remove_member(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path((id, member)): Path<(ConversationId, IdentityId)>,
) -> Result<Json<Departure>, ServerError> {
    Ok(Json(state.engine.remove_member(&caller, id, &member).await?))
}

async fn conversation_history(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let messages = state
        .engine
        .history(&caller, RoomId::Conversation(id), query.limit)?;
    Ok(Json(messages))
}

async fn list_channels(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> Result<Json<Vec<Channel>>, ServerError> {
    Ok(Json(state.engine.list_channels(&caller)?))
}

async fn create_channel(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(req): Json<ChannelRequest>,
) -> Result<(StatusCode, Json<Channel>), ServerError> {
    let channel = state
        .engine
        .create_channel(&caller, &req.name, req.description.as_deref())?;
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn channel_history(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<ChannelId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    Ok(Json(state.engine.channel_history(&caller, id, query.limit)?))
}

async fn block(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(target): Path<IdentityId>,
) -> Result<Json<BlockResponse>, ServerError> {
    let changed = state.engine.block(&caller, &target)?;
    Ok(Json(BlockResponse {
        identity_id: target,
        blocked: true,
        changed,
    }))
}

async fn unblock(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(target): Path<IdentityId>,
) -> Result<Json<BlockResponse>, ServerError> {
    let changed = state.engine.unblock(&caller, &target)?;
    Ok(Json(BlockResponse {
        identity_id: target,
        blocked: false,
        changed,
    }))
}
