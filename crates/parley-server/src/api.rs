use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::MAX_HISTORY_LIMIT;
use parley_shared::protocol::SendMessage;
use parley_shared::{
    Conversation, ConversationId, ConversationSummary, EnrichedMessage, MemberSet, UserId,
    UserProfile,
};

use crate::config::ServerConfig;
use crate::connection::ws_handler;
use crate::error::ServerError;
use crate::messaging::Messaging;

#[derive(Clone)]
pub struct AppState {
    pub messaging: Messaging,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/users/online", get(online_users))
        .route("/users/:id", put(upsert_profile))
        .route("/users/:id/conversations", get(user_conversations))
        .route("/conversations", post(open_conversation))
        .route("/conversations/:id", get(get_conversation))
        .route("/conversations/:id/messages", get(conversation_history))
        .route("/messages", post(post_message))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connections: usize,
    online: usize,
    rooms: usize,
    pending_duplicates: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRequest {
    display_name: String,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Deserialize)]
struct OpenConversationRequest {
    members: Vec<UserId>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    before: Option<DateTime<Utc>>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let dispatcher = state.messaging.dispatcher();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: dispatcher.connection_count(),
        online: dispatcher.presence().snapshot().len(),
        rooms: dispatcher.rooms().room_count(),
        pending_duplicates: state.messaging.guard().len(),
    })
}

async fn online_users(State(state): State<AppState>) -> Json<Vec<UserId>> {
    Json(state.messaging.dispatcher().presence().snapshot())
}

async fn upsert_profile(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(request): Json<ProfileRequest>,
) -> Result<Json<UserProfile>, ServerError> {
    if id.is_empty() {
        return Err(ServerError::BadRequest("user id must not be blank".into()));
    }
    let profile = UserProfile {
        id,
        display_name: request.display_name,
        avatar: request.avatar,
    };
    state.messaging.upsert_profile(&profile).await?;
    Ok(Json(profile))
}

async fn user_conversations(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    Ok(Json(state.messaging.conversations_for(&id).await?))
}

/// Returns 201 when the member set is new, 200 with the existing
/// conversation otherwise.
async fn open_conversation(
    State(state): State<AppState>,
    Json(request): Json<OpenConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ServerError> {
    let members =
        MemberSet::new(request.members).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let (conversation, created) = state.messaging.open_conversation(&members).await?;

    if created {
        info!(conversation = %conversation.id, "Conversation opened via API");
        Ok((StatusCode::CREATED, Json(conversation)))
    } else {
        Ok((StatusCode::OK, Json(conversation)))
    }
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ServerError> {
    Ok(Json(state.messaging.conversation(id).await?))
}

async fn conversation_history(
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<EnrichedMessage>>, ServerError> {
    let limit = query
        .limit
        .unwrap_or(state.config.history_limit)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(
        state.messaging.history(id, limit, query.before).await?,
    ))
}

/// Send without a socket. Runs the full pipeline; the caller gets the stored
/// message in the response instead of a `message-sent` push.
async fn post_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessage>,
) -> Result<(StatusCode, Json<EnrichedMessage>), ServerError> {
    let message = state.messaging.post_message(request).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP + WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
