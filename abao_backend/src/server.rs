use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::broadcast::{Broadcaster, GroupEvent, GroupHub};
use crate::config::BackendConfig;
use crate::database::{ChatDatabase, MessageDto, MessageRecord, MessageStore, NewMessage};
use crate::memory::FileMemoryStore;
use crate::pipeline::AiPipeline;
use crate::registry::SWEEP_INTERVAL;

#[derive(Clone)]
pub struct ServerState {
    pub db: Arc<ChatDatabase>,
    pub hub: Arc<GroupHub>,
    pub pipeline: Arc<AiPipeline>,
    pub auth: BackendAuthConfig,
}

impl ServerState {
    pub fn from_config(config: &BackendConfig) -> Result<Arc<Self>> {
        let auth = load_auth_config(config)?;
        let db = Arc::new(
            ChatDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database {}", config.database_path))?,
        );
        let memory = Arc::new(FileMemoryStore::new(&config.storage_dir));
        let hub = Arc::new(GroupHub::new());
        let pipeline = Arc::new(AiPipeline::from_config(
            config,
            db.clone(),
            memory,
            hub.clone(),
        ));
        Ok(Arc::new(Self {
            db,
            hub,
            pipeline,
            auth,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    nickname: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    sender_id: String,
    content: String,
    #[serde(default)]
    reply_to_id: Option<String>,
}

pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/users", post(create_user))
        .route("/groups", post(create_group))
        .route("/groups/:id/members", post(add_member))
        .route(
            "/groups/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/groups/:id/ws", get(ws_group_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

pub async fn serve_backend(config: BackendConfig) -> Result<()> {
    let bind_addr = config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid bind_addr (expected host:port)")?;

    let state = ServerState::from_config(&config)?;
    if !config.has_llm_credential() {
        tracing::warn!(
            provider = %config.llm_provider,
            "No AI API key configured; messages will be stored but the AI stays silent"
        );
    }
    let _sweeper = state.pipeline.registry().spawn_sweeper(SWEEP_INTERVAL);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("A宝 backend listening on http://{}", bind_addr);
    axum::serve(listener, router(state))
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn load_auth_config(config: &BackendConfig) -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(&config.auth_mode)?;
    let token = config
        .auth_token
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "ABAO_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: &str) -> Result<AuthMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid auth mode '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn create_user(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), (StatusCode, String)> {
    let id = state
        .db
        .create_user(body.nickname.as_deref(), body.email.as_deref())
        .map_err(internal_error)?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn create_group(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), (StatusCode, String)> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(bad_request("name cannot be empty"));
    }
    let id = state.db.create_group(name).map_err(internal_error)?;
    tracing::info!(group_id = %id, name, "Group created");
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn add_member(
    State(state): State<Arc<ServerState>>,
    Path(group_id): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    require_group(&state, &group_id)?;
    state
        .db
        .add_member(&group_id, &body.user_id)
        .map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    Path(group_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessageDto>>, (StatusCode, String)> {
    require_group(&state, &group_id)?;
    let limit = clamp_limit(query.limit, 50, 1, 500);
    let records = state
        .db
        .recent_messages(&group_id, limit)
        .map_err(internal_error)?;
    to_dtos(&state, &records).await.map(Json).map_err(internal_error)
}

/// Persist, answer, then hand the message to the AI pipeline.
async fn send_message(
    State(state): State<Arc<ServerState>>,
    Path(group_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageDto>), (StatusCode, String)> {
    require_group(&state, &group_id)?;

    let content = body.content.trim();
    if content.is_empty() {
        return Err(bad_request("content cannot be empty"));
    }
    if !state
        .db
        .is_member(&group_id, &body.sender_id)
        .map_err(internal_error)?
    {
        return Err((
            StatusCode::FORBIDDEN,
            format!("'{}' is not a member of this group", body.sender_id),
        ));
    }

    let reply_target = match body.reply_to_id.as_deref() {
        Some(reply_to_id) => {
            let target = state
                .db
                .get_message(reply_to_id)
                .await
                .map_err(internal_error)?
                .filter(|target| target.group_id == group_id)
                .ok_or_else(|| bad_request("reply target is not in this group"))?;
            Some(target)
        }
        None => None,
    };

    let mut new_message = NewMessage::user(&group_id, &body.sender_id, content);
    if let Some(target) = &reply_target {
        new_message = new_message.replying_to(&target.id);
    }
    let record = state
        .db
        .insert_message(new_message)
        .await
        .map_err(internal_error)?;

    let dto = record.to_dto(reply_target.as_ref());
    state
        .hub
        .broadcast(&group_id, GroupEvent::NewMessage(dto.clone()));
    state.pipeline.dispatch(record);

    Ok((StatusCode::CREATED, Json(dto)))
}

async fn ws_group_route(
    State(state): State<Arc<ServerState>>,
    Path(group_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    require_group(&state, &group_id)?;
    Ok(ws.on_upgrade(move |socket| handle_group_socket(state, group_id, socket)))
}

async fn handle_group_socket(state: Arc<ServerState>, group_id: String, mut socket: WebSocket) {
    let mut rx = state.hub.subscribe(&group_id);
    tracing::debug!(group_id = %group_id, "Event stream subscriber connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(group_id = %group_id, skipped, "Event stream subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    tracing::debug!(group_id = %group_id, "Event stream subscriber left");
}

/// Attach reply previews to a page of messages.
async fn to_dtos(state: &ServerState, records: &[MessageRecord]) -> Result<Vec<MessageDto>> {
    let reply_ids: Vec<String> = records
        .iter()
        .filter_map(|record| record.reply_to_id.clone())
        .collect();
    let targets = if reply_ids.is_empty() {
        Vec::new()
    } else {
        state.db.messages_by_ids(&reply_ids).await?
    };
    Ok(records
        .iter()
        .map(|record| {
            let target = record
                .reply_to_id
                .as_deref()
                .and_then(|id| targets.iter().find(|target| target.id == id));
            record.to_dto(target)
        })
        .collect())
}

fn require_group(state: &ServerState, group_id: &str) -> Result<(), (StatusCode, String)> {
    if state.db.group_exists(group_id).map_err(internal_error)? {
        Ok(())
    } else {
        Err(not_found(format!("group '{}' not found", group_id)))
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn bad_request(message: &str) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.to_string())
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("Request failed: {:#}", error);
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
