//! Route handlers translating HTTP requests into Store queries and Session
//! commands (spec.md §6). This is a thin contract-level layer: argument
//! parsing beyond what's shown here, auth/CSRF middleware, and the browser
//! UI are all out of scope per spec.md §1 and live elsewhere.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::error::CoreError;
use crate::session::OutboundCommand;
use crate::store::models::{Message, Node};

use super::dto::*;
use super::AppState;

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Auth => StatusCode::UNAUTHORIZED,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Store(_) | CoreError::Transport(_) | CoreError::Decode(_) | CoreError::Decrypt(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, CoreError>;

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let local_node_id = state.session.local_node_num().await.map(crate::store::models::node_id_from_num);
    Json(ConfigResponse {
        radio_endpoint: state.radio_endpoint.clone(),
        local_node_id,
    })
}

fn connection_response(state: &AppState) -> ConnectionResponse {
    let session_state = state.session.state();
    ConnectionResponse {
        connected: session_state.is_connected(),
        user_disconnected: matches!(session_state, crate::session::state::SessionState::UserDisconnected),
        state: session_state.label(),
    }
}

pub async fn get_connection(State(state): State<Arc<AppState>>) -> Json<ConnectionResponse> {
    Json(connection_response(&state))
}

pub async fn post_disconnect(State(state): State<Arc<AppState>>) -> Result<StatusCode, CoreError> {
    state.session.send(OutboundCommand::Disconnect)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn post_reconnect(State(state): State<Arc<AppState>>) -> Result<StatusCode, CoreError> {
    state.session.send(OutboundCommand::Reconnect)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Node>> {
    Ok(Json(state.store.list_nodes().await?))
}

pub async fn refresh_nodes(State(state): State<Arc<AppState>>) -> Result<StatusCode, CoreError> {
    state.session.send(OutboundCommand::RequestNodeDb)?;
    Ok(StatusCode::ACCEPTED)
}

/// Firmware version strings are dotted-decimal (`"2.7.1"`); anything that
/// doesn't parse is treated as "too old to trust" per spec.md §9's open
/// question on favorite-sync degrading silently in the source.
fn firmware_supports_device_sync(version: Option<&str>) -> bool {
    let Some(version) = version else { return false };
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major, minor) >= (2, 7)
}

pub async fn set_favorite(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Json(req): Json<FavoriteRequest>,
) -> ApiResult<FavoriteResponse> {
    let node_num = parse_node_id(&node_id)?;
    state.store.set_favorite(node_num, req.is_favorite).await?;

    if !req.sync_to_device {
        return Ok(Json(FavoriteResponse { status: "success", reason: None }));
    }

    let node = state.store.get_node(node_num).await?;
    let firmware_ok = firmware_supports_device_sync(node.as_ref().and_then(|n| n.firmware_version.as_deref()));
    if !firmware_ok {
        return Ok(Json(FavoriteResponse { status: "skipped", reason: Some("firmware_too_old") }));
    }

    match state.session.send(OutboundCommand::SetFavorite { node_num, is_favorite: req.is_favorite }) {
        Ok(()) => Ok(Json(FavoriteResponse { status: "success", reason: None })),
        Err(_) => Ok(Json(FavoriteResponse { status: "failed", reason: Some("session_unavailable") })),
    }
}

pub async fn position_history(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Query(q): Query<PositionHistoryQuery>,
) -> ApiResult<PositionHistoryList> {
    let hours = q.hours.unwrap_or(24).max(0);
    let since = now_unix() - hours * 3600;
    Ok(Json(state.store.positions_since(&node_id, since).await?))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MessagesQuery>,
) -> ApiResult<Vec<Message>> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(state.store.recent_messages(limit).await?))
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    if req.text.is_empty() {
        return Err(CoreError::Validation("text must not be empty".to_string()));
    }
    let local_node_num = state.session.local_node_num().await.unwrap_or(0);
    let packet_id = state.session.allocate_packet_id();

    state.session.send(OutboundCommand::SendText {
        text: req.text.clone(),
        channel: req.channel,
        destination: req.destination,
        reply_id: req.reply_id,
        emoji: req.emoji.unwrap_or(0),
        packet_id,
        ack_tx: None,
    })?;

    let message = Message {
        id: Message::composite_id(local_node_num, packet_id),
        from_node_num: local_node_num,
        to_node_num: req.destination.unwrap_or(0xFFFF_FFFF),
        channel: req.channel,
        portnum: 1,
        text: Some(req.text),
        timestamp: now_unix(),
        hop_start: None,
        hop_limit: None,
        reply_id: req.reply_id,
        emoji: req.emoji.unwrap_or(0),
        acknowledged: false,
        ack_failed: false,
        bridge: false,
    };
    let message_id = message.id.clone();
    state.store.insert_message_if_new(message).await?;

    tokio::spawn(await_ack(state.clone(), message_id.clone(), local_node_num, packet_id));

    Ok(Json(SendMessageResponse { message_id, packet_id }))
}

/// `POST /api/messages/send` returns immediately (spec.md §6); the ack
/// itself arrives asynchronously through the Ingest Pipeline's ROUTING_APP
/// handler. This task only exists to flip `ackFailed=true` if the 30s
/// deadline elapses without the Ingest Pipeline ever marking the message
/// acknowledged — normal ack delivery is entirely the ingest path's job.
async fn await_ack(state: Arc<AppState>, message_id: String, from_node_num: u32, packet_id: u32) {
    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    if let Ok(Some(m)) = state.store.get_message(&message_id).await {
        if !m.acknowledged && !m.ack_failed {
            let _ = state.store.mark_ack(from_node_num, packet_id, false).await;
        }
    }
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MarkReadRequest>,
) -> Result<StatusCode, CoreError> {
    let subject = req.subject.unwrap_or_else(|| "anon".to_string());
    let scope = if let Some(channel) = req.channel {
        channel.to_string()
    } else if let Some(peer) = req.peer_node_id {
        peer
    } else {
        return Err(CoreError::Validation("channel or peerNodeId required".to_string()));
    };
    state.store.mark_read(subject, scope, now_unix()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_channels(State(state): State<Arc<AppState>>) -> ApiResult<ChannelList> {
    Ok(Json(state.store.visible_channels().await?))
}

pub async fn recent_traceroutes(State(state): State<Arc<AppState>>) -> ApiResult<TracerouteList> {
    Ok(Json(state.store.recent_traceroutes(50).await?))
}

pub async fn request_traceroute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TracerouteRequest>,
) -> ApiResult<TracerouteAck> {
    let packet_id = state.session.allocate_packet_id();
    state.session.send(OutboundCommand::SendTracerouteRequest { destination: req.destination, packet_id })?;
    Ok(Json(TracerouteAck { packet_id }))
}

pub async fn neighbor_info(State(state): State<Arc<AppState>>) -> ApiResult<NeighborList> {
    Ok(Json(state.store.all_neighbors().await?))
}

pub async fn telemetry_available_nodes(State(state): State<Arc<AppState>>) -> ApiResult<TelemetryAvailableNodes> {
    let nodes = state.store.list_nodes().await?;
    let estimated_position = nodes
        .iter()
        .filter(|n| crate::derive::is_estimated_position(n.position.as_ref().and_then(|p| p.precision_bits)))
        .map(|n| n.node_num)
        .collect();
    // `weather`/`pkc` sets require module-config fields this core doesn't
    // model yet; report them empty rather than guessing.
    Ok(Json(TelemetryAvailableNodes {
        telemetry: nodes.iter().map(|n| n.node_num).collect(),
        weather: Vec::new(),
        pkc: Vec::new(),
        estimated_position,
    }))
}

pub async fn poll(State(state): State<Arc<AppState>>) -> ApiResult<PollResponse> {
    let nodes = state.store.list_nodes().await?;
    let messages = state.store.recent_messages(100).await?;
    let channels = state.store.visible_channels().await?;
    let local_node_id = state.session.local_node_num().await.map(crate::store::models::node_id_from_num);
    Ok(Json(PollResponse {
        nodes,
        messages,
        channels,
        config: ConfigResponse { radio_endpoint: state.radio_endpoint.clone(), local_node_id },
        connection: connection_response(&state),
    }))
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> ApiResult<Vec<SettingUpdate>> {
    // Settings are a free-form key/value map (spec.md §3); the store itself
    // has no "list all" query since most keys are internal scheduler
    // bookkeeping, so this surface only exposes ones written through
    // `post_settings` via the `settings.api.` prefix.
    let keys = state.exposed_setting_keys.lock().await.clone();
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(value) = state.store.get_setting(&key).await? {
            out.push(SettingUpdate { key, value });
        }
    }
    Ok(Json(out))
}

pub async fn post_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SettingUpdate>,
) -> Result<StatusCode, CoreError> {
    state.store.set_setting(req.key.clone(), req.value).await?;
    let mut keys = state.exposed_setting_keys.lock().await;
    if !keys.contains(&req.key) {
        keys.push(req.key);
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn purge_nodes(State(state): State<Arc<AppState>>) -> ApiResult<PurgeResponse> {
    state.store.purge_nodes().await?;
    Ok(Json(PurgeResponse { purged: true }))
}

pub async fn purge_messages(State(state): State<Arc<AppState>>) -> ApiResult<PurgeResponse> {
    state.store.purge_messages().await?;
    Ok(Json(PurgeResponse { purged: true }))
}

pub async fn purge_telemetry(State(state): State<Arc<AppState>>) -> ApiResult<PurgeResponse> {
    state.store.purge_telemetry().await?;
    Ok(Json(PurgeResponse { purged: true }))
}

pub async fn reboot_device(State(state): State<Arc<AppState>>) -> Result<StatusCode, CoreError> {
    state.session.send(OutboundCommand::Reboot)?;
    Ok(StatusCode::ACCEPTED)
}

fn parse_node_id(id: &str) -> Result<u32, CoreError> {
    let hex = id.strip_prefix('!').unwrap_or(id);
    u32::from_str_radix(hex, 16).map_err(|_| CoreError::Validation(format!("invalid node id: {id}")))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

