//! JSON request/response shapes for the API surface (spec.md §6). These are
//! intentionally flatter than the Store's row types — callers shouldn't have
//! to know about internal column layout.

use crate::store::models::{Channel, Message, NeighborEdge, Node, PositionHistoryPoint, Traceroute};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub connected: bool,
    #[serde(rename = "userDisconnected")]
    pub user_disconnected: bool,
    pub state: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    #[serde(rename = "radioEndpoint")]
    pub radio_endpoint: String,
    #[serde(rename = "localNodeId", skip_serializing_if = "Option::is_none")]
    pub local_node_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
    pub channel: i32,
    pub destination: Option<u32>,
    #[serde(rename = "replyId")]
    pub reply_id: Option<u32>,
    pub emoji: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "packetId")]
    pub packet_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub channel: Option<i32>,
    #[serde(rename = "peerNodeId")]
    pub peer_node_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FavoriteRequest {
    #[serde(rename = "isFavorite")]
    pub is_favorite: bool,
    #[serde(rename = "syncToDevice", default)]
    pub sync_to_device: bool,
}

/// Per spec.md §9's open question on favorite-sync-to-device: the response
/// always distinguishes a local-only write from a full device sync attempt.
#[derive(Debug, Serialize)]
pub struct FavoriteResponse {
    pub status: &'static str,
    pub reason: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
pub struct TracerouteRequest {
    pub destination: u32,
}

#[derive(Debug, Serialize)]
pub struct TracerouteAck {
    #[serde(rename = "packetId")]
    pub packet_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PositionHistoryQuery {
    pub hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TelemetryAvailableNodes {
    pub telemetry: Vec<u32>,
    pub weather: Vec<u32>,
    pub pkc: Vec<u32>,
    #[serde(rename = "estimatedPosition")]
    pub estimated_position: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub nodes: Vec<Node>,
    pub messages: Vec<Message>,
    pub channels: Vec<Channel>,
    pub config: ConfigResponse,
    pub connection: ConnectionResponse,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: bool,
}

#[derive(Debug, Deserialize)]
pub struct SettingUpdate {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Re-exported for handlers that pass raw Store rows through unchanged
/// (nodes, messages, channels, traceroutes, neighbor edges, position
/// history all already serialize in the shape the API needs).
pub type NodeList = Vec<Node>;
pub type MessageList = Vec<Message>;
pub type ChannelList = Vec<Channel>;
pub type TracerouteList = Vec<Traceroute>;
pub type NeighborList = Vec<NeighborEdge>;
pub type PositionHistoryList = Vec<PositionHistoryPoint>;
