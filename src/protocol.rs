//! Wire format for the WebSocket endpoints.
//!
//! Every frame in either direction is a JSON object `{"type": ..., "data": ...}`.
//! Leaderboard control frames may also carry their channel list at the top level
//! (`{"type":"subscribe","channels":["daily"]}`), which is accepted alongside
//! `data.channels`.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outbound envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
  RoomInfo,
  PlayerJoined,
  PlayerLeft,
  ScoreUpdate,
  Pong,
  SubscriptionConfirmed,
  CurrentLeaderboard,
  LiveUpdate,
}

/// Outbound message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
  #[serde(rename = "type")]
  pub kind: EventKind,
  pub data: T,
}

impl<T: Serialize> Envelope<T> {
  pub fn new(kind: EventKind, data: T) -> Self {
    Self { kind, data }
  }

  /// Serialize into the shared payload form pushed onto outbound queues.
  pub fn to_payload(&self) -> Result<Arc<str>, serde_json::Error> {
    serde_json::to_string(self).map(Arc::from)
  }
}

/// Raw inbound envelope before dispatch.
#[derive(Debug, Deserialize)]
struct InboundEnvelope {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  data: serde_json::Value,
  #[serde(default)]
  channels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreUpdateData {
  pub score: i64,
  #[serde(default)]
  pub increment: i64,
}

#[derive(Debug, Deserialize)]
struct JoinRoomData {
  room_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelsData {
  #[serde(default)]
  channels: Vec<String>,
}

/// Leaderboard subscription control verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
  Subscribe,
  Unsubscribe,
  GetCurrent,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
  ScoreUpdate(ScoreUpdateData),
  Ping,
  JoinRoom { room_id: String },
  Subscription {
    action: SubscriptionAction,
    channels: Vec<String>,
  },
  Unknown(String),
}

impl ClientRequest {
  /// Decode a text frame. Unknown types decode to [`ClientRequest::Unknown`] rather than failing.
  pub fn parse(text: &str) -> Result<Self, ProtocolError> {
    let envelope: InboundEnvelope = serde_json::from_str(text)?;
    let payload_err = |source| ProtocolError::Payload {
      kind: envelope.kind.clone(),
      source,
    };

    let request = match envelope.kind.as_str() {
      "score_update" => {
        ClientRequest::ScoreUpdate(serde_json::from_value(envelope.data.clone()).map_err(payload_err)?)
      }
      "ping" => ClientRequest::Ping,
      "join_room" => {
        let data: JoinRoomData = serde_json::from_value(envelope.data.clone()).map_err(payload_err)?;
        ClientRequest::JoinRoom { room_id: data.room_id }
      }
      "subscribe" | "unsubscribe" | "get_current" => {
        let action = match envelope.kind.as_str() {
          "subscribe" => SubscriptionAction::Subscribe,
          "unsubscribe" => SubscriptionAction::Unsubscribe,
          _ => SubscriptionAction::GetCurrent,
        };
        let channels = match envelope.channels.clone() {
          Some(channels) => channels,
          None if envelope.data.is_null() => Vec::new(),
          None => {
            serde_json::from_value::<ChannelsData>(envelope.data.clone())
              .map_err(payload_err)?
              .channels
          }
        };
        ClientRequest::Subscription { action, channels }
      }
      other => ClientRequest::Unknown(other.to_string()),
    };
    Ok(request)
  }
}

/// Presence and score event for a single player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameUpdate {
  pub user_id: u64,
  pub username: String,
  pub current_score: i64,
  /// `"joined"`, `"left"` or `"score_update"`.
  pub action: String,
  pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
  pub user_id: u64,
  pub username: String,
  pub current_score: i64,
  pub is_online: bool,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
  pub room_id: String,
  pub player_count: usize,
  pub players: Vec<PlayerInfo>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pong {
  pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStatus {
  pub channels: Vec<String>,
  /// `"subscribed"` or `"unsubscribed"`.
  pub status: String,
}

/// Current UNIX timestamp in seconds.
pub fn unix_timestamp() -> i64 {
  chrono::Utc::now().timestamp()
}
