//! Relay from the external pub/sub transport to leaderboard subscribers.
//!
//! A connection opts into channels with `subscribe` frames. The first subscribe
//! attaches one transport subscription covering every leaderboard topic; each
//! delivery is forwarded as `live_update` only if the connection is currently
//! subscribed to that channel. A supervising task stops the transport subscription
//! once the connection closes, however the close came about.

use crate::{
  connection::Connection,
  error::{LeaderboardError, SendError},
  hub::Hub,
  protocol::{Envelope, EventKind, SubscriptionAction, SubscriptionStatus},
  pubsub::{PubSubBackend, PubSubExt},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
  collections::HashMap,
  sync::{Arc, RwLock},
};
use tracing::Span;

/// Number of entries pushed in a `current_leaderboard` reply by default.
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 10;

/// Leaderboard broadcast channels a connection can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
  Updates,
  Global,
  Daily,
  Weekly,
  Achievements,
  RankChanges,
}

impl Channel {
  pub const ALL: [Channel; 6] = [
    Channel::Updates,
    Channel::Global,
    Channel::Daily,
    Channel::Weekly,
    Channel::Achievements,
    Channel::RankChanges,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Channel::Updates => "updates",
      Channel::Global => "global",
      Channel::Daily => "daily",
      Channel::Weekly => "weekly",
      Channel::Achievements => "achievements",
      Channel::RankChanges => "rank_changes",
    }
  }

  pub fn parse(name: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|c| c.name() == name)
  }

  /// Transport topic carrying this channel.
  pub fn topic(self) -> String {
    format!("leaderboard:{}", self.name())
  }

  pub fn from_topic(topic: &str) -> Option<Self> {
    topic.strip_prefix("leaderboard:").and_then(Self::parse)
  }

  /// Board whose snapshot is pushed for this channel, if any.
  pub fn board(self) -> Option<Board> {
    match self {
      Channel::Global => Some(Board::Global),
      Channel::Daily => Some(Board::Daily),
      Channel::Weekly => Some(Board::Weekly),
      _ => None,
    }
  }
}

/// A ranked leaderboard with a snapshot view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Board {
  Global,
  Daily,
  Weekly,
}

impl Board {
  pub fn channel(self) -> Channel {
    match self {
      Board::Global => Channel::Global,
      Board::Daily => Channel::Daily,
      Board::Weekly => Channel::Weekly,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
  pub rank: u32,
  pub user_id: u64,
  pub username: String,
  #[serde(default)]
  pub nickname: String,
  #[serde(default)]
  pub avatar: String,
  pub score: i64,
  #[serde(default)]
  pub games_played: u32,
  #[serde(default)]
  pub last_played_at: Option<DateTime<Utc>>,
}

impl LeaderboardEntry {
  pub fn new(rank: u32, user_id: u64, username: impl Into<String>, score: i64) -> Self {
    Self {
      rank,
      user_id,
      username: username.into(),
      nickname: String::new(),
      avatar: String::new(),
      score,
      games_played: 0,
      last_played_at: None,
    }
  }
}

/// Payload of a `current_leaderboard` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentLeaderboard {
  #[serde(rename = "type")]
  pub board: Board,
  pub entries: Vec<LeaderboardEntry>,
}

/// Best-effort lookup of the current top entries of a board.
#[async_trait]
pub trait LeaderboardSource: Send + Sync {
  async fn snapshot(&self, board: Board, limit: usize) -> Result<Vec<LeaderboardEntry>, LeaderboardError>;
}

/// Source with no rankings. Every board is empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyLeaderboards;

#[async_trait]
impl LeaderboardSource for EmptyLeaderboards {
  async fn snapshot(&self, _board: Board, _limit: usize) -> Result<Vec<LeaderboardEntry>, LeaderboardError> {
    Ok(Vec::new())
  }
}

/// Process-local boards, replaced wholesale by whoever computes rankings.
#[derive(Debug, Default)]
pub struct InMemoryLeaderboards {
  boards: RwLock<HashMap<Board, Vec<LeaderboardEntry>>>,
}

impl InMemoryLeaderboards {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, board: Board, mut entries: Vec<LeaderboardEntry>) {
    entries.sort_by_key(|e| e.rank);
    let mut boards = self.boards.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    boards.insert(board, entries);
  }
}

#[async_trait]
impl LeaderboardSource for InMemoryLeaderboards {
  async fn snapshot(&self, board: Board, limit: usize) -> Result<Vec<LeaderboardEntry>, LeaderboardError> {
    let boards = self.boards.read().unwrap_or_else(std::sync::PoisonError::into_inner);
    Ok(
      boards
        .get(&board)
        .map(|entries| entries.iter().take(limit).cloned().collect())
        .unwrap_or_default(),
    )
  }
}

/// Split requested names into known channels, logging the rest.
fn known_channels(requested: &[String], span: &Span) -> Vec<Channel> {
  let mut channels = Vec::with_capacity(requested.len());
  for name in requested {
    match Channel::parse(name) {
      Some(channel) if !channels.contains(&channel) => channels.push(channel),
      Some(_) => {}
      None => tracing::warn!(parent: span, channel = %name, "ignoring unknown leaderboard channel"),
    }
  }
  channels
}

#[derive(Clone)]
pub struct Bridge {
  transport: Arc<dyn PubSubBackend>,
  source: Arc<dyn LeaderboardSource>,
  hub: Hub,
  snapshot_limit: usize,
  span: Span,
}

impl Bridge {
  pub fn new(transport: Arc<dyn PubSubBackend>, source: Arc<dyn LeaderboardSource>, hub: Hub) -> Self {
    Self {
      transport,
      source,
      hub,
      snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
      span: tracing::info_span!("bridge"),
    }
  }

  pub fn with_snapshot_limit(mut self, limit: usize) -> Self {
    self.snapshot_limit = limit.max(1);
    self
  }

  pub fn with_span(mut self, span: Span) -> Self {
    self.span = span;
    self
  }

  /// Apply a subscription control frame from `conn`.
  ///
  /// `subscribe` replies with `subscription_confirmed` and then one
  /// `current_leaderboard` per requested board; `unsubscribe` only confirms;
  /// `get_current` only pushes snapshots.
  pub async fn handle(&self, conn: &Arc<Connection>, action: SubscriptionAction, requested: &[String]) {
    let channels = known_channels(requested, &self.span);
    let names: Vec<String> = channels.iter().map(|c| c.name().to_string()).collect();

    match action {
      SubscriptionAction::Subscribe => {
        conn.subscribe(names.iter().map(String::as_str));
        if !names.is_empty() {
          self.attach(conn).await;
        }
        tracing::debug!(parent: &self.span, conn_id = conn.id(), channels = ?names, "subscribed");
        let status = SubscriptionStatus {
          channels: names,
          status: "subscribed".into(),
        };
        if self.push(conn, EventKind::SubscriptionConfirmed, status).await {
          self.push_snapshots(conn, &channels).await;
        }
      }
      SubscriptionAction::Unsubscribe => {
        conn.unsubscribe(names.iter().map(String::as_str));
        tracing::debug!(parent: &self.span, conn_id = conn.id(), channels = ?names, "unsubscribed");
        let status = SubscriptionStatus {
          channels: names,
          status: "unsubscribed".into(),
        };
        self.push(conn, EventKind::SubscriptionConfirmed, status).await;
      }
      SubscriptionAction::GetCurrent => self.push_snapshots(conn, &channels).await,
    }
  }

  /// Attach the transport relay for `conn` unless it already has one.
  pub async fn attach(&self, conn: &Arc<Connection>) {
    if !conn.is_active() || !conn.claim_relay() {
      return;
    }

    let topics: Vec<String> = Channel::ALL.iter().map(|c| c.topic()).collect();
    let handler = {
      let conn = conn.clone();
      let hub = self.hub.clone();
      let span = self.span.clone();
      move |topic: String, bytes: Vec<u8>| {
        let conn = conn.clone();
        let hub = hub.clone();
        let span = span.clone();
        async move { relay(&hub, &conn, &topic, &bytes, &span).await }
      }
    };

    let subscription = match self.transport.subscribe(&topics, handler).await {
      Ok(subscription) => subscription,
      Err(e) => {
        tracing::error!(parent: &self.span, conn_id = conn.id(), "leaderboard subscription failed: {}", e);
        conn.release_relay();
        return;
      }
    };

    let conn = conn.clone();
    let span = self.span.clone();
    tokio::spawn(async move {
      conn.closed().await;
      subscription.stop().await;
      tracing::debug!(parent: &span, conn_id = conn.id(), "leaderboard relay released");
    });
  }

  async fn push_snapshots(&self, conn: &Arc<Connection>, channels: &[Channel]) {
    for board in channels.iter().filter_map(|c| c.board()) {
      let entries = match self.source.snapshot(board, self.snapshot_limit).await {
        Ok(entries) => entries,
        Err(e) => {
          tracing::warn!(parent: &self.span, ?board, "leaderboard snapshot unavailable: {}", e);
          continue;
        }
      };
      if !self
        .push(conn, EventKind::CurrentLeaderboard, CurrentLeaderboard { board, entries })
        .await
      {
        return;
      }
    }
  }

  /// Enqueue one frame on `conn`. Returns `false` if the connection is gone.
  async fn push<T: Serialize>(&self, conn: &Arc<Connection>, kind: EventKind, data: T) -> bool {
    let payload = match Envelope::new(kind, data).to_payload() {
      Ok(payload) => payload,
      Err(e) => {
        tracing::error!(parent: &self.span, ?kind, "failed to serialize envelope: {}", e);
        return true;
      }
    };
    match conn.try_send(payload) {
      Ok(()) => true,
      Err(SendError::Full) => {
        self.hub.unregister(conn).await;
        false
      }
      Err(SendError::Closed) => false,
    }
  }
}

async fn relay(hub: &Hub, conn: &Arc<Connection>, topic: &str, bytes: &[u8], span: &Span) {
  let Some(channel) = Channel::from_topic(topic) else {
    return;
  };
  if !conn.is_subscribed(channel.name()) {
    return;
  }

  let update: serde_json::Value = match serde_json::from_slice(bytes) {
    Ok(update) => update,
    Err(e) => {
      tracing::error!(parent: span, topic, "dropping undecodable leaderboard update: {}", e);
      return;
    }
  };
  let payload = match Envelope::new(EventKind::LiveUpdate, update).to_payload() {
    Ok(payload) => payload,
    Err(e) => {
      tracing::error!(parent: span, topic, "failed to serialize live update: {}", e);
      return;
    }
  };

  if let Err(SendError::Full) = conn.try_send(payload) {
    hub.unregister(conn).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{connection::Identity, pubsub::InMemoryPubSub};
  use serde_json::{json, Value};
  use std::time::Duration;
  use tokio::sync::mpsc;

  struct Fixture {
    bridge: Bridge,
    hub: Hub,
    transport: Arc<InMemoryPubSub>,
  }

  fn fixture() -> Fixture {
    let hub = Hub::new();
    let transport = Arc::new(InMemoryPubSub::new());
    let boards = InMemoryLeaderboards::new();
    boards.set(
      Board::Daily,
      vec![LeaderboardEntry::new(2, 8, "bo", 90), LeaderboardEntry::new(1, 7, "al", 120)],
    );
    let bridge = Bridge::new(transport.clone(), Arc::new(boards), hub.clone());
    Fixture { bridge, hub, transport }
  }

  async fn join(hub: &Hub, user_id: u64) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
    let (conn, mut rx) = Connection::new(Identity::new(user_id, format!("user{user_id}")), "leaderboard", 32);
    hub.register(conn.clone()).await;
    // room_info
    rx.recv().await.unwrap();
    (conn, rx)
  }

  async fn next(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .expect("timed out waiting for frame")
      .expect("queue closed");
    serde_json::from_str(&msg).unwrap()
  }

  async fn wait_for_subscribers(transport: &InMemoryPubSub, topic: &str, expected: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
      while transport.subscriber_count(topic) != expected {
        tokio::task::yield_now().await;
      }
    })
    .await
    .expect("subscriber count never settled");
  }

  #[tokio::test]
  async fn subscribe_confirms_then_pushes_snapshot() {
    let f = fixture();
    let (conn, mut rx) = join(&f.hub, 1).await;

    f.bridge
      .handle(&conn, SubscriptionAction::Subscribe, &["daily".to_string()])
      .await;

    let confirmed = next(&mut rx).await;
    assert_eq!(confirmed["type"], "subscription_confirmed");
    assert_eq!(confirmed["data"], json!({"channels": ["daily"], "status": "subscribed"}));

    let current = next(&mut rx).await;
    assert_eq!(current["type"], "current_leaderboard");
    assert_eq!(current["data"]["type"], "daily");
    let entries = current["data"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["username"], "al");
  }

  #[tokio::test]
  async fn unknown_and_snapshotless_channels() {
    let f = fixture();
    let (conn, mut rx) = join(&f.hub, 1).await;

    f.bridge
      .handle(
        &conn,
        SubscriptionAction::Subscribe,
        &["achievements".to_string(), "bogus".to_string()],
      )
      .await;

    let confirmed = next(&mut rx).await;
    assert_eq!(confirmed["data"]["channels"], json!(["achievements"]));
    assert!(rx.try_recv().is_err());
    assert!(conn.is_subscribed("achievements"));
  }

  #[tokio::test]
  async fn only_unknown_channels_attach_nothing() {
    let f = fixture();
    let (conn, mut rx) = join(&f.hub, 1).await;

    f.bridge
      .handle(&conn, SubscriptionAction::Subscribe, &["bogus".to_string()])
      .await;

    let confirmed = next(&mut rx).await;
    assert_eq!(confirmed["data"]["channels"], json!([]));
    assert_eq!(f.transport.subscriber_count("leaderboard:updates"), 0);

    // A later valid subscribe still attaches.
    f.bridge
      .handle(&conn, SubscriptionAction::Subscribe, &["updates".to_string()])
      .await;
    assert_eq!(f.transport.subscriber_count("leaderboard:updates"), 1);
  }

  /// Transport whose subscriptions always fail.
  #[derive(Default)]
  struct DeadTransport {
    attempts: std::sync::atomic::AtomicUsize,
  }

  #[async_trait]
  impl PubSubBackend for DeadTransport {
    async fn publish_bytes(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), crate::error::PubSubError> {
      Ok(())
    }

    async fn subscribe_bytes(
      &self,
      _topics: &[String],
      _handler: crate::pubsub::MessageHandler,
    ) -> Result<crate::pubsub::Subscription, crate::error::PubSubError> {
      self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      Err(crate::error::PubSubError::Unavailable("connection refused".into()))
    }
  }

  #[tokio::test]
  async fn failed_transport_subscription_keeps_connection_and_retries() {
    let hub = Hub::new();
    let transport = Arc::new(DeadTransport::default());
    let boards = InMemoryLeaderboards::new();
    boards.set(Board::Global, vec![LeaderboardEntry::new(1, 9, "zed", 999)]);
    let bridge = Bridge::new(transport.clone(), Arc::new(boards), hub.clone());
    let (conn, mut rx) = join(&hub, 1).await;

    for _ in 0..2 {
      bridge
        .handle(&conn, SubscriptionAction::Subscribe, &["global".to_string()])
        .await;
      assert_eq!(next(&mut rx).await["type"], "subscription_confirmed");
      let current = next(&mut rx).await;
      assert_eq!(current["type"], "current_leaderboard");
      assert_eq!(current["data"]["entries"][0]["username"], "zed");
    }

    assert_eq!(transport.attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(conn.is_active());
    assert!(hub.contains(conn.id()).await);
    assert!(conn.is_subscribed("global"));
  }

  #[tokio::test]
  async fn get_current_does_not_subscribe() {
    let f = fixture();
    let (conn, mut rx) = join(&f.hub, 1).await;

    f.bridge
      .handle(&conn, SubscriptionAction::GetCurrent, &["daily".to_string()])
      .await;
    assert_eq!(next(&mut rx).await["type"], "current_leaderboard");
    assert!(!conn.is_subscribed("daily"));
    assert_eq!(f.transport.subscriber_count("leaderboard:daily"), 0);
  }

  #[tokio::test]
  async fn relays_only_subscribed_channels() {
    let f = fixture();
    let (conn, mut rx) = join(&f.hub, 1).await;

    f.bridge
      .handle(&conn, SubscriptionAction::Subscribe, &["rank_changes".to_string()])
      .await;
    next(&mut rx).await;

    f.transport
      .publish("leaderboard:daily", &json!({"type": "leaderboard_update"}))
      .await
      .unwrap();
    f.transport
      .publish("leaderboard:rank_changes", &json!({"type": "rank_change", "data": {"new_rank": 1}}))
      .await
      .unwrap();

    let update = next(&mut rx).await;
    assert_eq!(update["type"], "live_update");
    assert_eq!(update["data"]["type"], "rank_change");
    assert_eq!(update["data"]["data"]["new_rank"], 1);

    f.bridge
      .handle(&conn, SubscriptionAction::Unsubscribe, &["rank_changes".to_string()])
      .await;
    assert_eq!(next(&mut rx).await["data"]["status"], "unsubscribed");
    f.transport
      .publish("leaderboard:rank_changes", &json!({"type": "rank_change"}))
      .await
      .unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
  }

  #[tokio::test]
  async fn relay_attaches_once_and_is_released_on_close() {
    let f = fixture();
    let (conn, _rx) = join(&f.hub, 1).await;

    for channel in ["daily", "weekly"] {
      f.bridge
        .handle(&conn, SubscriptionAction::Subscribe, &[channel.to_string()])
        .await;
    }
    assert_eq!(f.transport.subscriber_count("leaderboard:updates"), 1);

    f.hub.unregister(&conn).await;
    wait_for_subscribers(&f.transport, "leaderboard:updates", 0).await;
  }
}
