//! HTTP entry points: WebSocket upgrade routes wired to the hub, bridge and limiter.
//!
//! ## Example Usage
//! ```no_run
//! use scorecast::{auth::JwtIdentity, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!   Server::new(JwtIdentity::new("my-secret-key"))
//!     .listen("0.0.0.0:3000".parse()?)
//!     .await
//! }
//! ```

use crate::{
  auth::IdentityProvider,
  bridge::{Bridge, EmptyLeaderboards, LeaderboardSource, DEFAULT_SNAPSHOT_LIMIT},
  client::Client,
  config::ConnectionSettings,
  connection::{Connection, Identity},
  hub::Hub,
  pubsub::{InMemoryPubSub, PubSubBackend},
  rate_limit::{
    http::{enforce, FailMode, RateGate},
    RateLimiter, RateRule,
  },
};
use axum::{
  extract::{ws::WebSocketUpgrade, Query, State},
  http::{header, HeaderMap, Method, StatusCode},
  middleware,
  response::{IntoResponse, Response},
  routing::get,
  Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
  compression::CompressionLayer,
  cors::{Any, CorsLayer},
  trace::TraceLayer,
};

pub const DEFAULT_ROOM: &str = "default";
pub const LEADERBOARD_ROOM: &str = "leaderboard";

#[derive(Clone)]
struct AppState {
  identity: Arc<dyn IdentityProvider>,
  hub: Hub,
  bridge: Bridge,
  limiter: RateLimiter,
  settings: ConnectionSettings,
}

#[derive(Debug, Deserialize)]
struct SocketParams {
  token: Option<String>,
  room: Option<String>,
}

/// Builder for the real-time server.
pub struct Server {
  identity: Arc<dyn IdentityProvider>,
  hub: Hub,
  pubsub: Arc<dyn PubSubBackend>,
  leaderboards: Arc<dyn LeaderboardSource>,
  limiter: RateLimiter,
  api_rule: RateRule,
  fail_mode: FailMode,
  settings: ConnectionSettings,
  snapshot_limit: usize,
}

impl Server {
  /// A server with an in-process transport, no leaderboard data and an in-memory limiter.
  pub fn new(identity: impl IdentityProvider + 'static) -> Self {
    Self {
      identity: Arc::new(identity),
      hub: Hub::new(),
      pubsub: Arc::new(InMemoryPubSub::new()),
      leaderboards: Arc::new(EmptyLeaderboards),
      limiter: RateLimiter::in_memory(),
      api_rule: RateRule::api(),
      fail_mode: FailMode::Open,
      settings: ConnectionSettings::default(),
      snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
    }
  }

  pub fn with_hub(mut self, hub: Hub) -> Self {
    self.hub = hub;
    self
  }

  /// Transport carrying leaderboard topics between instances.
  pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSubBackend>) -> Self {
    self.pubsub = pubsub;
    self
  }

  pub fn with_leaderboards(mut self, leaderboards: Arc<dyn LeaderboardSource>) -> Self {
    self.leaderboards = leaderboards;
    self
  }

  /// Limiter used for per-IP upgrade gating and per-user score submissions.
  pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
    self.limiter = limiter;
    self
  }

  /// Rule applied per caller IP to every upgrade request.
  pub fn with_api_rule(mut self, rule: RateRule) -> Self {
    self.api_rule = rule;
    self
  }

  pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
    self.fail_mode = fail_mode;
    self
  }

  pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn with_snapshot_limit(mut self, limit: usize) -> Self {
    self.snapshot_limit = limit;
    self
  }

  pub fn hub(&self) -> &Hub {
    &self.hub
  }

  pub fn bridge(&self) -> Bridge {
    Bridge::new(self.pubsub.clone(), self.leaderboards.clone(), self.hub.clone())
      .with_snapshot_limit(self.snapshot_limit)
  }

  /// Routes `/ws` and `/ws/leaderboard` with tracing, CORS, compression and rate gating.
  pub fn router(&self) -> Router {
    let state = AppState {
      identity: self.identity.clone(),
      hub: self.hub.clone(),
      bridge: self.bridge(),
      limiter: self.limiter.clone(),
      settings: self.settings.clone(),
    };
    let gate = RateGate::new(self.limiter.clone(), self.api_rule.clone()).with_fail_mode(self.fail_mode);

    let cors = CorsLayer::new()
      .allow_methods([Method::GET])
      .allow_origin(Any)
      .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
      .route("/ws", get(game_socket))
      .route("/ws/leaderboard", get(leaderboard_socket))
      .layer(middleware::from_fn_with_state(gate, enforce))
      .layer(cors)
      .layer(TraceLayer::new_for_http())
      .layer(CompressionLayer::new())
      .with_state(state)
  }

  /// Bind `addr` and serve until Ctrl-C.
  pub async fn listen(self, addr: SocketAddr) -> anyhow::Result<()> {
    self.settings.validate()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(
      listener,
      self.router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
  }
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!("failed to listen for shutdown signal: {}", e);
    std::future::pending::<()>().await;
  }
  tracing::info!("shutting down");
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
  headers
    .get(header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
    .map(|t| t.trim().to_string())
    .filter(|t| !t.is_empty())
}

fn unauthorized(message: &str) -> Response {
  (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

async fn authenticate(state: &AppState, headers: &HeaderMap, token: Option<String>) -> Result<Identity, Response> {
  let Some(token) = bearer_token(headers).or(token.filter(|t| !t.is_empty())) else {
    return Err(unauthorized("Authorization required"));
  };
  state.identity.identify(&token).await.map_err(|e| {
    tracing::debug!("rejected socket token: {:#}", e);
    unauthorized("Invalid or expired token")
  })
}

async fn game_socket(
  State(state): State<AppState>,
  Query(params): Query<SocketParams>,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> Response {
  let identity = match authenticate(&state, &headers, params.token).await {
    Ok(identity) => identity,
    Err(response) => return response,
  };
  let room = params
    .room
    .filter(|r| !r.is_empty())
    .unwrap_or_else(|| DEFAULT_ROOM.to_string());
  upgrade(state, ws, identity, room, false)
}

async fn leaderboard_socket(
  State(state): State<AppState>,
  Query(params): Query<SocketParams>,
  headers: HeaderMap,
  ws: WebSocketUpgrade,
) -> Response {
  let identity = match authenticate(&state, &headers, params.token).await {
    Ok(identity) => identity,
    Err(response) => return response,
  };
  upgrade(state, ws, identity, LEADERBOARD_ROOM.to_string(), true)
}

fn upgrade(state: AppState, ws: WebSocketUpgrade, identity: Identity, room: String, leaderboard: bool) -> Response {
  ws.max_message_size(state.settings.max_message_size)
    .on_upgrade(move |socket| async move {
      let (conn, outbound) = Connection::new(identity, room, state.settings.queue_capacity);
      let mut client = Client::new(conn, state.hub, state.settings).with_limiter(state.limiter);
      if leaderboard {
        client = client.with_bridge(state.bridge);
      }
      let (sink, stream) = socket.split();
      client.run(sink, stream, outbound).await;
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    bridge::{Board, InMemoryLeaderboards, LeaderboardEntry},
    pubsub::PubSubExt,
  };
  use async_trait::async_trait;
  use futures::SinkExt;
  use serde_json::Value;
  use std::time::Duration;
  use tokio::net::TcpStream;
  use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

  type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

  /// Tokens are `<user_id>:<username>`.
  struct PlainIdentity;

  #[async_trait]
  impl IdentityProvider for PlainIdentity {
    async fn identify(&self, token: &str) -> anyhow::Result<Identity> {
      let (id, name) = token.split_once(':').ok_or_else(|| anyhow::anyhow!("bad token"))?;
      Ok(Identity::new(id.parse()?, name))
    }
  }

  async fn serve(server: Server) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.router().into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
  }

  async fn connect(addr: SocketAddr, path: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    socket
  }

  async fn expect_type(socket: &mut Socket, kind: &str) -> Value {
    loop {
      let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out")
        .expect("socket closed")
        .unwrap();
      if let Message::Text(text) = frame {
        for line in text.as_str().split('\n') {
          let value: Value = serde_json::from_str(line).unwrap();
          if value["type"] == kind {
            return value;
          }
        }
      }
    }
  }

  #[tokio::test]
  async fn score_updates_fan_out_over_real_sockets() {
    let server = Server::new(PlainIdentity);
    let hub = server.hub().clone();
    let addr = serve(server).await;

    let mut a = connect(addr, "/ws?token=1:ada&room=arena").await;
    expect_type(&mut a, "room_info").await;
    let mut b = connect(addr, "/ws?token=2:bo&room=arena").await;
    expect_type(&mut b, "room_info").await;
    expect_type(&mut a, "player_joined").await;
    assert_eq!(hub.room_snapshot("arena").await.player_count, 2);

    a.send(Message::text(r#"{"type":"score_update","data":{"score":42}}"#))
      .await
      .unwrap();
    let update = expect_type(&mut b, "score_update").await;
    assert_eq!(update["data"]["user_id"], 1);
    assert_eq!(update["data"]["current_score"], 42);

    a.close(None).await.unwrap();
    let left = expect_type(&mut b, "player_left").await;
    assert_eq!(left["data"]["username"], "ada");
  }

  #[tokio::test]
  async fn leaderboard_socket_serves_snapshots_and_live_updates() {
    let transport = Arc::new(InMemoryPubSub::new());
    let boards = Arc::new(InMemoryLeaderboards::new());
    boards.set(Board::Global, vec![LeaderboardEntry::new(1, 9, "zed", 999)]);
    let server = Server::new(PlainIdentity)
      .with_pubsub(transport.clone())
      .with_leaderboards(boards);
    let addr = serve(server).await;

    let mut socket = connect(addr, "/ws/leaderboard?token=3:cy").await;
    let info = expect_type(&mut socket, "room_info").await;
    assert_eq!(info["data"]["room_id"], "leaderboard");

    socket
      .send(Message::text(r#"{"type":"subscribe","channels":["global"]}"#))
      .await
      .unwrap();
    expect_type(&mut socket, "subscription_confirmed").await;
    let current = expect_type(&mut socket, "current_leaderboard").await;
    assert_eq!(current["data"]["entries"][0]["username"], "zed");

    transport
      .publish("leaderboard:global", &json!({"type": "leaderboard_update"}))
      .await
      .unwrap();
    let live = expect_type(&mut socket, "live_update").await;
    assert_eq!(live["data"]["type"], "leaderboard_update");
  }

  #[tokio::test]
  async fn upgrade_requires_valid_token() {
    let addr = serve(Server::new(PlainIdentity)).await;
    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/ws?token=garbage")).await.is_err());
  }

  #[tokio::test]
  async fn upgrades_are_rate_limited_per_ip() {
    let server = Server::new(PlainIdentity).with_api_rule(RateRule::new("api", 1, Duration::from_secs(60)));
    let addr = serve(server).await;

    let _first = connect(addr, "/ws?token=1:ada").await;
    let err = connect_async(format!("ws://{addr}/ws?token=1:ada")).await.unwrap_err();
    assert!(err.to_string().contains("429"), "expected 429, got {err}");
  }

  #[test]
  fn bearer_header_is_parsed() {
    let mut headers = HeaderMap::new();
    assert_eq!(bearer_token(&headers), None);
    headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
    assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
  }
}
