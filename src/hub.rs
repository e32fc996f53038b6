//! Connection registry and room fan-out.
//!
//! The [`Hub`] owns global membership and room membership behind a single
//! `RwLock`. Every mutation (register, unregister, room switch, and any broadcast
//! that has to evict a slow consumer) runs under the write lock, so callers never
//! observe a connection that is registered but missing from its room, or an empty
//! room. Snapshots take the read lock.

use crate::{
  connection::{Connection, ConnectionId},
  protocol::{unix_timestamp, Envelope, EventKind, GameUpdate, PlayerInfo, RoomInfo},
};
use serde::Serialize;
use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
};
use tokio::sync::RwLock;
use tracing::Span;

/// Largest page accepted by [`Hub::active_rooms_page`].
pub const MAX_PAGE_SIZE: usize = 100;

type Members = HashMap<ConnectionId, Arc<Connection>>;

#[derive(Default)]
struct HubState {
  clients: Members,
  // Ordered so paging is deterministic.
  rooms: BTreeMap<String, Members>,
}

impl HubState {
  fn insert(&mut self, conn: Arc<Connection>) {
    self
      .rooms
      .entry(conn.room_id())
      .or_default()
      .insert(conn.id(), conn.clone());
    self.clients.insert(conn.id(), conn);
  }

  /// Remove from global and room membership. Returns the room it was in.
  fn remove(&mut self, id: ConnectionId) -> Option<String> {
    let conn = self.clients.remove(&id)?;
    let room_id = conn.room_id();
    self.leave_room(&room_id, id);
    Some(room_id)
  }

  fn leave_room(&mut self, room_id: &str, id: ConnectionId) {
    if let Some(members) = self.rooms.get_mut(room_id) {
      members.remove(&id);
      if members.is_empty() {
        self.rooms.remove(room_id);
      }
    }
  }

  /// Try to enqueue on every member of `room_id` except `except`.
  /// Returns the members whose queue overflowed or was already closed.
  fn send_to_room(
    &self,
    room_id: &str,
    payload: &Arc<str>,
    except: Option<ConnectionId>,
  ) -> Vec<Arc<Connection>> {
    let Some(members) = self.rooms.get(room_id) else {
      return Vec::new();
    };
    members
      .values()
      .filter(|conn| Some(conn.id()) != except)
      .filter(|conn| conn.try_send(payload.clone()).is_err())
      .cloned()
      .collect()
  }

  fn send_to_all(&self, payload: &Arc<str>) -> Vec<Arc<Connection>> {
    self
      .clients
      .values()
      .filter(|conn| conn.try_send(payload.clone()).is_err())
      .cloned()
      .collect()
  }

  /// Drop unresponsive connections, telling each one's room that it left.
  /// Notifying may overflow further queues, so this runs until nothing is pending.
  fn evict(&mut self, mut pending: Vec<Arc<Connection>>, span: &Span) {
    while let Some(conn) = pending.pop() {
      conn.close();
      let Some(room_id) = self.remove(conn.id()) else {
        continue;
      };
      tracing::warn!(
        parent: span,
        conn_id = conn.id(),
        user_id = conn.user_id(),
        room_id = %room_id,
        "dropping unresponsive connection"
      );
      if let Some(payload) = presence_payload(EventKind::PlayerLeft, &conn, "left", span) {
        pending.extend(self.send_to_room(&room_id, &payload, None));
      }
    }
  }

  fn snapshot(&self, room_id: &str) -> RoomInfo {
    let mut players: Vec<(ConnectionId, PlayerInfo)> = self
      .rooms
      .get(room_id)
      .map(|members| {
        members
          .values()
          .map(|conn| {
            (
              conn.id(),
              PlayerInfo {
                user_id: conn.user_id(),
                username: conn.username().to_string(),
                current_score: conn.current_score(),
                is_online: conn.is_active(),
              },
            )
          })
          .collect()
      })
      .unwrap_or_default();
    players.sort_by_key(|(id, _)| *id);

    RoomInfo {
      room_id: room_id.to_string(),
      player_count: players.len(),
      players: players.into_iter().map(|(_, info)| info).collect(),
    }
  }

  #[cfg(test)]
  fn assert_consistent(&self) {
    let mut seen = 0;
    for (room_id, members) in &self.rooms {
      assert!(!members.is_empty(), "empty room {room_id} left in registry");
      for (id, conn) in members {
        assert!(self.clients.contains_key(id), "room member {id} missing from clients");
        assert_eq!(&conn.room_id(), room_id);
        seen += 1;
      }
    }
    assert_eq!(seen, self.clients.len(), "client in zero or several rooms");
  }
}

fn encode<T: Serialize>(kind: EventKind, data: T, span: &Span) -> Option<Arc<str>> {
  match Envelope::new(kind, data).to_payload() {
    Ok(payload) => Some(payload),
    Err(e) => {
      tracing::error!(parent: span, ?kind, "failed to serialize envelope: {}", e);
      None
    }
  }
}

fn presence_payload(kind: EventKind, conn: &Connection, action: &str, span: &Span) -> Option<Arc<str>> {
  encode(
    kind,
    GameUpdate {
      user_id: conn.user_id(),
      username: conn.username().to_string(),
      current_score: conn.current_score(),
      action: action.to_string(),
      timestamp: unix_timestamp(),
    },
    span,
  )
}

/// Registry of live connections grouped by room.
#[derive(Clone)]
pub struct Hub {
  state: Arc<RwLock<HubState>>,
  span: Span,
}

impl Hub {
  pub fn new() -> Self {
    Self::with_span(tracing::info_span!("hub"))
  }

  /// Create a hub that logs under the given span.
  pub fn with_span(span: Span) -> Self {
    Self {
      state: Arc::new(RwLock::new(HubState::default())),
      span,
    }
  }

  /// Add a connection to global membership and to its room.
  ///
  /// The rest of the room gets `player_joined`; the newcomer gets `room_info`. If
  /// the newcomer's queue cannot take the snapshot it is removed again instead of
  /// staying half-registered.
  pub async fn register(&self, conn: Arc<Connection>) {
    let mut state = self.state.write().await;
    if !conn.is_active() || state.clients.contains_key(&conn.id()) {
      return;
    }

    let room_id = conn.room_id();
    state.insert(conn.clone());
    tracing::info!(
      parent: &self.span,
      conn_id = conn.id(),
      user_id = conn.user_id(),
      username = conn.username(),
      room_id = %room_id,
      "player joined room"
    );

    let mut failed = Vec::new();
    if let Some(joined) = presence_payload(EventKind::PlayerJoined, &conn, "joined", &self.span) {
      failed.extend(state.send_to_room(&room_id, &joined, Some(conn.id())));
    }
    let info = state.snapshot(&room_id);
    if let Some(payload) = encode(EventKind::RoomInfo, info, &self.span) {
      if conn.try_send(payload).is_err() {
        failed.push(conn.clone());
      }
    }
    state.evict(failed, &self.span);
  }

  /// Remove a connection and tell its room. Calling it again is a no-op.
  ///
  /// Returns `true` if the connection was registered.
  pub async fn unregister(&self, conn: &Connection) -> bool {
    let mut state = self.state.write().await;
    conn.close();
    let Some(room_id) = state.remove(conn.id()) else {
      return false;
    };
    tracing::info!(
      parent: &self.span,
      conn_id = conn.id(),
      user_id = conn.user_id(),
      room_id = %room_id,
      "player left room"
    );

    if let Some(left) = presence_payload(EventKind::PlayerLeft, conn, "left", &self.span) {
      let failed = state.send_to_room(&room_id, &left, None);
      state.evict(failed, &self.span);
    }
    true
  }

  /// Move a connection to `room_id`, creating the room if needed and deleting the
  /// old one if it empties. Returns the snapshot of the target room.
  pub async fn switch_room(&self, conn: &Arc<Connection>, room_id: &str) -> RoomInfo {
    let mut state = self.state.write().await;
    if !state.clients.contains_key(&conn.id()) {
      return state.snapshot(room_id);
    }

    let previous = conn.room_id();
    if previous == room_id {
      return state.snapshot(room_id);
    }

    state.leave_room(&previous, conn.id());
    conn.set_room(room_id);
    state
      .rooms
      .entry(room_id.to_string())
      .or_default()
      .insert(conn.id(), conn.clone());
    tracing::info!(
      parent: &self.span,
      conn_id = conn.id(),
      user_id = conn.user_id(),
      from = %previous,
      to = %room_id,
      "player switched room"
    );

    let mut failed = Vec::new();
    if let Some(left) = presence_payload(EventKind::PlayerLeft, conn, "left", &self.span) {
      failed.extend(state.send_to_room(&previous, &left, None));
    }
    if let Some(joined) = presence_payload(EventKind::PlayerJoined, conn, "joined", &self.span) {
      failed.extend(state.send_to_room(room_id, &joined, Some(conn.id())));
    }
    state.evict(failed, &self.span);
    state.snapshot(room_id)
  }

  /// Enqueue `payload` on every registered connection.
  pub async fn broadcast_all(&self, payload: Arc<str>) {
    let mut state = self.state.write().await;
    let failed = state.send_to_all(&payload);
    state.evict(failed, &self.span);
  }

  /// Enqueue `payload` on every member of `room_id`.
  pub async fn broadcast_room(&self, room_id: &str, payload: Arc<str>) {
    let mut state = self.state.write().await;
    let failed = state.send_to_room(room_id, &payload, None);
    state.evict(failed, &self.span);
  }

  /// Enqueue `payload` on every member of `room_id` other than `except`.
  pub async fn broadcast_room_except(&self, room_id: &str, payload: Arc<str>, except: ConnectionId) {
    let mut state = self.state.write().await;
    let failed = state.send_to_room(room_id, &payload, Some(except));
    state.evict(failed, &self.span);
  }

  /// Serialize `data` as a `kind` envelope and send it to the room.
  pub async fn broadcast_event<T: Serialize>(&self, room_id: &str, kind: EventKind, data: T) {
    if let Some(payload) = encode(kind, data, &self.span) {
      self.broadcast_room(room_id, payload).await;
    }
  }

  /// Point-in-time view of a room. Unknown rooms report zero players.
  pub async fn room_snapshot(&self, room_id: &str) -> RoomInfo {
    self.state.read().await.snapshot(room_id)
  }

  /// One page of non-empty rooms ordered by room id.
  ///
  /// `page` is 1-based and clamped to at least 1; `page_size` is clamped to
  /// `1..=MAX_PAGE_SIZE`.
  pub async fn active_rooms_page(&self, page: usize, page_size: usize) -> Vec<RoomInfo> {
    let page = page.max(1);
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1).saturating_mul(page_size);

    let state = self.state.read().await;
    state
      .rooms
      .iter()
      .filter(|(_, members)| !members.is_empty())
      .skip(offset)
      .take(page_size)
      .map(|(room_id, _)| state.snapshot(room_id))
      .collect()
  }

  pub async fn client_count(&self) -> usize {
    self.state.read().await.clients.len()
  }

  pub async fn room_count(&self) -> usize {
    self.state.read().await.rooms.len()
  }

  pub async fn contains(&self, id: ConnectionId) -> bool {
    self.state.read().await.clients.contains_key(&id)
  }

  #[cfg(test)]
  pub(crate) async fn assert_consistent(&self) {
    self.state.read().await.assert_consistent();
  }
}

impl Default for Hub {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::{ConnectionState, Identity};
  use tokio::sync::mpsc;

  fn connect(user_id: u64, room: &str, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
    Connection::new(Identity::new(user_id, format!("user{user_id}")), room, capacity)
  }

  fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
      out.push(serde_json::from_str(&msg).unwrap());
    }
    out
  }

  fn types(messages: &[serde_json::Value]) -> Vec<String> {
    messages.iter().map(|m| m["type"].as_str().unwrap().to_string()).collect()
  }

  #[tokio::test]
  async fn register_notifies_room_and_sends_snapshot() {
    let hub = Hub::new();
    let (a, mut rx_a) = connect(1, "arena", 16);
    let (b, mut rx_b) = connect(2, "arena", 16);

    hub.register(a.clone()).await;
    hub.register(b.clone()).await;
    hub.assert_consistent().await;

    let to_a = drain(&mut rx_a);
    assert_eq!(types(&to_a), vec!["room_info", "player_joined"]);
    assert_eq!(to_a[1]["data"]["user_id"], 2);
    assert_eq!(to_a[1]["data"]["action"], "joined");

    let to_b = drain(&mut rx_b);
    assert_eq!(types(&to_b), vec!["room_info"]);
    assert_eq!(to_b[0]["data"]["player_count"], 2);
  }

  #[tokio::test]
  async fn unregister_is_idempotent_and_removes_empty_room() {
    let hub = Hub::new();
    let (a, _rx_a) = connect(1, "solo", 4);
    hub.register(a.clone()).await;
    assert_eq!(hub.room_count().await, 1);

    assert!(hub.unregister(&a).await);
    assert!(!hub.unregister(&a).await);
    assert_eq!(hub.client_count().await, 0);
    assert_eq!(hub.room_count().await, 0);
    assert_eq!(a.state(), ConnectionState::Closed);
  }

  #[tokio::test]
  async fn unregister_notifies_remaining_members() {
    let hub = Hub::new();
    let (a, mut rx_a) = connect(1, "arena", 16);
    let (b, _rx_b) = connect(2, "arena", 16);
    hub.register(a.clone()).await;
    hub.register(b.clone()).await;
    drain(&mut rx_a);

    hub.unregister(&b).await;
    let to_a = drain(&mut rx_a);
    assert_eq!(types(&to_a), vec!["player_left"]);
    assert_eq!(to_a[0]["data"]["user_id"], 2);
  }

  #[tokio::test]
  async fn switch_room_moves_membership_atomically() {
    let hub = Hub::new();
    let (a, _rx_a) = connect(1, "default", 16);
    let (b, mut rx_b) = connect(2, "arena", 16);
    hub.register(a.clone()).await;
    hub.register(b.clone()).await;
    drain(&mut rx_b);

    let info = hub.switch_room(&a, "arena").await;
    hub.assert_consistent().await;

    assert_eq!(info.room_id, "arena");
    assert_eq!(info.player_count, 2);
    assert_eq!(a.room_id(), "arena");
    assert_eq!(hub.room_snapshot("default").await.player_count, 0);
    assert_eq!(hub.room_count().await, 1);
    assert_eq!(types(&drain(&mut rx_b)), vec!["player_joined"]);
  }

  #[tokio::test]
  async fn broadcast_except_skips_sender() {
    let hub = Hub::new();
    let mut conns = Vec::new();
    for id in 1..=4 {
      let (conn, rx) = connect(id, "arena", 16);
      hub.register(conn.clone()).await;
      conns.push((conn, rx));
    }
    for (_, rx) in conns.iter_mut() {
      drain(rx);
    }

    let sender = conns[0].0.id();
    hub
      .broadcast_room_except("arena", Arc::from(r#"{"type":"score_update","data":{}}"#), sender)
      .await;

    for (conn, rx) in conns.iter_mut() {
      let got = drain(rx);
      if conn.id() == sender {
        assert!(got.is_empty());
      } else {
        assert_eq!(types(&got), vec!["score_update"]);
      }
    }
  }

  #[tokio::test]
  async fn broadcast_except_in_single_member_room_delivers_nothing() {
    let hub = Hub::new();
    let (a, mut rx_a) = connect(1, "solo", 4);
    hub.register(a.clone()).await;
    drain(&mut rx_a);

    hub.broadcast_room_except("solo", Arc::from("{}"), a.id()).await;
    assert!(drain(&mut rx_a).is_empty());
  }

  #[tokio::test]
  async fn saturated_queue_is_evicted_and_closed_once() {
    let hub = Hub::new();
    let capacity = 4;
    let (slow, mut slow_rx) = connect(1, "arena", capacity);
    let (fast, mut fast_rx) = connect(2, "arena", 64);
    hub.register(slow.clone()).await;
    hub.register(fast.clone()).await;
    drain(&mut slow_rx);
    drain(&mut fast_rx);

    for _ in 0..=capacity {
      hub.broadcast_room("arena", Arc::from("{}")).await;
    }

    assert!(!hub.contains(slow.id()).await);
    assert!(hub.contains(fast.id()).await);
    assert_eq!(slow.state(), ConnectionState::Closed);
    assert!(!slow.close());
    hub.assert_consistent().await;

    // The survivor hears about the eviction.
    let to_fast = drain(&mut fast_rx);
    assert_eq!(to_fast.len(), capacity + 2);
    assert_eq!(to_fast.last().unwrap()["type"], "player_left");

    // Actor cleanup afterwards is harmless.
    assert!(!hub.unregister(&slow).await);
  }

  #[tokio::test]
  async fn member_overflowing_on_join_notice_is_evicted() {
    let hub = Hub::new();
    // room_info alone fills a one-slot queue.
    let (slow, _slow_rx) = connect(1, "arena", 1);
    hub.register(slow.clone()).await;
    assert!(hub.contains(slow.id()).await);

    let (fast, mut fast_rx) = connect(2, "arena", 64);
    hub.register(fast.clone()).await;

    assert!(!hub.contains(slow.id()).await);
    assert!(hub.contains(fast.id()).await);
    assert_eq!(slow.state(), ConnectionState::Closed);
    hub.assert_consistent().await;

    let to_fast = drain(&mut fast_rx);
    let kinds: Vec<_> = to_fast.iter().map(|m| m["type"].as_str().unwrap().to_string()).collect();
    assert_eq!(kinds, vec!["room_info", "player_left"]);
    assert_eq!(to_fast[1]["data"]["user_id"], 1);
    assert_eq!(hub.room_snapshot("arena").await.player_count, 1);
  }

  #[tokio::test]
  async fn newcomer_without_room_for_snapshot_is_not_left_registered() {
    let hub = Hub::new();
    let (a, _rx_a) = connect(1, "arena", 1);
    assert!(a.try_send(Arc::from("{}")).is_ok());

    hub.register(a.clone()).await;
    assert!(!hub.contains(a.id()).await);
    assert_eq!(hub.room_count().await, 0);
  }

  #[tokio::test]
  async fn broadcast_all_reaches_every_room() {
    let hub = Hub::new();
    let (a, mut rx_a) = connect(1, "one", 8);
    let (b, mut rx_b) = connect(2, "two", 8);
    hub.register(a).await;
    hub.register(b).await;
    drain(&mut rx_a);
    drain(&mut rx_b);

    hub.broadcast_all(Arc::from(r#"{"type":"live_update","data":{}}"#)).await;
    assert_eq!(drain(&mut rx_a).len(), 1);
    assert_eq!(drain(&mut rx_b).len(), 1);
  }

  #[tokio::test]
  async fn snapshot_reports_scores_and_presence() {
    let hub = Hub::new();
    let (a, _rx) = connect(9, "arena", 8);
    a.set_score(120);
    hub.register(a.clone()).await;

    let info = hub.room_snapshot("arena").await;
    assert_eq!(
      info.players,
      vec![PlayerInfo {
        user_id: 9,
        username: "user9".into(),
        current_score: 120,
        is_online: true,
      }]
    );
    assert_eq!(hub.room_snapshot("nowhere").await.player_count, 0);
  }

  #[tokio::test]
  async fn active_rooms_page_is_ordered_and_clamped() {
    let hub = Hub::new();
    let mut keep = Vec::new();
    for (i, room) in ["c", "a", "b"].iter().enumerate() {
      let (conn, rx) = connect(i as u64, room, 8);
      hub.register(conn.clone()).await;
      keep.push((conn, rx));
    }

    let rooms: Vec<String> = hub
      .active_rooms_page(0, 0)
      .await
      .into_iter()
      .map(|r| r.room_id)
      .collect();
    assert_eq!(rooms, vec!["a"]);

    let page2: Vec<String> = hub
      .active_rooms_page(2, 2)
      .await
      .into_iter()
      .map(|r| r.room_id)
      .collect();
    assert_eq!(page2, vec!["c"]);

    assert_eq!(hub.active_rooms_page(1, 10_000).await.len(), 3);
    assert!(hub.active_rooms_page(9, 20).await.is_empty());
  }

  #[tokio::test]
  async fn concurrent_churn_keeps_registry_consistent() {
    let hub = Hub::new();
    let mut handles = Vec::new();
    for worker in 0..8u64 {
      let hub = hub.clone();
      handles.push(tokio::spawn(async move {
        let mut receivers = Vec::new();
        for i in 0..25u64 {
          let room = format!("room{}", (worker + i) % 5);
          let (conn, rx) = connect(worker * 100 + i, &room, 1024);
          receivers.push(rx);
          hub.register(conn.clone()).await;
          hub.switch_room(&conn, &format!("room{}", i % 3)).await;
          let page = hub.active_rooms_page(1, 20).await;
          assert!(page.iter().all(|r| r.player_count > 0));
          if i % 2 == 0 {
            hub.unregister(&conn).await;
          }
        }
        receivers
      }));
    }
    // Receivers stay alive until the end so nobody is evicted for a closed queue.
    let mut receivers = Vec::new();
    for handle in handles {
      receivers.push(handle.await.unwrap());
    }
    hub.assert_consistent().await;
    assert_eq!(hub.client_count().await, 8 * 12);
  }
}
