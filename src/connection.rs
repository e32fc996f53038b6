//! Shared handle for one live client stream.
//!
//! A [`Connection`] is owned by its actor (see [`crate::client`]); the hub and the
//! pub/sub bridge hold `Arc` clones for lookup and fan-out. The outbound queue is
//! bounded and only ever written through [`Connection::try_send`], which never blocks.
//! A full queue closes the connection.

use crate::error::SendError;
use std::{
  collections::HashSet,
  sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
  },
};
use tokio::sync::{mpsc, watch};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
  pub user_id: u64,
  pub username: String,
}

impl Identity {
  pub fn new(user_id: u64, username: impl Into<String>) -> Self {
    Self {
      user_id,
      username: username.into(),
    }
  }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
  Active = 0,
  Closing = 1,
  Closed = 2,
}

impl ConnectionState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => ConnectionState::Active,
      1 => ConnectionState::Closing,
      _ => ConnectionState::Closed,
    }
  }
}

pub struct Connection {
  id: ConnectionId,
  identity: Identity,
  room: Mutex<String>,
  score: AtomicI64,
  state: AtomicU8,
  sender: Mutex<Option<mpsc::Sender<Arc<str>>>>,
  closed_tx: watch::Sender<bool>,
  subscriptions: Mutex<HashSet<String>>,
  relay_attached: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
  /// Create a connection in `room` with an outbound queue of `capacity` messages.
  ///
  /// Returns the shared handle and the receiving end of the queue, which belongs to
  /// the write loop.
  pub fn new(
    identity: Identity,
    room: impl Into<String>,
    capacity: usize,
  ) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (closed_tx, _) = watch::channel(false);
    let conn = Arc::new(Self {
      id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
      identity,
      room: Mutex::new(room.into()),
      score: AtomicI64::new(0),
      state: AtomicU8::new(ConnectionState::Active as u8),
      sender: Mutex::new(Some(tx)),
      closed_tx,
      subscriptions: Mutex::new(HashSet::new()),
      relay_attached: AtomicBool::new(false),
    });
    (conn, rx)
  }

  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn identity(&self) -> &Identity {
    &self.identity
  }

  pub fn user_id(&self) -> u64 {
    self.identity.user_id
  }

  pub fn username(&self) -> &str {
    &self.identity.username
  }

  /// Room the connection currently belongs to.
  pub fn room_id(&self) -> String {
    lock(&self.room).clone()
  }

  /// Only the hub moves connections between rooms, under its write lock.
  pub(crate) fn set_room(&self, room_id: &str) -> String {
    std::mem::replace(&mut *lock(&self.room), room_id.to_string())
  }

  /// Last score reported by the client.
  pub fn current_score(&self) -> i64 {
    self.score.load(Ordering::Relaxed)
  }

  pub fn set_score(&self, score: i64) {
    self.score.store(score, Ordering::Relaxed);
  }

  pub fn state(&self) -> ConnectionState {
    ConnectionState::from_u8(self.state.load(Ordering::Acquire))
  }

  pub fn is_active(&self) -> bool {
    self.state() == ConnectionState::Active
  }

  /// Enqueue a payload without blocking.
  ///
  /// A full queue is treated as an unresponsive peer: the connection is closed and
  /// [`SendError::Full`] is returned so the caller can drop it from the hub.
  pub fn try_send(&self, payload: Arc<str>) -> Result<(), SendError> {
    let result = {
      let sender = lock(&self.sender);
      match sender.as_ref() {
        Some(tx) => tx.try_send(payload),
        None => return Err(SendError::Closed),
      }
    };

    match result {
      Ok(()) => Ok(()),
      Err(mpsc::error::TrySendError::Full(_)) => {
        tracing::warn!(conn_id = self.id, user_id = self.user_id(), "outbound queue full, closing connection");
        self.close();
        Err(SendError::Full)
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        self.close();
        Err(SendError::Closed)
      }
    }
  }

  /// Close the outbound queue and signal both loops to stop.
  ///
  /// Safe to call from any number of tasks; only the first call performs the
  /// transition and returns `true`.
  pub fn close(&self) -> bool {
    if self
      .state
      .compare_exchange(
        ConnectionState::Active as u8,
        ConnectionState::Closing as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_err()
    {
      return false;
    }

    // Dropping the only sender ends the write loop once it has drained.
    drop(lock(&self.sender).take());
    self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    self.closed_tx.send_replace(true);
    tracing::debug!(conn_id = self.id, user_id = self.user_id(), "connection closed");
    true
  }

  /// Resolves once the connection has been closed.
  pub async fn closed(&self) {
    let mut rx = self.closed_tx.subscribe();
    let _ = rx.wait_for(|closed| *closed).await;
  }

  /// Add channels to the relay filter. Returns the ones that were newly added.
  pub fn subscribe<'a>(&self, channels: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut subs = lock(&self.subscriptions);
    channels
      .into_iter()
      .filter(|c| subs.insert(c.to_string()))
      .map(str::to_string)
      .collect()
  }

  pub fn unsubscribe<'a>(&self, channels: impl IntoIterator<Item = &'a str>) {
    let mut subs = lock(&self.subscriptions);
    for channel in channels {
      subs.remove(channel);
    }
  }

  pub fn is_subscribed(&self, channel: &str) -> bool {
    lock(&self.subscriptions).contains(channel)
  }

  pub fn subscriptions(&self) -> Vec<String> {
    let mut subs: Vec<String> = lock(&self.subscriptions).iter().cloned().collect();
    subs.sort();
    subs
  }

  /// Marks the pub/sub relay as attached. Returns `true` only for the first caller.
  pub(crate) fn claim_relay(&self) -> bool {
    !self.relay_attached.swap(true, Ordering::AcqRel)
  }

  /// Lets a later subscribe attach the relay again after a failed attempt.
  pub(crate) fn release_relay(&self) {
    self.relay_attached.store(false, Ordering::Release);
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.id)
      .field("identity", &self.identity)
      .field("room", &self.room_id())
      .field("state", &self.state())
      .finish()
  }
}
