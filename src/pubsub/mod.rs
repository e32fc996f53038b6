//! Topic-based publish/subscribe transport with in-memory and Redis backends.
//!
//! [`PubSubBackend`] is the seam between the fan-out layer and whatever carries
//! messages between processes. [`InMemoryPubSub`] serves single-process deployments
//! and tests; [`RedisPubSub`] (feature `redis-backend`) spans machines.
//!
//! A subscription covers one or more topics and hands every delivery to its handler
//! together with the topic it arrived on. Delivery is best-effort: messages published
//! while nobody is subscribed are dropped.
//!
//! ## Example Usage
//! ```no_run
//! use scorecast::pubsub::{InMemoryPubSub, PubSubExt};
//!
//! #[tokio::main]
//! async fn main() {
//!   let backend = InMemoryPubSub::new();
//!
//!   let sub = backend
//!     .subscribe(&["leaderboard:daily".to_string()], |topic, bytes| async move {
//!       println!("{topic}: {} bytes", bytes.len());
//!     })
//!     .await
//!     .unwrap();
//!
//!   backend.publish("leaderboard:daily", &serde_json::json!({"rank": 1})).await.unwrap();
//!   sub.stop().await;
//! }
//! ```

use crate::error::PubSubError;
use async_trait::async_trait;
use serde::Serialize;
use std::{future::Future, pin::Pin};
use tokio::{sync::oneshot, task::JoinHandle};

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::InMemoryPubSub;
#[cfg(feature = "redis-backend")]
pub use redis::{BackoffConfig, RedisPubSub};

/// Boxed per-message callback: `(topic, payload)`.
pub type MessageHandler =
  Box<dyn Fn(String, Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A handle to a running subscription task.
///
/// `stop()` unsubscribes and waits for the task to exit. Dropping the handle also
/// signals the task to stop, so a subscription never outlives its owner.
pub struct Subscription {
  handle: Option<JoinHandle<()>>,
  stop_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
  pub(crate) fn new(handle: JoinHandle<()>, stop_tx: oneshot::Sender<()>) -> Self {
    Self {
      handle: Some(handle),
      stop_tx: Some(stop_tx),
    }
  }

  /// Request a graceful stop. Waits until the underlying task exits.
  pub async fn stop(mut self) {
    if let Some(tx) = self.stop_tx.take() {
      let _ = tx.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }

  /// Abort immediately without unsubscribing.
  pub fn abort(mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }

  pub fn is_active(&self) -> bool {
    self.handle.as_ref().is_some_and(|h| !h.is_finished())
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(tx) = self.stop_tx.take() {
      let _ = tx.send(());
    }
  }
}

/// Trait implemented by all Pub/Sub backends.
///
/// Payloads are opaque bytes; encoding is the caller's concern (see [`PubSubExt`]).
#[async_trait]
pub trait PubSubBackend: Send + Sync {
  /// Publish raw bytes to `topic`.
  ///
  /// `Ok(())` means the backend accepted the message, not that anyone received it.
  async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError>;

  /// Subscribe to every topic in `topics` and invoke `handler` for each delivery.
  ///
  /// The handler runs on the subscription's task, one message at a time; it should
  /// be lightweight or spawn its own work. Returns [`PubSubError::NoTopics`] for an
  /// empty topic list.
  async fn subscribe_bytes(
    &self,
    topics: &[String],
    handler: MessageHandler,
  ) -> Result<Subscription, PubSubError>;
}

/// Extension trait providing convenient generic methods for PubSubBackend.
#[async_trait]
pub trait PubSubExt: PubSubBackend {
  /// Publish a serializable message to `topic` as JSON.
  async fn publish<T: Serialize + Send + Sync>(&self, topic: &str, msg: &T) -> Result<(), PubSubError> {
    let payload = serde_json::to_vec(msg)?;
    self.publish_bytes(topic, payload).await
  }

  /// Subscribe with any async closure taking `(topic, payload)`.
  async fn subscribe<F, Fut>(&self, topics: &[String], handler: F) -> Result<Subscription, PubSubError>
  where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self
      .subscribe_bytes(topics, Box::new(move |topic, bytes| Box::pin(handler(topic, bytes))))
      .await
  }
}

// Blanket implementation
impl<T: PubSubBackend + ?Sized> PubSubExt for T {}
