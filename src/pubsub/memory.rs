//! In-memory Pub/Sub implementation using Tokio broadcast channels.

use super::{MessageHandler, PubSubBackend, Subscription};
use crate::error::PubSubError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::{
  collections::HashMap,
  sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

/// In-memory Pub/Sub using a Tokio `broadcast` channel per topic.
///
/// Single-process only. Each topic has a fixed-size ring buffer; a subscriber that
/// falls more than `buffer` messages behind skips the overwritten ones.
#[derive(Clone)]
pub struct InMemoryPubSub {
  topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
  buffer: usize,
}

impl InMemoryPubSub {
  /// Create a new in-memory backend with a default per-topic buffer of 64 messages.
  pub fn new() -> Self {
    Self::with_buffer(64)
  }

  /// Create with a custom per-topic buffer. Minimum size is 1.
  pub fn with_buffer(buffer: usize) -> Self {
    Self {
      topics: Arc::new(Mutex::new(HashMap::new())),
      buffer: buffer.max(1),
    }
  }

  fn get_or_create_sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
    let mut map = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
    map
      .entry(topic.to_string())
      .or_insert_with(|| broadcast::channel(self.buffer).0)
      .clone()
  }

  /// Number of live subscriptions listening on `topic`.
  pub fn subscriber_count(&self, topic: &str) -> usize {
    let map = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
    map.get(topic).map_or(0, |tx| tx.receiver_count())
  }
}

impl Default for InMemoryPubSub {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl PubSubBackend for InMemoryPubSub {
  async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
    // No receivers is not a failure: the message is simply dropped.
    let _ = self.get_or_create_sender(topic).send(payload);
    Ok(())
  }

  async fn subscribe_bytes(
    &self,
    topics: &[String],
    handler: MessageHandler,
  ) -> Result<Subscription, PubSubError> {
    if topics.is_empty() {
      return Err(PubSubError::NoTopics);
    }

    // Receivers are created before returning so nothing published afterwards is missed.
    let streams: Vec<_> = topics
      .iter()
      .map(|topic| {
        let topic = topic.clone();
        BroadcastStream::new(self.get_or_create_sender(&topic).subscribe()).map(move |res| (topic.clone(), res))
      })
      .collect();
    let mut merged = stream::select_all(streams);

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
      loop {
        tokio::select! {
          next = merged.next() => {
            match next {
              Some((topic, Ok(msg))) => handler(topic, msg).await,
              Some((topic, Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                tracing::warn!(topic = %topic, skipped, "in-memory subscriber lagged");
              }
              None => break,
            }
          }
          _ = &mut stop_rx => break,
        }
      }
    });

    Ok(Subscription::new(handle, stop_tx))
  }
}
