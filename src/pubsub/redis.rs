//! Redis Pub/Sub implementation with automatic reconnection.

use super::{MessageHandler, PubSubBackend, Subscription};
use crate::error::PubSubError;
use async_trait::async_trait;
use redis::Client;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;

const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 5_000;
const MAX_EXPONENT: u32 = 6;
const JITTER_RANGE: u64 = 50;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub max_exponent: u32,
  pub jitter_range: u64,
  pub max_retries: u32,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: BASE_DELAY_MS,
      max_delay_ms: MAX_DELAY_MS,
      max_exponent: MAX_EXPONENT,
      jitter_range: JITTER_RANGE,
      max_retries: 10,
    }
  }
}

/// Redis-backed Pub/Sub for inter-process messaging.
///
/// Uses a dedicated connection for publishing and a `PUBSUB` subscription for receiving.
/// Automatically attempts to reconnect with exponential backoff on connection loss.
#[derive(Clone)]
pub struct RedisPubSub {
  client: Client,
  backoff_config: BackoffConfig,
}

impl RedisPubSub {
  /// Create a new Redis backend from a connection string.
  ///
  /// Example: `RedisPubSub::new("redis://127.0.0.1/")?`
  pub fn new(addr: &str) -> Result<Self, PubSubError> {
    Ok(Self {
      client: Client::open(addr)?,
      backoff_config: BackoffConfig::default(),
    })
  }

  /// Create a new Redis backend from a connection string and configuration.
  ///
  /// Example: `RedisPubSub::with_config("redis://127.0.0.1/", BackoffConfig::default())?`
  pub fn with_config(addr: &str, config: BackoffConfig) -> Result<Self, PubSubError> {
    Ok(Self {
      client: Client::open(addr)?,
      backoff_config: config,
    })
  }
}

impl BackoffConfig {
  /// Delay before reconnect attempt number `attempt` (1-based).
  pub fn delay(&self, attempt: u32) -> Duration {
    let exp = attempt.min(self.max_exponent);
    let base_ms = self.base_delay_ms.saturating_mul(2u64.saturating_pow(exp));
    let jitter_ms = (u64::from(attempt) % self.jitter_range.max(1)) + 1;
    Duration::from_millis(base_ms.saturating_add(jitter_ms).min(self.max_delay_ms))
  }
}

#[async_trait]
impl PubSubBackend for RedisPubSub {
  async fn publish_bytes(&self, topic: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
    let mut conn = self.client.get_multiplexed_tokio_connection().await?;
    redis::AsyncCommands::publish::<&str, Vec<u8>, ()>(&mut conn, topic, payload).await?;
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

    let client = self.client.clone();
    let topics = topics.to_vec();
    let cfg = self.backoff_config.clone();
    let label = topics.join(",");

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
      let mut attempt: u32 = 0;

      loop {
        if stop_rx.try_recv().is_ok() {
          tracing::debug!(topics = %label, "redis subscription stopped");
          break;
        }

        match client.get_async_pubsub().await {
          Ok(mut pubsub) => match pubsub.subscribe(&topics).await {
            Ok(()) => {
              attempt = 0;
              tracing::info!(topics = %label, "subscribed to redis topics");
              let mut stream = pubsub.on_message();
              let should_stop = loop {
                tokio::select! {
                  msg = stream.next() => match msg {
                    Some(msg) => {
                      let topic = msg.get_channel_name().to_string();
                      match msg.get_payload::<Vec<u8>>() {
                        Ok(payload) => handler(topic, payload).await,
                        Err(e) => tracing::error!(topic = %topic, "redis payload decode error: {}", e),
                      }
                    }
                    None => {
                      tracing::warn!(topics = %label, "redis pubsub stream ended, reconnecting");
                      break false;
                    }
                  },
                  _ = &mut stop_rx => break true,
                }
              };

              // Release the stream's borrow before unsubscribing.
              drop(stream);

              if should_stop {
                let _ = pubsub.unsubscribe(&topics).await;
                return;
              }
            }
            Err(e) => {
              tracing::error!(topics = %label, "redis subscribe failed: {}", e);
              attempt += 1;
            }
          },
          Err(e) => {
            tracing::error!("redis pubsub connection error: {}. Retrying", e);
            attempt += 1;
          }
        }

        if attempt >= cfg.max_retries {
          tracing::error!(topics = %label, retries = cfg.max_retries, "redis pubsub giving up");
          break;
        }

        tokio::select! {
          _ = tokio::time::sleep(cfg.delay(attempt)) => {}
          _ = &mut stop_rx => break,
        }
      }
    });

    Ok(Subscription::new(handle, stop_tx))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pubsub::PubSubExt;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
  struct TestMsg {
    val: String,
  }

  #[test]
  fn backoff_grows_and_caps() {
    let cfg = BackoffConfig::default();
    assert!(cfg.delay(1) < cfg.delay(3));
    assert_eq!(cfg.delay(40), Duration::from_millis(MAX_DELAY_MS));
  }

  // This test requires a running Redis instance at localhost:6379
  // Run: `docker run -p 6379:6379 redis`
  #[tokio::test]
  #[ignore]
  async fn redis_pubsub_works() {
    let backend = RedisPubSub::new("redis://127.0.0.1/").unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);

    let _sub = backend
      .subscribe(&["topic".to_string(), "other".to_string()], move |topic, data| {
        let tx = tx.clone();
        async move {
          let msg: TestMsg = serde_json::from_slice(&data).unwrap();
          tx.send((topic, msg)).await.ok();
        }
      })
      .await
      .unwrap();

    // Give the subscriber time to reach the server.
    tokio::time::sleep(Duration::from_millis(200)).await;
    backend.publish("other", &TestMsg { val: "hello".into() }).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(received, ("other".to_string(), TestMsg { val: "hello".into() }));
  }
}
