#[cfg(feature = "redis-backend")]
use redis::RedisError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[cfg(feature = "redis-backend")]
  #[error("Backend error: {0}")]
  Backend(#[from] RedisError),

  #[error("Subscription requested with no topics")]
  NoTopics,

  #[error("Transport unavailable: {0}")]
  Unavailable(String),
}

/// Failure of the shared counter store behind the rate limiter.
///
/// Kept apart from a "not allowed" verdict so callers can choose to fail open or closed.
#[derive(Debug, Error)]
pub enum RateLimitError {
  #[error("Counter store unavailable: {0}")]
  Unavailable(String),

  #[cfg(feature = "redis-backend")]
  #[error("Counter store error: {0}")]
  Backend(#[from] RedisError),
}

/// Malformed or unusable inbound frame. Never fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("Malformed envelope: {0}")]
  Malformed(#[from] serde_json::Error),

  #[error("Invalid '{kind}' payload: {source}")]
  Payload {
    kind: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Outcome of a non-blocking enqueue onto a connection's outbound queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
  #[error("Outbound queue full")]
  Full,

  #[error("Connection closed")]
  Closed,
}

#[derive(Debug, Error)]
pub enum LeaderboardError {
  #[error("Leaderboard lookup failed: {0}")]
  Lookup(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
  #[error("Publish queue full")]
  QueueFull,

  #[error("Publisher shut down")]
  Closed,
}
