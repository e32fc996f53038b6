//! Background publishing of leaderboard events.
//!
//! Write paths hand events to a [`Publisher`] instead of publishing inline. The
//! publisher queues them on a bounded channel drained by one worker task, so the
//! caller never waits on the transport, a full queue is reported instead of
//! growing without bound, and queued events are still flushed on shutdown.

use crate::{
  bridge::{Board, Channel, LeaderboardEntry, LeaderboardSource},
  error::{PubSubError, PublishError},
  protocol::unix_timestamp,
  pubsub::{PubSubBackend, PubSubExt},
};
use serde::{Deserialize, Serialize};
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Span;

/// Something worth telling leaderboard subscribers about.
///
/// Ranks are 1-based; `0` means unranked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderboardEvent {
  ScoreUpdate {
    user_id: u64,
    username: String,
    new_score: i64,
    previous_score: i64,
    previous_rank: u32,
    new_rank: u32,
  },
  /// Republish the top `limit` entries of a board.
  Refresh { board: Board, limit: usize },
  PersonalBest {
    user_id: u64,
    username: String,
    new_score: i64,
  },
  RankChange {
    user_id: u64,
    username: String,
    old_rank: u32,
    new_rank: u32,
    score: i64,
  },
}

/// Message published on a leaderboard topic and relayed as `live_update` data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardUpdate<T> {
  #[serde(rename = "type")]
  pub kind: String,
  pub timestamp: i64,
  pub data: T,
}

impl<T> LeaderboardUpdate<T> {
  fn new(kind: &str, data: T) -> Self {
    Self {
      kind: kind.to_string(),
      timestamp: unix_timestamp(),
      data,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreChange {
  pub user_id: u64,
  pub username: String,
  pub new_score: i64,
  pub previous_rank: u32,
  pub new_rank: u32,
  pub score_change: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingChange {
  pub top_entries: Vec<LeaderboardEntry>,
  pub limit: usize,
  pub update_type: Board,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalBest {
  pub user_id: u64,
  pub username: String,
  pub new_score: i64,
  pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankDirection {
  New,
  Up,
  Down,
}

impl RankDirection {
  pub fn between(old_rank: u32, new_rank: u32) -> Self {
    if old_rank == 0 {
      RankDirection::New
    } else if new_rank < old_rank {
      RankDirection::Up
    } else {
      RankDirection::Down
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankMove {
  pub user_id: u64,
  pub username: String,
  pub old_rank: u32,
  pub new_rank: u32,
  pub score: i64,
  pub direction: RankDirection,
}

/// Cloneable submission handle for the publishing worker.
#[derive(Clone)]
pub struct Publisher {
  tx: mpsc::Sender<LeaderboardEvent>,
  failures: Arc<AtomicU64>,
}

/// The worker task. Finishes once every [`Publisher`] clone is dropped and the queue is drained.
pub struct PublisherTask(JoinHandle<()>);

impl PublisherTask {
  pub async fn join(self) {
    if let Err(e) = self.0.await {
      tracing::error!("leaderboard publisher task failed: {}", e);
    }
  }
}

impl Publisher {
  pub fn spawn(
    transport: Arc<dyn PubSubBackend>,
    source: Arc<dyn LeaderboardSource>,
    capacity: usize,
  ) -> (Self, PublisherTask) {
    Self::spawn_with_span(transport, source, capacity, tracing::info_span!("publisher"))
  }

  pub fn spawn_with_span(
    transport: Arc<dyn PubSubBackend>,
    source: Arc<dyn LeaderboardSource>,
    capacity: usize,
    span: Span,
  ) -> (Self, PublisherTask) {
    let (tx, mut rx) = mpsc::channel(capacity.max(1));
    let failures = Arc::new(AtomicU64::new(0));

    let worker_failures = failures.clone();
    let handle = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        if let Err(e) = publish_event(transport.as_ref(), source.as_ref(), &event, &span).await {
          worker_failures.fetch_add(1, Ordering::Relaxed);
          tracing::error!(parent: &span, ?event, "failed to publish leaderboard event: {}", e);
        }
      }
      tracing::debug!(parent: &span, "leaderboard publisher drained");
    });

    (Self { tx, failures }, PublisherTask(handle))
  }

  /// Queue an event without waiting.
  pub fn submit(&self, event: LeaderboardEvent) -> Result<(), PublishError> {
    self.tx.try_send(event).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => PublishError::QueueFull,
      mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
    })
  }

  /// Queue an event, waiting for room if the queue is full.
  pub async fn send(&self, event: LeaderboardEvent) -> Result<(), PublishError> {
    self.tx.send(event).await.map_err(|_| PublishError::Closed)
  }

  /// Events the worker failed to publish so far.
  pub fn failures(&self) -> u64 {
    self.failures.load(Ordering::Relaxed)
  }
}

/// Publish one event on its topic. Unchanged ranks publish nothing.
///
/// A refresh whose snapshot lookup fails is skipped and logged under `span`.
pub async fn publish_event(
  transport: &dyn PubSubBackend,
  source: &dyn LeaderboardSource,
  event: &LeaderboardEvent,
  span: &Span,
) -> Result<(), PubSubError> {
  match event {
    LeaderboardEvent::ScoreUpdate {
      user_id,
      username,
      new_score,
      previous_score,
      previous_rank,
      new_rank,
    } => {
      let data = ScoreChange {
        user_id: *user_id,
        username: username.clone(),
        new_score: *new_score,
        previous_rank: *previous_rank,
        new_rank: *new_rank,
        score_change: new_score.saturating_sub(*previous_score),
      };
      transport
        .publish(&Channel::Updates.topic(), &LeaderboardUpdate::new("score_update", data))
        .await
    }
    LeaderboardEvent::Refresh { board, limit } => {
      let top_entries = match source.snapshot(*board, *limit).await {
        Ok(entries) => entries,
        Err(e) => {
          tracing::warn!(parent: span, ?board, "skipping leaderboard refresh: {}", e);
          return Ok(());
        }
      };
      let data = RankingChange {
        top_entries,
        limit: *limit,
        update_type: *board,
      };
      transport
        .publish(&board.channel().topic(), &LeaderboardUpdate::new("leaderboard_update", data))
        .await
    }
    LeaderboardEvent::PersonalBest {
      user_id,
      username,
      new_score,
    } => {
      let data = PersonalBest {
        user_id: *user_id,
        username: username.clone(),
        new_score: *new_score,
        message: format!("{username} achieved a new personal best: {new_score} points!"),
      };
      transport
        .publish(&Channel::Achievements.topic(), &LeaderboardUpdate::new("personal_best", data))
        .await
    }
    LeaderboardEvent::RankChange {
      user_id,
      username,
      old_rank,
      new_rank,
      score,
    } => {
      if old_rank == new_rank {
        return Ok(());
      }
      let data = RankMove {
        user_id: *user_id,
        username: username.clone(),
        old_rank: *old_rank,
        new_rank: *new_rank,
        score: *score,
        direction: RankDirection::between(*old_rank, *new_rank),
      };
      transport
        .publish(&Channel::RankChanges.topic(), &LeaderboardUpdate::new("rank_change", data))
        .await
    }
  }
}
