//! Process-local counter store.

use super::{window_start, Admission, CounterStore};
use crate::error::RateLimitError;
use async_trait::async_trait;
use std::{
  collections::{HashMap, VecDeque},
  sync::atomic::{AtomicU64, Ordering},
  time::Duration,
};
use tokio::sync::Mutex;

/// Every this many admissions the whole map is swept for expired keys.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Default)]
struct EventWindow {
  events: VecDeque<u64>,
  expires_at: u64,
}

impl EventWindow {
  fn prune(&mut self, now_ms: u64, window: Duration) {
    if self.expires_at <= now_ms {
      self.events.clear();
    }
    let start = window_start(now_ms, window);
    self.events.retain(|&t| t > start);
  }
}

/// In-memory [`CounterStore`]. A single mutex makes every admission atomic.
///
/// Keys expire `window` after their last admission attempt and are swept lazily.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
  windows: Mutex<HashMap<String, EventWindow>>,
  ops: AtomicU64,
}

impl MemoryCounterStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Drop every key whose time-to-live has passed.
  pub async fn purge_expired(&self, now_ms: u64) {
    self.windows.lock().await.retain(|_, w| w.expires_at > now_ms);
  }

  /// Number of keys currently held, expired or not.
  pub async fn key_count(&self) -> usize {
    self.windows.lock().await.len()
  }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
  async fn admit(
    &self,
    key: &str,
    _member: &str,
    now_ms: u64,
    window: Duration,
    limit: u32,
  ) -> Result<Admission, RateLimitError> {
    let mut windows = self.windows.lock().await;
    if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
      windows.retain(|_, w| w.expires_at > now_ms);
    }

    let entry = windows.entry(key.to_string()).or_default();
    entry.prune(now_ms, window);
    let count = entry.events.len() as u64;

    entry.events.push_back(now_ms);
    entry.expires_at = now_ms.saturating_add(u64::try_from(window.as_millis()).unwrap_or(u64::MAX));

    let allowed = count < u64::from(limit);
    if !allowed {
      entry.events.pop_back();
    }
    Ok(Admission { allowed, count })
  }

  async fn count(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64, RateLimitError> {
    let mut windows = self.windows.lock().await;
    let Some(entry) = windows.get_mut(key) else {
      return Ok(0);
    };
    if entry.expires_at <= now_ms {
      windows.remove(key);
      return Ok(0);
    }
    entry.prune(now_ms, window);
    Ok(entry.events.len() as u64)
  }
}
