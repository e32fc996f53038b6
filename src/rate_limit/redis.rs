//! Redis-backed counter store shared by every instance of the service.

use super::{window_start, Admission, CounterStore};
use crate::error::RateLimitError;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Prune, count, record and roll back in one server-side step.
///
/// KEYS[1] = counter key
/// ARGV = now_ms, window_start_ms, limit, member, window_ms
const ADMIT_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
local count = redis.call('ZCARD', KEYS[1])
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
if count >= tonumber(ARGV[3]) then
  redis.call('ZREM', KEYS[1], ARGV[4])
  return {0, count}
end
return {1, count}
"#;

/// Sorted-set sliding window: one member per admitted event, scored by its timestamp.
pub struct RedisCounterStore {
  client: Client,
  conn: OnceCell<ConnectionManager>,
  script: Script,
}

impl RedisCounterStore {
  /// Example: `RedisCounterStore::new("redis://127.0.0.1/")?`
  pub fn new(addr: &str) -> Result<Self, RateLimitError> {
    Ok(Self {
      client: Client::open(addr)?,
      conn: OnceCell::new(),
      script: Script::new(ADMIT_SCRIPT),
    })
  }

  async fn connection(&self) -> Result<ConnectionManager, RateLimitError> {
    let conn = self
      .conn
      .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
      .await?;
    Ok(conn.clone())
  }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
  async fn admit(
    &self,
    key: &str,
    member: &str,
    now_ms: u64,
    window: Duration,
    limit: u32,
  ) -> Result<Admission, RateLimitError> {
    let mut conn = self.connection().await?;
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);

    let (allowed, count): (i64, u64) = self
      .script
      .key(key)
      .arg(now_ms)
      .arg(window_start(now_ms, window))
      .arg(limit)
      .arg(member)
      .arg(window_ms)
      .invoke_async(&mut conn)
      .await?;

    Ok(Admission {
      allowed: allowed == 1,
      count,
    })
  }

  async fn count(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64, RateLimitError> {
    let mut conn = self.connection().await?;
    let (count,): (u64,) = redis::pipe()
      .atomic()
      .zrembyscore(key, "-inf", window_start(now_ms, window))
      .ignore()
      .zcard(key)
      .query_async(&mut conn)
      .await?;
    Ok(count)
  }
}
