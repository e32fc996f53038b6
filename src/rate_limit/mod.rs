//! Sliding-window rate limiting for request-issuing clients.
//!
//! Each `(rule, identifier)` pair maps to a key in a shared [`CounterStore`] holding
//! the timestamps of admitted events. An admission check prunes events older than
//! `now - window`, counts the rest, records the current event and rolls it back if
//! the limit had already been reached. The store runs that sequence atomically, so
//! the limiter itself holds no locks and any number of processes can share one store.
//!
//! Store failures are returned as [`RateLimitError`], never folded into a verdict;
//! the caller decides whether an unreachable store means fail-open or fail-closed.

use crate::error::RateLimitError;
use async_trait::async_trait;
use std::{
  borrow::Cow,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::Span;

pub mod http;
mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::MemoryCounterStore;
#[cfg(feature = "redis-backend")]
pub use redis::RedisCounterStore;

/// A named admission rule: at most `limit` events per trailing `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRule {
  pub namespace: Cow<'static, str>,
  pub limit: u32,
  pub window: Duration,
}

impl RateRule {
  pub const fn new(namespace: &'static str, limit: u32, window: Duration) -> Self {
    Self {
      namespace: Cow::Borrowed(namespace),
      limit,
      window,
    }
  }

  /// Rule with a namespace built at runtime.
  pub fn custom(namespace: impl Into<String>, limit: u32, window: Duration) -> Self {
    Self {
      namespace: Cow::Owned(namespace.into()),
      limit,
      window,
    }
  }

  /// Login attempts: 5 per minute per caller.
  pub const fn login() -> Self {
    Self::new("login", 5, Duration::from_secs(60))
  }

  /// Account registration: 3 per hour per caller.
  pub const fn register() -> Self {
    Self::new("register", 3, Duration::from_secs(3600))
  }

  /// Score submission: 10 per minute per authenticated user.
  pub const fn score_submit() -> Self {
    Self::new("score", 10, Duration::from_secs(60))
  }

  /// Generic API traffic: 100 per minute per caller.
  pub const fn api() -> Self {
    Self::new("api", 100, Duration::from_secs(60))
  }

  /// Third-party identity logins: 10 per minute per caller.
  pub const fn sso() -> Self {
    Self::new("sso", 10, Duration::from_secs(60))
  }

  /// Store key for `identifier` under this rule.
  pub fn key(&self, identifier: &str) -> String {
    format!("rate_limit:{}:{}", self.namespace, identifier)
  }

  pub fn window_millis(&self) -> u64 {
    u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
  }
}

/// Identifier used by user-scoped rules.
pub fn user_identifier(user_id: u64) -> String {
  format!("user_{user_id}")
}

/// Source of wall-clock time in milliseconds since the UNIX epoch.
pub trait Clock: Send + Sync {
  fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_millis(&self) -> u64 {
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
      .unwrap_or(0)
  }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicU64,
}

impl ManualClock {
  pub fn new(start_millis: u64) -> Self {
    Self {
      now: AtomicU64::new(start_millis),
    }
  }

  pub fn advance(&self, by: Duration) {
    let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
    self.now.fetch_add(by, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_millis(&self) -> u64 {
    self.now.load(Ordering::SeqCst)
  }
}

/// Result of one atomic admission attempt against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
  pub allowed: bool,
  /// Live events in the window before this attempt was recorded.
  pub count: u64,
}

/// Shared store of per-key event timestamps.
///
/// Implementations must run [`CounterStore::admit`] as one atomic unit per key:
/// no other caller's events may interleave between the count and the insert.
#[async_trait]
pub trait CounterStore: Send + Sync {
  /// Prune events at or before `now_ms - window`, count the rest, record `member`
  /// at `now_ms`, and remove it again if the count had already reached `limit`.
  /// Refreshes the key's time-to-live to `window`.
  async fn admit(
    &self,
    key: &str,
    member: &str,
    now_ms: u64,
    window: Duration,
    limit: u32,
  ) -> Result<Admission, RateLimitError>;

  /// Prune expired events and return how many remain. Records nothing.
  async fn count(&self, key: &str, now_ms: u64, window: Duration) -> Result<u64, RateLimitError>;
}

/// Verdict plus the quota figures surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
  pub allowed: bool,
  pub limit: u32,
  pub remaining: u32,
  pub window: Duration,
  /// Epoch seconds at which a full window will have elapsed.
  pub reset_at: i64,
}

fn window_start(now_ms: u64, window: Duration) -> u64 {
  now_ms.saturating_sub(u64::try_from(window.as_millis()).unwrap_or(u64::MAX))
}

static NEXT_EVENT: AtomicU64 = AtomicU64::new(0);

fn event_member(now_ms: u64) -> String {
  format!(
    "{}-{}-{}",
    now_ms,
    std::process::id(),
    NEXT_EVENT.fetch_add(1, Ordering::Relaxed)
  )
}

/// Sliding-window limiter over a shared [`CounterStore`].
#[derive(Clone)]
pub struct RateLimiter {
  store: Arc<dyn CounterStore>,
  clock: Arc<dyn Clock>,
  span: Span,
}

impl RateLimiter {
  pub fn new(store: impl CounterStore + 'static) -> Self {
    Self {
      store: Arc::new(store),
      clock: Arc::new(SystemClock),
      span: tracing::info_span!("rate_limiter"),
    }
  }

  /// Limiter over a process-local store. Only meaningful for a single instance.
  pub fn in_memory() -> Self {
    Self::new(MemoryCounterStore::new())
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_span(mut self, span: Span) -> Self {
    self.span = span;
    self
  }

  /// Admit or reject one request for `identifier` under `rule`.
  pub async fn check(&self, identifier: &str, rule: &RateRule) -> Result<RateDecision, RateLimitError> {
    let key = rule.key(identifier);
    let now_ms = self.clock.now_millis();
    let member = event_member(now_ms);

    let admission = self
      .store
      .admit(&key, &member, now_ms, rule.window, rule.limit)
      .await
      .map_err(|e| {
        tracing::error!(parent: &self.span, key = %key, "rate limiter store failed: {}", e);
        e
      })?;

    let used = if admission.allowed {
      admission.count.saturating_add(1)
    } else {
      admission.count
    };
    let remaining = u64::from(rule.limit).saturating_sub(used);

    if admission.allowed {
      tracing::debug!(
        parent: &self.span,
        key = %key,
        count = admission.count,
        limit = rule.limit,
        "rate limit check passed"
      );
    } else {
      tracing::warn!(
        parent: &self.span,
        identifier,
        key = %key,
        count = admission.count,
        limit = rule.limit,
        "rate limit exceeded"
      );
    }

    let reset_ms = now_ms.saturating_add(rule.window_millis());
    Ok(RateDecision {
      allowed: admission.allowed,
      limit: rule.limit,
      remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
      window: rule.window,
      reset_at: i64::try_from(reset_ms / 1000).unwrap_or(i64::MAX),
    })
  }

  /// `true` if the request is admitted. The event is recorded only when admitted.
  pub async fn is_allowed(&self, identifier: &str, rule: &RateRule) -> Result<bool, RateLimitError> {
    Ok(self.check(identifier, rule).await?.allowed)
  }

  /// Advisory quota left for `identifier`, never negative. Records nothing.
  pub async fn remaining(&self, identifier: &str, rule: &RateRule) -> Result<u32, RateLimitError> {
    let key = rule.key(identifier);
    let count = self
      .store
      .count(&key, self.clock.now_millis(), rule.window)
      .await?;
    let remaining = u64::from(rule.limit).saturating_sub(count);
    Ok(u32::try_from(remaining).unwrap_or(u32::MAX))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn limiter() -> (RateLimiter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let limiter = RateLimiter::in_memory().with_clock(clock.clone());
    (limiter, clock)
  }

  struct DownStore;

  #[async_trait]
  impl CounterStore for DownStore {
    async fn admit(&self, _: &str, _: &str, _: u64, _: Duration, _: u32) -> Result<Admission, RateLimitError> {
      Err(RateLimitError::Unavailable("connection refused".into()))
    }

    async fn count(&self, _: &str, _: u64, _: Duration) -> Result<u64, RateLimitError> {
      Err(RateLimitError::Unavailable("connection refused".into()))
    }
  }

  #[tokio::test]
  async fn sixth_call_in_window_is_rejected_until_window_passes() {
    let (limiter, clock) = limiter();
    let rule = RateRule::new("test", 5, Duration::from_secs(60));

    for _ in 0..5 {
      assert!(limiter.is_allowed("player", &rule).await.unwrap());
      clock.advance(Duration::from_secs(1));
    }
    assert!(!limiter.is_allowed("player", &rule).await.unwrap());

    // 61s after the first call: the first event has slid out of the window.
    clock.advance(Duration::from_secs(56));
    assert!(limiter.is_allowed("player", &rule).await.unwrap());
  }

  #[tokio::test]
  async fn remaining_counts_admitted_calls_only() {
    let (limiter, _clock) = limiter();
    let rule = RateRule::new("test", 5, Duration::from_secs(60));

    assert_eq!(limiter.remaining("p", &rule).await.unwrap(), 5);
    for k in 1..=3 {
      limiter.is_allowed("p", &rule).await.unwrap();
      assert_eq!(limiter.remaining("p", &rule).await.unwrap(), 5 - k);
    }

    for _ in 0..10 {
      limiter.is_allowed("p", &rule).await.unwrap();
    }
    assert_eq!(limiter.remaining("p", &rule).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn decision_reports_quota() {
    let (limiter, clock) = limiter();
    let rule = RateRule::new("test", 2, Duration::from_secs(60));

    let first = limiter.check("p", &rule).await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.remaining, 1);
    assert_eq!(first.limit, 2);
    assert_eq!(first.reset_at, (clock.now_millis() + 60_000) as i64 / 1000);

    let second = limiter.check("p", &rule).await.unwrap();
    assert_eq!(second.remaining, 0);
    let third = limiter.check("p", &rule).await.unwrap();
    assert!(!third.allowed);
    assert_eq!(third.remaining, 0);
  }

  #[tokio::test]
  async fn rules_and_identifiers_are_isolated() {
    let (limiter, _clock) = limiter();
    let login = RateRule::login();
    let score = RateRule::score_submit();

    for _ in 0..5 {
      assert!(limiter.is_allowed("1.2.3.4", &login).await.unwrap());
    }
    assert!(!limiter.is_allowed("1.2.3.4", &login).await.unwrap());
    assert!(limiter.is_allowed("5.6.7.8", &login).await.unwrap());
    assert!(limiter.is_allowed("1.2.3.4", &score).await.unwrap());
  }

  #[tokio::test]
  async fn concurrent_callers_never_exceed_limit() {
    let (limiter, _clock) = limiter();
    let rule = RateRule::new("test", 10, Duration::from_secs(60));

    let mut handles = Vec::new();
    for _ in 0..50 {
      let limiter = limiter.clone();
      let rule = rule.clone();
      handles.push(tokio::spawn(async move { limiter.is_allowed("shared", &rule).await.unwrap() }));
    }
    let mut admitted = 0;
    for handle in handles {
      if handle.await.unwrap() {
        admitted += 1;
      }
    }
    assert_eq!(admitted, 10);
  }

  #[tokio::test]
  async fn store_failure_is_an_error_not_a_verdict() {
    let limiter = RateLimiter::new(DownStore);
    let rule = RateRule::api();
    assert!(matches!(
      limiter.is_allowed("p", &rule).await,
      Err(RateLimitError::Unavailable(_))
    ));
    assert!(limiter.remaining("p", &rule).await.is_err());
  }

  #[test]
  fn keys_are_namespaced() {
    assert_eq!(RateRule::score_submit().key("user_7"), "rate_limit:score:user_7");
    assert_eq!(RateRule::custom("uploads", 1, Duration::from_secs(1)).key("x"), "rate_limit:uploads:x");
    assert_eq!(user_identifier(42), "user_42");
  }
}
