//! Runtime settings read from the environment (and `.env` via `dotenv`).

use crate::{bridge::DEFAULT_SNAPSHOT_LIMIT, rate_limit::http::FailMode};
use anyhow::{bail, Context, Result};
use std::{env, str::FromStr, time::Duration};

/// Per-connection limits and liveness timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
  /// Outbound queue capacity in messages.
  pub queue_capacity: usize,
  /// Largest inbound frame accepted, in bytes.
  pub max_message_size: usize,
  /// Read deadline, refreshed by every pong.
  pub pong_wait: Duration,
  /// Heartbeat interval. Must be shorter than `pong_wait`.
  pub ping_period: Duration,
  /// Deadline for a single socket write.
  pub write_wait: Duration,
}

impl Default for ConnectionSettings {
  fn default() -> Self {
    let pong_wait = Duration::from_secs(60);
    Self {
      queue_capacity: 256,
      max_message_size: 512,
      pong_wait,
      ping_period: pong_wait * 9 / 10,
      write_wait: Duration::from_secs(10),
    }
  }
}

impl ConnectionSettings {
  pub fn validate(&self) -> Result<()> {
    if self.queue_capacity == 0 {
      bail!("queue capacity must be at least 1");
    }
    if self.max_message_size == 0 {
      bail!("max message size must be at least 1 byte");
    }
    if self.ping_period.is_zero() || self.ping_period >= self.pong_wait {
      bail!(
        "ping period ({:?}) must be non-zero and shorter than pong wait ({:?})",
        self.ping_period,
        self.pong_wait
      );
    }
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct Settings {
  pub port: u16,
  pub redis_url: Option<String>,
  pub jwt_secret: String,
  pub connection: ConnectionSettings,
  pub snapshot_limit: usize,
  /// Bound on queued leaderboard events for a [`crate::publisher::Publisher`].
  pub publish_queue_capacity: usize,
  pub rate_limit_fail_mode: FailMode,
}

impl Settings {
  /// Read settings from process environment variables.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|name| env::var(name).ok())
  }

  /// Read settings through an arbitrary variable lookup.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let defaults = ConnectionSettings::default();

    let connection = ConnectionSettings {
      queue_capacity: parse_or(&lookup, "WS_QUEUE_CAPACITY", defaults.queue_capacity)?,
      max_message_size: parse_or(&lookup, "WS_MAX_MESSAGE_SIZE", defaults.max_message_size)?,
      pong_wait: Duration::from_secs(parse_or(&lookup, "WS_PONG_WAIT_SECS", defaults.pong_wait.as_secs())?),
      ping_period: Duration::from_secs(parse_or(
        &lookup,
        "WS_PING_PERIOD_SECS",
        defaults.ping_period.as_secs(),
      )?),
      write_wait: Duration::from_secs(parse_or(&lookup, "WS_WRITE_WAIT_SECS", defaults.write_wait.as_secs())?),
    };
    connection.validate().context("invalid websocket settings")?;

    let jwt_secret = lookup("JWT_SECRET")
      .filter(|s| !s.is_empty())
      .context("JWT_SECRET must be set")?;

    let fail_open: bool = parse_or(&lookup, "RATE_LIMIT_FAIL_OPEN", true)?;

    Ok(Self {
      port: parse_or(&lookup, "PORT", 3000)?,
      redis_url: lookup("REDIS_URL").filter(|s| !s.is_empty()),
      jwt_secret,
      connection,
      snapshot_limit: parse_or(&lookup, "LEADERBOARD_SNAPSHOT_LIMIT", DEFAULT_SNAPSHOT_LIMIT)?,
      publish_queue_capacity: parse_or(&lookup, "PUBLISH_QUEUE_CAPACITY", 1024)?,
      rate_limit_fail_mode: if fail_open { FailMode::Open } else { FailMode::Closed },
    })
  }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match lookup(name) {
    Some(raw) if !raw.trim().is_empty() => raw
      .trim()
      .parse()
      .with_context(|| format!("invalid value for {name}: {raw:?}")),
    _ => Ok(default),
  }
}
