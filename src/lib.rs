//! Real-time presence and fan-out for multiplayer scoring backends.
//!
//! - [`hub`]: room membership and broadcast.
//! - [`client`]: the per-connection read and write loops.
//! - [`rate_limit`]: sliding-window limiter with in-memory and Redis stores.
//! - [`bridge`]: relays leaderboard topics from [`pubsub`] to subscribed sockets.
//! - [`server`]: axum routes tying it together.

pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod publisher;
pub mod pubsub;
pub mod rate_limit;
pub mod server;

pub use auth::{IdentityProvider, JwtIdentity};
pub use bridge::{Bridge, Channel, LeaderboardSource};
pub use config::{ConnectionSettings, Settings};
pub use connection::{Connection, Identity};
pub use hub::Hub;
pub use publisher::{LeaderboardEvent, Publisher};
pub use rate_limit::{RateLimiter, RateRule};
pub use server::Server;

use dotenv::dotenv;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Load `.env`, install tracing, and serve with settings from the environment.
pub async fn run() -> anyhow::Result<()> {
  dotenv().ok();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
          "{}=debug,tower_http=debug,axum::rejection=trace",
          env!("CARGO_CRATE_NAME")
        )
        .into()
      }),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let settings = Settings::from_env()?;
  let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

  server_from_settings(&settings)?.listen(addr).await
}

fn server_from_settings(settings: &Settings) -> anyhow::Result<Server> {
  #[allow(unused_mut)]
  let mut server = Server::new(JwtIdentity::new(&settings.jwt_secret))
    .with_settings(settings.connection.clone())
    .with_snapshot_limit(settings.snapshot_limit)
    .with_fail_mode(settings.rate_limit_fail_mode);

  match settings.redis_url.as_deref() {
    #[cfg(feature = "redis-backend")]
    Some(url) => {
      tracing::info!("using redis at {} for pub/sub and rate limiting", url);
      server = server
        .with_pubsub(std::sync::Arc::new(pubsub::RedisPubSub::new(url)?))
        .with_rate_limiter(RateLimiter::new(rate_limit::RedisCounterStore::new(url)?));
    }
    #[cfg(not(feature = "redis-backend"))]
    Some(_) => {
      tracing::warn!("REDIS_URL is set but the redis-backend feature is disabled; staying in-process");
    }
    None => {
      tracing::info!("no REDIS_URL, using in-process pub/sub and rate limiting");
    }
  }

  Ok(server)
}
