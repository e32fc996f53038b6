//! Request gating for the HTTP surface.
//!
//! Use with `axum::middleware::from_fn_with_state(gate, enforce)`.

use super::{RateDecision, RateLimiter, RateRule};
use axum::{
  extract::{ConnectInfo, Request, State},
  http::{HeaderMap, HeaderValue, StatusCode},
  middleware::Next,
  response::{IntoResponse, Response},
  Json,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// What to do with a request when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
  /// Let the request through.
  #[default]
  Open,
  /// Reject with 500.
  Closed,
}

/// A limiter bound to one rule, keyed by caller IP.
#[derive(Clone)]
pub struct RateGate {
  limiter: RateLimiter,
  rule: RateRule,
  fail_mode: FailMode,
}

impl RateGate {
  pub fn new(limiter: RateLimiter, rule: RateRule) -> Self {
    Self {
      limiter,
      rule,
      fail_mode: FailMode::default(),
    }
  }

  pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
    self.fail_mode = fail_mode;
    self
  }

  pub fn rule(&self) -> &RateRule {
    &self.rule
  }
}

/// Caller address: first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
  let forwarded = headers
    .get("x-forwarded-for")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.split(',').next())
    .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
  if let Some(ip) = forwarded {
    return ip.to_string();
  }

  let real_ip = headers
    .get("x-real-ip")
    .and_then(|v| v.to_str().ok())
    .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
  if let Some(ip) = real_ip {
    return ip.to_string();
  }

  peer.map(|addr| addr.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

impl RateDecision {
  /// Write the quota headers onto a response.
  pub fn apply_headers(&self, headers: &mut HeaderMap) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(self.reset_at));
  }
}

/// 429 response for a rejected request.
#[derive(Debug)]
pub struct RateLimitRejection(pub RateDecision);

impl IntoResponse for RateLimitRejection {
  fn into_response(self) -> Response {
    let decision = self.0;
    let body = json!({
      "error": "Rate limit exceeded",
      "message": "Too many requests, please try again later",
      "limit": decision.limit,
      "window": format!("{}s", decision.window.as_secs()),
      "remaining": decision.remaining,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    decision.apply_headers(response.headers_mut());
    response
  }
}

/// Middleware admitting or rejecting each request under the gate's rule.
pub async fn enforce(State(gate): State<RateGate>, req: Request, next: Next) -> Response {
  let peer = req
    .extensions()
    .get::<ConnectInfo<SocketAddr>>()
    .map(|ConnectInfo(addr)| *addr);
  let identifier = client_ip(req.headers(), peer);

  match gate.limiter.check(&identifier, &gate.rule).await {
    Ok(decision) if decision.allowed => {
      let mut response = next.run(req).await;
      decision.apply_headers(response.headers_mut());
      response
    }
    Ok(decision) => RateLimitRejection(decision).into_response(),
    Err(e) => match gate.fail_mode {
      FailMode::Open => {
        tracing::warn!(identifier = %identifier, "rate limiter unavailable, admitting request: {}", e);
        next.run(req).await
      }
      FailMode::Closed => (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Rate limiter service error" })),
      )
        .into_response(),
    },
  }
}
