//! Per-connection actor: one read loop, one write loop, and request dispatch.
//!
//! The read loop owns the inbound half of the socket. It enforces the frame size
//! limit and a read deadline that only a pong refreshes, and stops when the peer
//! goes quiet, errors, or the connection is closed from elsewhere. The write loop
//! owns the outbound half and is the only consumer of the connection's queue. It
//! batches whatever is already queued into one frame, pings on a fixed period, and
//! sends a close frame once the queue has been closed and drained.

use crate::{
  bridge::Bridge,
  config::ConnectionSettings,
  connection::Connection,
  error::SendError,
  hub::Hub,
  protocol::{unix_timestamp, ClientRequest, Envelope, EventKind, GameUpdate, Pong, ScoreUpdateData},
  rate_limit::{user_identifier, RateLimiter, RateRule},
};
use axum::{body::Bytes, extract::ws::Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
  sync::mpsc,
  time::{self, Instant},
};
use tracing::Span;

pub struct Client {
  conn: Arc<Connection>,
  hub: Hub,
  bridge: Option<Bridge>,
  limiter: Option<RateLimiter>,
  score_rule: RateRule,
  settings: ConnectionSettings,
  span: Span,
}

impl Client {
  pub fn new(conn: Arc<Connection>, hub: Hub, settings: ConnectionSettings) -> Self {
    let span = tracing::info_span!("client", conn_id = conn.id(), user_id = conn.user_id());
    Self {
      conn,
      hub,
      bridge: None,
      limiter: None,
      score_rule: RateRule::score_submit(),
      settings,
      span,
    }
  }

  /// Route leaderboard subscription frames through `bridge`.
  pub fn with_bridge(mut self, bridge: Bridge) -> Self {
    self.bridge = Some(bridge);
    self
  }

  /// Gate `score_update` frames per user.
  pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
    self.limiter = Some(limiter);
    self
  }

  pub fn with_score_rule(mut self, rule: RateRule) -> Self {
    self.score_rule = rule;
    self
  }

  pub fn connection(&self) -> &Arc<Connection> {
    &self.conn
  }

  /// Register, pump both directions until either side stops, then unregister.
  pub async fn run<W, R>(self, sink: W, stream: R, outbound: mpsc::Receiver<Arc<str>>)
  where
    W: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
  {
    self.hub.register(self.conn.clone()).await;
    tracing::debug!(parent: &self.span, room_id = %self.conn.room_id(), "client started");

    let writer = tokio::spawn(write_loop(
      sink,
      outbound,
      self.conn.clone(),
      self.settings.clone(),
      self.span.clone(),
    ));

    self.read_loop(stream).await;
    self.hub.unregister(&self.conn).await;

    if let Err(e) = writer.await {
      tracing::error!(parent: &self.span, "write loop panicked: {}", e);
    }
    tracing::debug!(parent: &self.span, "client stopped");
  }

  async fn read_loop<R>(&self, mut stream: R)
  where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
  {
    let mut deadline = Instant::now() + self.settings.pong_wait;

    loop {
      let frame = tokio::select! {
        _ = self.conn.closed() => break,
        next = time::timeout_at(deadline, stream.next()) => match next {
          Ok(Some(Ok(frame))) => frame,
          Ok(Some(Err(e))) => {
            tracing::debug!(parent: &self.span, "read failed: {}", e);
            break;
          }
          Ok(None) => break,
          Err(_) => {
            tracing::info!(parent: &self.span, "read deadline elapsed, dropping connection");
            break;
          }
        },
      };

      match frame {
        Message::Text(text) => {
          if text.as_str().len() > self.settings.max_message_size {
            tracing::warn!(parent: &self.span, size = text.as_str().len(), "inbound frame too large");
            break;
          }
          self.dispatch(text.as_str()).await;
        }
        Message::Binary(bytes) => {
          if bytes.len() > self.settings.max_message_size {
            tracing::warn!(parent: &self.span, size = bytes.len(), "inbound frame too large");
            break;
          }
          match std::str::from_utf8(&bytes) {
            Ok(text) => self.dispatch(text).await,
            Err(_) => tracing::warn!(parent: &self.span, "ignoring non-utf8 binary frame"),
          }
        }
        Message::Pong(_) => deadline = Instant::now() + self.settings.pong_wait,
        Message::Ping(_) => {}
        Message::Close(_) => break,
      }
    }
  }

  /// Decode one inbound frame and act on it. Bad frames are logged and skipped.
  pub async fn dispatch(&self, text: &str) {
    let request = match ClientRequest::parse(text) {
      Ok(request) => request,
      Err(e) => {
        tracing::warn!(parent: &self.span, "ignoring malformed frame: {}", e);
        return;
      }
    };

    match request {
      ClientRequest::ScoreUpdate(data) => self.submit_score(data).await,
      ClientRequest::JoinRoom { room_id } => {
        if room_id.is_empty() {
          tracing::warn!(parent: &self.span, "ignoring join_room without a room id");
          return;
        }
        let info = self.hub.switch_room(&self.conn, &room_id).await;
        self.reply(EventKind::RoomInfo, info).await;
      }
      ClientRequest::Ping => {
        self
          .reply(
            EventKind::Pong,
            Pong {
              timestamp: unix_timestamp(),
            },
          )
          .await
      }
      ClientRequest::Subscription { action, channels } => match &self.bridge {
        Some(bridge) => bridge.handle(&self.conn, action, &channels).await,
        None => tracing::debug!(parent: &self.span, ?action, "leaderboard subscriptions not served here"),
      },
      ClientRequest::Unknown(kind) => {
        tracing::warn!(parent: &self.span, kind = %kind, "unknown message type");
      }
    }
  }

  async fn submit_score(&self, data: ScoreUpdateData) {
    if let Some(limiter) = &self.limiter {
      match limiter
        .is_allowed(&user_identifier(self.conn.user_id()), &self.score_rule)
        .await
      {
        Ok(true) => {}
        Ok(false) => {
          tracing::warn!(parent: &self.span, score = data.score, "score update rate limited");
          return;
        }
        Err(e) => tracing::warn!(parent: &self.span, "score rate limiter unavailable, admitting: {}", e),
      }
    }

    self.conn.set_score(data.score);
    let update = GameUpdate {
      user_id: self.conn.user_id(),
      username: self.conn.username().to_string(),
      current_score: data.score,
      action: "score_update".into(),
      timestamp: unix_timestamp(),
    };
    match Envelope::new(EventKind::ScoreUpdate, update).to_payload() {
      Ok(payload) => {
        self
          .hub
          .broadcast_room_except(&self.conn.room_id(), payload, self.conn.id())
          .await
      }
      Err(e) => tracing::error!(parent: &self.span, "failed to serialize score update: {}", e),
    }
  }

  async fn reply<T: Serialize>(&self, kind: EventKind, data: T) {
    let payload = match Envelope::new(kind, data).to_payload() {
      Ok(payload) => payload,
      Err(e) => {
        tracing::error!(parent: &self.span, ?kind, "failed to serialize reply: {}", e);
        return;
      }
    };
    if let Err(SendError::Full) = self.conn.try_send(payload) {
      self.hub.unregister(&self.conn).await;
    }
  }
}

/// Join the first message with whatever was already queued behind it.
///
/// Takes at most as many extra messages as were queued when called.
fn coalesce(first: Arc<str>, outbound: &mut mpsc::Receiver<Arc<str>>) -> String {
  let pending = outbound.len();
  let mut frame = String::from(&*first);
  for _ in 0..pending {
    match outbound.try_recv() {
      Ok(next) => {
        frame.push('\n');
        frame.push_str(&next);
      }
      Err(_) => break,
    }
  }
  frame
}

async fn send_frame<W>(sink: &mut W, frame: Message, wait: Duration) -> Result<(), axum::Error>
where
  W: Sink<Message, Error = axum::Error> + Unpin,
{
  match time::timeout(wait, sink.send(frame)).await {
    Ok(result) => result,
    Err(elapsed) => Err(axum::Error::new(elapsed)),
  }
}

async fn write_loop<W>(
  mut sink: W,
  mut outbound: mpsc::Receiver<Arc<str>>,
  conn: Arc<Connection>,
  settings: ConnectionSettings,
  span: Span,
) where
  W: Sink<Message, Error = axum::Error> + Unpin,
{
  let mut ticker = time::interval_at(Instant::now() + settings.ping_period, settings.ping_period);

  loop {
    tokio::select! {
      next = outbound.recv() => match next {
        Some(first) => {
          let frame = coalesce(first, &mut outbound);
          if let Err(e) = send_frame(&mut sink, Message::Text(frame.into()), settings.write_wait).await {
            tracing::debug!(parent: &span, "write failed: {}", e);
            break;
          }
        }
        None => {
          let _ = send_frame(&mut sink, Message::Close(None), settings.write_wait).await;
          break;
        }
      },
      _ = ticker.tick() => {
        if let Err(e) = send_frame(&mut sink, Message::Ping(Bytes::new()), settings.write_wait).await {
          tracing::debug!(parent: &span, "ping failed: {}", e);
          break;
        }
      }
    }
  }

  // Wakes the read loop if the socket died on this side first.
  conn.close();
}
