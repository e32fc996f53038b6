//! Leaderboard server example: game rooms on `/ws`, live rankings on `/ws/leaderboard`.
//!
//! A background task plays the part of the scoring service. Every few seconds it bumps
//! a random player's score, recomputes the in-memory boards and hands the resulting
//! events to a [`Publisher`], which fans them out to every leaderboard subscriber.

use scorecast::{
  auth::JwtIdentity,
  bridge::{Board, InMemoryLeaderboards, LeaderboardEntry},
  pubsub::InMemoryPubSub,
  LeaderboardEvent, Publisher, Server, Settings,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

const PLAYERS: [(u64, &str); 5] = [(1, "ada"), (2, "bo"), (3, "cy"), (4, "dee"), (5, "eli")];

fn ranked(scores: &HashMap<u64, i64>) -> Vec<LeaderboardEntry> {
  let mut rows: Vec<_> = PLAYERS.iter().map(|(id, name)| (*id, *name, scores[id])).collect();
  rows.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
  rows
    .into_iter()
    .enumerate()
    .map(|(i, (id, name, score))| LeaderboardEntry::new(i as u32 + 1, id, name, score))
    .collect()
}

fn rank_of(entries: &[LeaderboardEntry], user_id: u64) -> u32 {
  entries.iter().find(|e| e.user_id == user_id).map_or(0, |e| e.rank)
}

async fn simulate_scores(boards: Arc<InMemoryLeaderboards>, publisher: Publisher) {
  let mut scores: HashMap<u64, i64> = PLAYERS.iter().map(|(id, _)| (*id, 0)).collect();
  let mut best = scores.clone();
  let mut tick = tokio::time::interval(Duration::from_secs(3));

  for round in 0u64.. {
    tick.tick().await;

    let (user_id, username) = PLAYERS[(round * 7 % PLAYERS.len() as u64) as usize];
    let before = ranked(&scores);
    let previous_score = scores[&user_id];
    let new_score = previous_score + (round as i64 * 37 % 90) + 10;
    scores.insert(user_id, new_score);
    let after = ranked(&scores);

    for board in [Board::Global, Board::Daily, Board::Weekly] {
      boards.set(board, after.clone());
    }

    let (old_rank, new_rank) = (rank_of(&before, user_id), rank_of(&after, user_id));
    let mut events = vec![
      LeaderboardEvent::ScoreUpdate {
        user_id,
        username: username.to_string(),
        new_score,
        previous_score,
        previous_rank: old_rank,
        new_rank,
      },
      LeaderboardEvent::RankChange {
        user_id,
        username: username.to_string(),
        old_rank,
        new_rank,
        score: new_score,
      },
      LeaderboardEvent::Refresh {
        board: Board::Global,
        limit: 10,
      },
    ];
    if new_score > best[&user_id] {
      best.insert(user_id, new_score);
      events.push(LeaderboardEvent::PersonalBest {
        user_id,
        username: username.to_string(),
        new_score,
      });
    }

    for event in events {
      if let Err(e) = publisher.submit(event) {
        tracing::warn!("dropped leaderboard event: {}", e);
      }
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter("leaderboard_server=debug,scorecast=info")
    .init();

  // Environment overrides apply; the demo supplies a secret and port when unset.
  let settings = Settings::from_lookup(|name| {
    std::env::var(name).ok().or_else(|| match name {
      "JWT_SECRET" => Some("leaderboard-secret-key".to_string()),
      "PORT" => Some("8080".to_string()),
      _ => None,
    })
  })?;

  let transport = Arc::new(InMemoryPubSub::new());
  let boards = Arc::new(InMemoryLeaderboards::new());

  let (publisher, publisher_task) =
    Publisher::spawn(transport.clone(), boards.clone(), settings.publish_queue_capacity);
  let simulation = tokio::spawn(simulate_scores(boards.clone(), publisher));

  let result = Server::new(JwtIdentity::new(&settings.jwt_secret))
    .with_settings(settings.connection.clone())
    .with_snapshot_limit(settings.snapshot_limit)
    .with_pubsub(transport)
    .with_leaderboards(boards)
    .listen(SocketAddr::from(([0, 0, 0, 0], settings.port)))
    .await;

  simulation.abort();
  publisher_task.join().await;
  result
}

/*
 * Client usage (JavaScript):
 *
 * const ws = new WebSocket("ws://localhost:8080/ws/leaderboard?token=" + accessToken);
 *
 * ws.onopen = () => {
 *   ws.send(JSON.stringify({ type: "subscribe", channels: ["global", "rank_changes"] }));
 * };
 *
 * ws.onmessage = (event) => {
 *   // Several messages may arrive in one frame, separated by newlines.
 *   for (const line of event.data.split("\n")) {
 *     const msg = JSON.parse(line);
 *     switch (msg.type) {
 *       case "current_leaderboard":
 *         render(msg.data.entries);
 *         break;
 *       case "live_update":
 *         console.log(msg.data.type, msg.data.data);
 *         break;
 *     }
 *   }
 * };
 *
 * // Game rooms use the other route:
 * const room = new WebSocket("ws://localhost:8080/ws?room=arena&token=" + accessToken);
 * room.send(JSON.stringify({ type: "score_update", data: { score: 42 } }));
 */
