//! Per-room scores and ranking.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::cache::{scores_key, KvCache};
use crate::error::SessionResult;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RoomScores {
  players: HashMap<String, ScoreEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ScoreEntry {
  nickname: String,
  score: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RankEntry {
  pub rank: usize,
  pub player_id: String,
  pub nickname: String,
  pub score: u64,
}

#[derive(Clone)]
pub struct ScoreStore {
  cache: Arc<KvCache>,
}

impl ScoreStore {
  pub fn new(cache: Arc<KvCache>) -> Self {
    Self { cache }
  }

  /// Put a player on the board with zero points (no-op if already there).
  pub async fn register(&self, room: &str, player: &str, nickname: &str) -> SessionResult<()> {
    self
      .cache
      .update::<RoomScores, _, _>(&scores_key(room), |slot| {
        slot
          .get_or_insert_with(RoomScores::default)
          .players
          .entry(player.to_string())
          .or_insert_with(|| ScoreEntry { nickname: nickname.to_string(), score: 0 });
        Ok(())
      })
      .await
  }

  /// Atomically add points and return the refreshed ranking.
  pub async fn add_points(&self, room: &str, player: &str, nickname: &str, points: u32) -> SessionResult<Vec<RankEntry>> {
    self
      .cache
      .update::<RoomScores, _, _>(&scores_key(room), |slot| {
        let scores = slot.get_or_insert_with(RoomScores::default);
        let entry = scores
          .players
          .entry(player.to_string())
          .or_insert_with(|| ScoreEntry { nickname: nickname.to_string(), score: 0 });
        entry.score += u64::from(points);
        Ok(rank(scores))
      })
      .await
  }

  pub async fn ranking(&self, room: &str) -> SessionResult<Vec<RankEntry>> {
    Ok(
      self
        .cache
        .get::<RoomScores>(&scores_key(room))
        .await?
        .map(|s| rank(&s))
        .unwrap_or_default(),
    )
  }
}

/// Descending by score; ties share a rank and are ordered by nickname.
fn rank(scores: &RoomScores) -> Vec<RankEntry> {
  let mut rows: Vec<(&String, &ScoreEntry)> = scores.players.iter().collect();
  rows.sort_by(|a, b| b.1.score.cmp(&a.1.score).then_with(|| a.1.nickname.cmp(&b.1.nickname)));
  let mut out: Vec<RankEntry> = Vec::with_capacity(rows.len());
  for (i, (id, e)) in rows.into_iter().enumerate() {
    let rank = match out.last() {
      Some(prev) if prev.score == e.score => prev.rank,
      _ => i + 1,
    };
    out.push(RankEntry { rank, player_id: id.clone(), nickname: e.nickname.clone(), score: e.score });
  }
  out
}
