//! Per-player question delivery state machine.
//!
//! Every operation is one atomic read-modify-write of the player's queue key,
//! so players never contend with each other. Transitions are implemented on
//! `PlayerQueueState` directly and the store only wraps them in `update`.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::cache::{queue_key, KvCache};
use crate::domain::{PlayerQueueState, Question};
use crate::error::{SessionError, SessionResult};

#[derive(Clone)]
pub struct QueueStore {
  cache: Arc<KvCache>,
}

impl QueueStore {
  pub fn new(cache: Arc<KvCache>) -> Self {
    Self { cache }
  }

  /// Seed the queue from the survey's base questions. The head becomes
  /// current only when the room is already active; otherwise it is withheld.
  #[instrument(level = "debug", skip(self, base_questions), fields(count = base_questions.len()))]
  pub async fn join(&self, room: &str, player: &str, base_questions: &[Question], active: bool) -> SessionResult<Option<Question>> {
    let mut state = PlayerQueueState {
      room_code: room.to_string(),
      player_id: player.to_string(),
      ..Default::default()
    };
    for q in base_questions {
      if state.question_map.contains_key(&q.key) {
        continue;
      }
      state.ordered_queue.push(q.key.clone());
      state.question_map.insert(q.key.clone(), q.clone());
    }
    if active {
      release(&mut state);
    }
    let current = current_of(&state);
    self.cache.set(&queue_key(room, player), &state).await?;
    Ok(current)
  }

  pub async fn state(&self, room: &str, player: &str) -> SessionResult<PlayerQueueState> {
    self
      .cache
      .get::<PlayerQueueState>(&queue_key(room, player))
      .await?
      .ok_or_else(|| SessionError::not_found("player queue", format!("{}/{}", room, player)))
  }

  pub async fn current(&self, room: &str, player: &str) -> SessionResult<Option<Question>> {
    Ok(current_of(&self.state(room, player).await?))
  }

  /// Hand out the primed head once the room goes live.
  pub async fn release(&self, room: &str, player: &str) -> SessionResult<Option<Question>> {
    self.mutate(room, player, |s| {
      release(s);
      Ok(current_of(s))
    })
    .await
  }

  /// Apply the outcome of answering `expected` in one transition: splice the
  /// follow-up (if any), then advance when `move_on`. Fails with
  /// `InvalidState` when `expected` is no longer current, so of two racing
  /// answers to the same question exactly one moves the player.
  #[instrument(level = "debug", skip(self, follow_up), fields(follow_up = ?follow_up.as_ref().map(|q| &q.key)))]
  pub async fn settle(
    &self,
    room: &str,
    player: &str,
    expected: &str,
    follow_up: Option<Question>,
    move_on: bool,
  ) -> SessionResult<Option<Question>> {
    self.mutate(room, player, |s| {
      settle(s, expected, follow_up, move_on)?;
      Ok(current_of(s))
    })
    .await
  }

  #[instrument(level = "debug", skip(self))]
  pub async fn skip(&self, room: &str, player: &str, question_key: &str) -> SessionResult<Option<Question>> {
    self.mutate(room, player, |s| {
      skip(s, question_key)?;
      Ok(current_of(s))
    })
    .await
  }

  async fn mutate<R, F>(&self, room: &str, player: &str, f: F) -> SessionResult<R>
  where
    F: FnOnce(&mut PlayerQueueState) -> SessionResult<R>,
  {
    self
      .cache
      .update::<PlayerQueueState, _, _>(&queue_key(room, player), |slot| {
        let state = slot
          .as_mut()
          .ok_or_else(|| SessionError::not_found("player queue", format!("{}/{}", room, player)))?;
        f(state)
      })
      .await
  }
}

pub fn current_of(state: &PlayerQueueState) -> Option<Question> {
  if state.current_key.is_empty() {
    return None;
  }
  state.question_map.get(&state.current_key).cloned()
}

fn release(state: &mut PlayerQueueState) {
  if state.current_key.is_empty() {
    if let Some(head) = state.ordered_queue.first() {
      state.current_key = head.clone();
    }
  }
}

/// Pop the current key, then every closed head, and expose the next open head.
/// Bounded by the queue length; overrunning it means the state is corrupt.
pub fn advance(state: &mut PlayerQueueState) -> SessionResult<()> {
  if !state.current_key.is_empty() && state.ordered_queue.first() == Some(&state.current_key) {
    state.ordered_queue.remove(0);
  }
  let limit = state.ordered_queue.len();
  let mut skipped = 0usize;
  while let Some(head) = state.ordered_queue.first() {
    if !state.is_closed(head) {
      break;
    }
    if skipped >= limit {
      return Err(SessionError::Consistency(format!(
        "advance exceeded {} steps for {}/{}",
        limit, state.room_code, state.player_id
      )));
    }
    debug!(target: "session", key = %head, "Skipping question under closed parent");
    state.ordered_queue.remove(0);
    skipped += 1;
  }
  state.current_key = state.ordered_queue.first().cloned().unwrap_or_default();
  Ok(())
}

pub fn settle(state: &mut PlayerQueueState, expected: &str, follow_up: Option<Question>, move_on: bool) -> SessionResult<()> {
  if state.current_key.is_empty() || state.current_key != expected {
    return Err(SessionError::InvalidState(format!("question {} is not the current question", expected)));
  }
  if let Some(q) = follow_up {
    insert_follow_up(state, q);
  }
  if move_on {
    advance(state)?;
  }
  Ok(())
}

/// Splice right after the current key. Returns false when the key was
/// already present (nothing changed).
pub fn insert_follow_up(state: &mut PlayerQueueState, q: Question) -> bool {
  if state.question_map.contains_key(&q.key) || state.ordered_queue.contains(&q.key) {
    return false;
  }
  let at = state
    .ordered_queue
    .iter()
    .position(|k| *k == state.current_key && !state.current_key.is_empty())
    .map(|i| i + 1)
    .unwrap_or(state.ordered_queue.len());
  state.ordered_queue.insert(at, q.key.clone());
  state.question_map.insert(q.key.clone(), q);
  true
}

/// Close the question's chain (its root key) and move on if the player is
/// currently inside that chain.
pub fn skip(state: &mut PlayerQueueState, question_key: &str) -> SessionResult<()> {
  let root = state
    .question_map
    .get(question_key)
    .map(|q| q.root_key().to_string())
    .ok_or_else(|| SessionError::not_found("question", question_key))?;
  state.closed_parents.insert(root.clone());
  let current_root = state.question_map.get(&state.current_key).map(|q| q.root_key().to_string());
  if current_root.as_deref() == Some(root.as_str()) {
    advance(state)?;
  }
  Ok(())
}
