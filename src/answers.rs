//! Durable answer log: append-only, unique on the idempotency tuple.
//!
//! The log is an external collaborator; `InMemoryAnswerLog` is the bundled
//! implementation and enforces the same uniqueness contract a database
//! unique index would.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{Answer, AnswerKey};
use crate::error::AnswerLogError;

#[async_trait]
pub trait AnswerLog: Send + Sync {
  /// Append a record. Fails with `Duplicate` if the idempotency tuple exists.
  async fn create(&self, answer: Answer) -> Result<(), AnswerLogError>;

  async fn find(&self, key: &AnswerKey) -> Result<Option<Answer>, AnswerLogError>;

  /// Most recent answers of one player in a room, oldest first, at most `limit`.
  async fn recent_for_player(&self, room: &str, player: &str, limit: usize) -> Result<Vec<Answer>, AnswerLogError>;
}

#[derive(Default)]
pub struct InMemoryAnswerLog {
  inner: RwLock<LogInner>,
}

#[derive(Default)]
struct LogInner {
  rows: Vec<Answer>,
  by_key: HashMap<AnswerKey, usize>,
}

impl InMemoryAnswerLog {
  pub fn new() -> Self {
    Self::default()
  }

  #[cfg(test)]
  pub async fn len(&self) -> usize {
    self.inner.read().await.rows.len()
  }
}

#[async_trait]
impl AnswerLog for InMemoryAnswerLog {
  async fn create(&self, answer: Answer) -> Result<(), AnswerLogError> {
    let mut inner = self.inner.write().await;
    let key = answer.idempotency_key();
    if inner.by_key.contains_key(&key) {
      return Err(AnswerLogError::Duplicate);
    }
    let idx = inner.rows.len();
    inner.rows.push(answer);
    inner.by_key.insert(key, idx);
    Ok(())
  }

  async fn find(&self, key: &AnswerKey) -> Result<Option<Answer>, AnswerLogError> {
    let inner = self.inner.read().await;
    Ok(inner.by_key.get(key).map(|i| inner.rows[*i].clone()))
  }

  async fn recent_for_player(&self, room: &str, player: &str, limit: usize) -> Result<Vec<Answer>, AnswerLogError> {
    let inner = self.inner.read().await;
    let mut recent: Vec<Answer> = inner
      .rows
      .iter()
      .rev()
      .filter(|a| a.room_code == room && a.player_id == player)
      .take(limit)
      .cloned()
      .collect();
    recent.reverse();
    Ok(recent)
  }
}
