//! Per-(room, player, question) attempt records. Created lazily, overwritten in place.

use std::sync::Arc;

use crate::cache::{attempt_key, KvCache};
use crate::domain::{AttemptState, AttemptStatus, Resolution};
use crate::error::{SessionError, SessionResult};
use crate::util::now_millis;

#[derive(Clone)]
pub struct AttemptTracker {
  cache: Arc<KvCache>,
}

impl AttemptTracker {
  pub fn new(cache: Arc<KvCache>) -> Self {
    Self { cache }
  }

  pub async fn get(&self, room: &str, player: &str, question_key: &str) -> SessionResult<Option<AttemptState>> {
    self.cache.get(&attempt_key(room, player, question_key)).await
  }

  /// Store in-progress text. Rejected once the question reached a terminal resolution.
  pub async fn save_draft(&self, room: &str, player: &str, question_key: &str, text: &str) -> SessionResult<AttemptState> {
    self
      .mutate(room, player, question_key, |a| {
        if matches!(a.resolution, Resolution::Sat | Resolution::Skipped) {
          return Err(SessionError::InvalidState(format!("question {} is already resolved", question_key)));
        }
        a.draft_text = text.to_string();
        a.status = AttemptStatus::Draft;
        Ok(())
      })
      .await
  }

  /// Count a try and record the submitted text. `tries` never decreases.
  pub async fn record_submission(&self, room: &str, player: &str, question_key: &str, text: &str) -> SessionResult<AttemptState> {
    self
      .mutate(room, player, question_key, |a| {
        a.tries = a.tries.saturating_add(1);
        a.submitted_text = text.to_string();
        a.status = AttemptStatus::Submitted;
        Ok(())
      })
      .await
  }

  pub async fn resolve(
    &self,
    room: &str,
    player: &str,
    question_key: &str,
    resolution: Resolution,
    summary: &str,
  ) -> SessionResult<AttemptState> {
    self
      .mutate(room, player, question_key, |a| {
        a.status = AttemptStatus::Evaluated;
        a.resolution = resolution;
        a.eval_summary = summary.to_string();
        Ok(())
      })
      .await
  }

  async fn mutate<F>(&self, room: &str, player: &str, question_key: &str, f: F) -> SessionResult<AttemptState>
  where
    F: FnOnce(&mut AttemptState) -> SessionResult<()>,
  {
    self
      .cache
      .update::<AttemptState, _, _>(&attempt_key(room, player, question_key), |slot| {
        let attempt = slot.get_or_insert_with(|| AttemptState {
          question_key: question_key.to_string(),
          ..Default::default()
        });
        f(attempt)?;
        attempt.updated_at = now_millis();
        Ok(attempt.clone())
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn tries_are_monotonic_and_skip_is_terminal() {
    let t = AttemptTracker::new(Arc::new(KvCache::new(Duration::from_secs(60))));
    t.save_draft("R", "p", "Q1", "half").await.unwrap();
    assert_eq!(t.record_submission("R", "p", "Q1", "one").await.unwrap().tries, 1);
    t.resolve("R", "p", "Q1", Resolution::Unsat, "thin").await.unwrap();
    // Unsat is not terminal: drafting again is allowed.
    t.save_draft("R", "p", "Q1", "more").await.unwrap();
    let a = t.record_submission("R", "p", "Q1", "two").await.unwrap();
    assert_eq!(a.tries, 2);
    assert_eq!(a.status, AttemptStatus::Submitted);
    t.resolve("R", "p", "Q1", Resolution::Skipped, "").await.unwrap();
    assert!(t.save_draft("R", "p", "Q1", "late").await.is_err());
    assert_eq!(t.get("R", "p", "Q1").await.unwrap().unwrap().tries, 2);
  }
}
