//! Follow-up supplier: pre-generated pool first, on-demand generation second,
//! a fixed generic question last.
//!
//! Both sources implement `FollowUpSource`; the supplier walks them in order
//! and takes the first that delivers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::answers::AnswerLog;
use crate::cache::{pool_key, question_analytics_key, room_analytics_key, KvCache};
use crate::domain::{FollowUpBucket, Question, QuestionType, Survey};
use crate::error::SessionResult;
use crate::evaluator::{Evaluators, FollowUpContext};
use crate::seeds::generic_follow_up;
use crate::util::trunc_for_log;

#[derive(Clone, Debug)]
pub struct FollowUpRequest {
  pub room: String,
  pub player: String,
  /// Root base question; selects the pool.
  pub base: Question,
  /// The question that was just answered; used as generation input.
  pub answered: Question,
  pub bucket: FollowUpBucket,
}

#[async_trait]
pub trait FollowUpSource: Send + Sync {
  fn name(&self) -> &'static str;
  async fn fetch(&self, req: &FollowUpRequest) -> Option<Question>;
}

/// Room-wide pool of pre-generated follow-ups, one cache key per bucket.
#[derive(Clone)]
pub struct PoolSource {
  cache: Arc<KvCache>,
}

impl PoolSource {
  pub fn new(cache: Arc<KvCache>) -> Self {
    Self { cache }
  }

  pub async fn push(&self, room: &str, base_key: &str, bucket: FollowUpBucket, q: Question) -> SessionResult<()> {
    self
      .cache
      .update::<Vec<Question>, _, _>(&pool_key(room, base_key, bucket.as_str()), |slot| {
        slot.get_or_insert_with(Vec::new).push(q);
        Ok(())
      })
      .await
  }

  /// Pop the front entry. Atomic per bucket: concurrent callers never share an entry.
  pub async fn pop(&self, room: &str, base_key: &str, bucket: FollowUpBucket) -> SessionResult<Option<Question>> {
    self
      .cache
      .update::<Vec<Question>, _, _>(&pool_key(room, base_key, bucket.as_str()), |slot| {
        Ok(match slot.as_mut() {
          Some(entries) if !entries.is_empty() => Some(entries.remove(0)),
          _ => None,
        })
      })
      .await
  }
}

#[async_trait]
impl FollowUpSource for PoolSource {
  fn name(&self) -> &'static str { "pool" }

  async fn fetch(&self, req: &FollowUpRequest) -> Option<Question> {
    match self.pop(&req.room, &req.base.key, req.bucket).await {
      Ok(q) => q,
      Err(e) => {
        warn!(target: "session", room = %req.room, base = %req.base.key, error = %e, "Pool read failed");
        None
      }
    }
  }
}

/// On-demand generation through the evaluator.
#[derive(Clone)]
pub struct GeneratorSource {
  evaluators: Evaluators,
  answers: Arc<dyn AnswerLog>,
  cache: Arc<KvCache>,
  context_answers: usize,
}

impl GeneratorSource {
  pub fn new(evaluators: Evaluators, answers: Arc<dyn AnswerLog>, cache: Arc<KvCache>, context_answers: usize) -> Self {
    Self { evaluators, answers, cache, context_answers }
  }

  /// Analytics are optional context: any read problem just means "none".
  async fn analytics(&self, room: &str, question: &str) -> Option<String> {
    let per_question = self.cache.get::<String>(&question_analytics_key(room, question)).await.ok().flatten();
    let per_room = self.cache.get::<String>(&room_analytics_key(room)).await.ok().flatten();
    match (per_question, per_room) {
      (None, None) => None,
      (q, r) => Some([q, r].into_iter().flatten().collect::<Vec<_>>().join("\n")),
    }
  }
}

#[async_trait]
impl FollowUpSource for GeneratorSource {
  fn name(&self) -> &'static str { "generator" }

  async fn fetch(&self, req: &FollowUpRequest) -> Option<Question> {
    let analytics = self.analytics(&req.room, &req.base.key).await;
    let recent_answers = match self.answers.recent_for_player(&req.room, &req.player, self.context_answers).await {
      Ok(rows) => rows
        .into_iter()
        .filter_map(|a| a.payload.get("text").and_then(|t| t.as_str()).map(|t| trunc_for_log(t, 400)))
        .collect(),
      Err(e) => {
        debug!(target: "session", error = %e, "No answer history for follow-up context");
        Vec::new()
      }
    };
    let ctx = FollowUpContext { bucket: req.bucket, analytics, recent_answers };
    match self.evaluators.generate_follow_up(&req.answered, &ctx).await {
      Ok(q) => Some(q),
      Err(e) => {
        warn!(target: "session", room = %req.room, base = %req.base.key, error = %e, "Follow-up generation failed");
        None
      }
    }
  }
}

#[derive(Clone)]
pub struct FollowUpSupplier {
  sources: Vec<Arc<dyn FollowUpSource>>,
}

impl FollowUpSupplier {
  pub fn new(sources: Vec<Arc<dyn FollowUpSource>>) -> Self {
    Self { sources }
  }

  /// Always yields a follow-up (key still unassigned) and the name of the source.
  #[instrument(level = "info", skip(self, req), fields(room = %req.room, base = %req.base.key, bucket = req.bucket.as_str()))]
  pub async fn get_follow_up(&self, req: &FollowUpRequest) -> (Question, &'static str) {
    for source in &self.sources {
      if let Some(mut q) = source.fetch(req).await {
        q.parent_key = Some(req.base.key.clone());
        debug!(target: "session", source = source.name(), "Follow-up acquired");
        return (q, source.name());
      }
    }
    (generic_follow_up(&req.base), "generic")
  }
}

/// Fill one pool entry per bucket for every essay question of the survey.
/// Generation failures leave the bucket empty; on-demand generation covers it later.
#[instrument(level = "info", skip(evaluators, pool, survey), fields(survey = %survey.id))]
pub async fn pregenerate_pools(evaluators: Evaluators, pool: PoolSource, room: String, survey: Survey) {
  let mut filled = 0usize;
  for base in survey.questions.iter().filter(|q| q.kind == QuestionType::Essay) {
    for bucket in FollowUpBucket::ALL {
      let ctx = FollowUpContext { bucket, ..Default::default() };
      match evaluators.generate_follow_up(base, &ctx).await {
        Ok(q) => {
          if pool.push(&room, &base.key, bucket, q).await.is_ok() {
            filled += 1;
          }
        }
        Err(e) => debug!(target: "session", %room, base = %base.key, bucket = bucket.as_str(), error = %e, "Pool entry not generated"),
      }
    }
  }
  info!(target: "session", %room, filled, "Follow-up pools pre-generated");
}
