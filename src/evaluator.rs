//! Evaluator collaborator: essay grading and follow-up synthesis.
//!
//! `OpenAiEvaluator` talks to the model; `LocalEvaluator` is the deterministic
//! rubric used when no API key is configured and whenever the model fails or
//! misses its deadline. `Evaluators` bundles both behind the deadline so the
//! pipeline never sees an evaluator error for grading.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::config::Prompts;
use crate::domain::{FollowUpBucket, Question, QuestionType, Resolution};
use crate::error::EvaluatorError;
use crate::openai::OpenAI;

#[derive(Clone, Debug)]
pub struct Evaluation {
  pub resolution: Resolution,
  /// Normalized to [0, 1].
  pub quality: f32,
  pub signals: Option<Value>,
  pub follow_up_hint: Option<String>,
  pub summary: String,
}

/// Context handed to follow-up generation.
#[derive(Clone, Debug, Default)]
pub struct FollowUpContext {
  pub bucket: FollowUpBucket,
  /// Aggregate room/question analytics, when available.
  pub analytics: Option<String>,
  /// This player's latest answers, oldest first.
  pub recent_answers: Vec<String>,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
  fn name(&self) -> &'static str;

  async fn evaluate(&self, q: &Question, answer: &str) -> Result<Evaluation, EvaluatorError>;

  /// Returns a question with an empty key; the caller assigns the slot key.
  async fn generate_follow_up(&self, q: &Question, ctx: &FollowUpContext) -> Result<Question, EvaluatorError>;
}

pub struct OpenAiEvaluator {
  client: OpenAI,
  prompts: Prompts,
}

impl OpenAiEvaluator {
  pub fn new(client: OpenAI, prompts: Prompts) -> Self {
    Self { client, prompts }
  }
}

#[async_trait]
impl Evaluator for OpenAiEvaluator {
  fn name(&self) -> &'static str { "openai" }

  async fn evaluate(&self, q: &Question, answer: &str) -> Result<Evaluation, EvaluatorError> {
    let v = self
      .client
      .evaluate_essay(&self.prompts, q, answer)
      .await
      .map_err(classify)?;
    let resolution = if v.satisfied.unwrap_or(v.quality >= q.threshold_or_default()) {
      Resolution::Sat
    } else {
      Resolution::Unsat
    };
    Ok(Evaluation {
      resolution,
      quality: v.quality,
      signals: v.signals,
      follow_up_hint: v.follow_up_hint,
      summary: format!("quality={:.2}", v.quality),
    })
  }

  async fn generate_follow_up(&self, q: &Question, ctx: &FollowUpContext) -> Result<Question, EvaluatorError> {
    let history = ctx
      .recent_answers
      .iter()
      .map(|a| format!("- {}", a))
      .collect::<Vec<_>>()
      .join("\n");
    let g = self
      .client
      .generate_follow_up(
        &self.prompts,
        q,
        ctx.bucket.as_str(),
        ctx.analytics.as_deref().unwrap_or("(none)"),
        &history,
      )
      .await
      .map_err(classify)?;
    Ok(follow_up_shell(q, g.prompt, g.rubric.or_else(|| q.rubric.clone())))
  }
}

fn classify(e: String) -> EvaluatorError {
  if e.starts_with("JSON parse error") || e.contains("not a number") || e.contains("empty follow-up") {
    EvaluatorError::Malformed(e)
  } else {
    EvaluatorError::Unavailable(e)
  }
}

fn follow_up_shell(base: &Question, prompt: String, rubric: Option<String>) -> Question {
  Question {
    key: String::new(),
    parent_key: Some(base.root_key().to_string()),
    kind: QuestionType::Essay,
    prompt,
    rubric,
    points_max: base.points_max,
    threshold: base.threshold,
    scale_min: None,
    scale_max: None,
    options: None,
  }
}

/// Deterministic grading: answer length plus rubric keyword coverage.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalEvaluator;

const LOCAL_FULL_LENGTH_WORDS: f32 = 30.0;

impl LocalEvaluator {
  pub fn grade(&self, q: &Question, answer: &str) -> Evaluation {
    let words = answer.split_whitespace().count();
    // Scripts without spaces: approximate words from characters.
    let units = words.max(answer.trim().chars().count() / 4) as f32;
    let length_score = (units / LOCAL_FULL_LENGTH_WORDS).min(1.0);

    let keywords = rubric_keywords(q.rubric.as_deref().unwrap_or(""));
    let lower = answer.to_lowercase();
    let matched = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
    let quality = if keywords.is_empty() {
      length_score
    } else {
      0.7 * length_score + 0.3 * (matched as f32 / keywords.len() as f32)
    };
    let quality = (quality * 100.0).round() / 100.0;

    let resolution = if quality >= q.threshold_or_default() { Resolution::Sat } else { Resolution::Unsat };
    let hint = if length_score < 0.5 { "clarify" } else { "deepen" };
    Evaluation {
      resolution,
      quality,
      signals: Some(json!({ "words": words, "rubric_hits": matched, "rubric_terms": keywords.len(), "local": true })),
      follow_up_hint: Some(hint.into()),
      summary: format!("(local) quality={:.2}", quality),
    }
  }

  pub fn follow_up(&self, q: &Question, ctx: &FollowUpContext) -> Question {
    let prompt = match ctx.bucket {
      FollowUpBucket::Clarify => format!("Can you clarify what you meant? Try to be specific. ({})", q.prompt),
      FollowUpBucket::Deepen => format!("What is behind that? Explain the reason or impact in more depth. ({})", q.prompt),
      FollowUpBucket::Branch => format!("Is there a related aspect you have not mentioned yet? ({})", q.prompt),
      FollowUpBucket::Challenge => format!("What would someone who disagrees with you say? ({})", q.prompt),
      FollowUpBucket::Compare => format!("How does this compare with your past experience? ({})", q.prompt),
    };
    follow_up_shell(q, prompt, q.rubric.clone())
  }
}

#[async_trait]
impl Evaluator for LocalEvaluator {
  fn name(&self) -> &'static str { "local" }

  async fn evaluate(&self, q: &Question, answer: &str) -> Result<Evaluation, EvaluatorError> {
    Ok(self.grade(q, answer))
  }

  async fn generate_follow_up(&self, q: &Question, ctx: &FollowUpContext) -> Result<Question, EvaluatorError> {
    Ok(self.follow_up(q, ctx))
  }
}

fn rubric_keywords(rubric: &str) -> Vec<String> {
  let mut out: Vec<String> = rubric
    .split(|c: char| !c.is_alphanumeric())
    .filter(|w| w.chars().count() > 3)
    .map(|w| w.to_lowercase())
    .collect();
  out.sort();
  out.dedup();
  out
}

/// The configured evaluator behind a deadline, with the local rubric as fallback.
#[derive(Clone)]
pub struct Evaluators {
  primary: Arc<dyn Evaluator>,
  local: LocalEvaluator,
  deadline: Duration,
}

impl Evaluators {
  pub fn new(primary: Arc<dyn Evaluator>, deadline: Duration) -> Self {
    Self { primary, local: LocalEvaluator, deadline }
  }

  pub fn local_only(deadline: Duration) -> Self {
    Self::new(Arc::new(LocalEvaluator), deadline)
  }

  pub fn primary_name(&self) -> &'static str {
    self.primary.name()
  }

  /// Never fails: timeouts and errors degrade to the local rubric.
  #[instrument(level = "info", skip(self, q, answer), fields(key = %q.key, evaluator = self.primary.name()))]
  pub async fn evaluate(&self, q: &Question, answer: &str) -> Evaluation {
    let res = match tokio::time::timeout(self.deadline, self.primary.evaluate(q, answer)).await {
      Ok(r) => r,
      Err(_) => Err(EvaluatorError::Timeout(self.deadline.as_millis() as u64)),
    };
    match res {
      Ok(e) => e,
      Err(e) => {
        warn!(target: "session", key = %q.key, error = %e, "Evaluator failed; using local rubric");
        self.local.grade(q, answer)
      }
    }
  }

  /// Generation under the same deadline. Errors are returned so the caller
  /// can pick its own fallback.
  pub async fn generate_follow_up(&self, q: &Question, ctx: &FollowUpContext) -> Result<Question, EvaluatorError> {
    match tokio::time::timeout(self.deadline, self.primary.generate_follow_up(q, ctx)).await {
      Ok(r) => r,
      Err(_) => Err(EvaluatorError::Timeout(self.deadline.as_millis() as u64)),
    }
  }
}
