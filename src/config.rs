//! Loading session configuration (tunables, prompts, survey catalog) from TOML.
//!
//! See `SessionConfig`, `Settings` and `Prompts` for the expected schema.

use serde::Deserialize;
use tracing::{error, info};

use crate::domain::Survey;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct SessionConfig {
  #[serde(default)]
  pub session: Settings,
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub surveys: Vec<Survey>,
}

/// Runtime tunables. Every field has a default so partial tables are fine.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// Lifetime of every cache entry belonging to a room.
  pub room_ttl_secs: u64,
  /// Deadline around each evaluator call before the local fallback kicks in.
  pub evaluator_timeout_ms: u64,
  /// Follow-ups a player can receive per base question.
  pub max_follow_ups: usize,
  /// Player answers handed to the generator as conversational context.
  pub follow_up_context_answers: usize,
  /// Outbound buffer per WebSocket connection.
  pub outbound_buffer: usize,
  /// Capacity of the hub's broadcast inbox.
  pub broadcast_inbox: usize,
  pub keepalive_interval_secs: u64,
  pub pong_timeout_secs: u64,
  pub cache_sweep_secs: u64,
  /// Pre-generate follow-up pools when a room is created.
  pub pregenerate_pools: bool,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      room_ttl_secs: 4 * 60 * 60,
      evaluator_timeout_ms: 15_000,
      max_follow_ups: 2,
      follow_up_context_answers: 3,
      outbound_buffer: 64,
      broadcast_inbox: 1024,
      keepalive_interval_secs: 20,
      pong_timeout_secs: 45,
      cache_sweep_secs: 60,
      pregenerate_pools: true,
    }
  }
}

/// Prompts used by the OpenAI evaluator. Override them in TOML to tune tone.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub evaluate_system: String,
  pub evaluate_user_template: String,
  pub follow_up_system: String,
  pub follow_up_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      evaluate_system: "You grade free-text survey answers for substance and relevance. Output JSON only.".into(),
      evaluate_user_template: "Question: {prompt}\nRubric: {rubric}\nPass threshold (0-1): {threshold}\nAnswer: {answer}\n\nReturn JSON: {\"quality\": number 0-1, \"satisfied\": boolean, \"signals\": object, \"follow_up_hint\": one of clarify|deepen|branch|challenge|compare}. 'satisfied' = quality >= threshold.".into(),
      follow_up_system: "You write one short follow-up survey question that helps the respondent give a fuller answer. Output JSON only.".into(),
      follow_up_user_template: "Original question: {prompt}\nFollow-up style: {bucket}\nAggregate context: {analytics}\nRecent answers from this respondent:\n{history}\n\nReturn JSON: {\"prompt\": string, \"rubric\": string}".into(),
    }
  }
}

/// Attempt to load `SessionConfig` from SESSION_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_session_config_from_env() -> Option<SessionConfig> {
  let path = std::env::var("SESSION_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<SessionConfig>(&s) {
      Ok(cfg) => {
        info!(target: "survey_live", %path, surveys = cfg.surveys.len(), "Loaded session config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "survey_live", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "survey_live", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::QuestionType;

  #[test]
  fn partial_toml_keeps_defaults() {
    let cfg: SessionConfig = toml::from_str(
      r#"
      [session]
      max_follow_ups = 4

      [[surveys]]
      id = "team"
      title = "Team pulse"

      [[surveys.questions]]
      key = "Q1"
      type = "essay"
      prompt = "What slowed you down this week?"
      points_max = 100
      threshold = 0.5
      "#,
    )
    .unwrap();
    assert_eq!(cfg.session.max_follow_ups, 4);
    assert_eq!(cfg.session.evaluator_timeout_ms, 15_000);
    assert_eq!(cfg.surveys[0].questions[0].kind, QuestionType::Essay);
    assert!(!cfg.prompts.evaluate_system.is_empty());
  }
}
