//! Domain models: questions, per-player queue state, attempts, answers, rooms.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a question is answered and scored.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
  /// Free text, judged by the evaluator against a quality threshold.
  Essay,
  /// Agreement/likert scale; participation points only, never gates.
  Degree,
  /// Multiple choice; deterministic points from the chosen option.
  Mcq,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct McqOption {
  pub id: String,
  pub label: String,
  #[serde(default)] pub points: u32,
}

/// Immutable question. A follow-up is a new question whose `parent_key`
/// names the base question at the root of its chain.
///
/// Wire form is camelCase like every other DTO; TOML catalogs may keep
/// snake_case keys.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
  pub key: String,
  #[serde(default, alias = "parent_key", skip_serializing_if = "Option::is_none")]
  pub parent_key: Option<String>,
  #[serde(rename = "type")]
  pub kind: QuestionType,
  pub prompt: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rubric: Option<String>,
  #[serde(alias = "points_max")]
  pub points_max: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub threshold: Option<f32>,
  #[serde(default, alias = "scale_min", skip_serializing_if = "Option::is_none")]
  pub scale_min: Option<i32>,
  #[serde(default, alias = "scale_max", skip_serializing_if = "Option::is_none")]
  pub scale_max: Option<i32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub options: Option<Vec<McqOption>>,
}

pub const DEFAULT_ESSAY_THRESHOLD: f32 = 0.6;

impl Question {
  /// Key of the base question this one belongs to (itself for a base question).
  pub fn root_key(&self) -> &str {
    self.parent_key.as_deref().unwrap_or(&self.key)
  }

  pub fn threshold_or_default(&self) -> f32 {
    self.threshold.unwrap_or(DEFAULT_ESSAY_THRESHOLD)
  }
}

/// Per-(room, player) delivery state.
///
/// Invariant: `current_key` is either empty (exhausted or withheld) or equal
/// to the head of `ordered_queue`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlayerQueueState {
  pub room_code: String,
  pub player_id: String,
  pub ordered_queue: Vec<String>,
  pub question_map: HashMap<String, Question>,
  pub closed_parents: HashSet<String>,
  pub current_key: String,
}

impl PlayerQueueState {
  pub fn is_closed(&self, key: &str) -> bool {
    if self.closed_parents.contains(key) {
      return true;
    }
    self
      .question_map
      .get(key)
      .and_then(|q| q.parent_key.as_deref())
      .map(|p| self.closed_parents.contains(p))
      .unwrap_or(false)
  }

  /// Number of follow-ups already registered under `root`.
  pub fn follow_up_count(&self, root: &str) -> usize {
    self
      .question_map
      .values()
      .filter(|q| q.parent_key.as_deref() == Some(root))
      .count()
  }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
  #[default]
  Draft,
  Submitted,
  Evaluated,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
  Sat,
  Unsat,
  Skipped,
  #[default]
  None,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttemptState {
  pub question_key: String,
  pub status: AttemptStatus,
  pub tries: u32,
  pub draft_text: String,
  pub submitted_text: String,
  pub resolution: Resolution,
  pub eval_summary: String,
  pub updated_at: u64,
}

/// Durable, append-only answer record. `(room_code, player_id, question_key,
/// client_attempt_id)` is unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Answer {
  pub room_code: String,
  pub player_id: String,
  pub question_key: String,
  pub client_attempt_id: String,
  pub payload: Value,
  pub resolution: Resolution,
  pub points_earned: u32,
  #[serde(default)] pub signals: Option<Value>,
  pub tries: u32,
  pub evaluated_at: u64,
  // What the submission led to, so a replay reports the same outcome.
  #[serde(default)] pub follow_up_key: Option<String>,
  #[serde(default)] pub next_key: Option<String>,
}

impl Answer {
  pub fn idempotency_key(&self) -> AnswerKey {
    AnswerKey {
      room_code: self.room_code.clone(),
      player_id: self.player_id.clone(),
      question_key: self.question_key.clone(),
      client_attempt_id: self.client_attempt_id.clone(),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AnswerKey {
  pub room_code: String,
  pub player_id: String,
  pub question_key: String,
  pub client_attempt_id: String,
}

/// Follow-up pool bucket. The evaluator's hint selects one; `clarify` is the default.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpBucket {
  #[default]
  Clarify,
  Deepen,
  Branch,
  Challenge,
  Compare,
}

impl FollowUpBucket {
  pub const ALL: [FollowUpBucket; 5] = [
    FollowUpBucket::Clarify,
    FollowUpBucket::Deepen,
    FollowUpBucket::Branch,
    FollowUpBucket::Challenge,
    FollowUpBucket::Compare,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      FollowUpBucket::Clarify => "clarify",
      FollowUpBucket::Deepen => "deepen",
      FollowUpBucket::Branch => "branch",
      FollowUpBucket::Challenge => "challenge",
      FollowUpBucket::Compare => "compare",
    }
  }

  /// Lenient hint parsing; unknown or missing hints map to `clarify`.
  pub fn from_hint(hint: Option<&str>) -> Self {
    match hint.map(|h| h.trim().to_ascii_lowercase()).as_deref() {
      Some("deepen") => FollowUpBucket::Deepen,
      Some("branch") => FollowUpBucket::Branch,
      Some("challenge") => FollowUpBucket::Challenge,
      Some("compare") => FollowUpBucket::Compare,
      _ => FollowUpBucket::Clarify,
    }
  }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
  #[default]
  Lobby,
  Active,
  Ended,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Room {
  pub code: String,
  pub survey_id: String,
  pub status: RoomStatus,
  pub host_token: String,
  pub created_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Player {
  pub id: String,
  pub nickname: String,
  pub token: String,
  pub joined_at: u64,
}

/// A survey from the read-only catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Survey {
  pub id: String,
  pub title: String,
  pub questions: Vec<Question>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn question_wire_form_is_camel_case() {
    let q = Question {
      key: "Q1.1".into(),
      parent_key: Some("Q1".into()),
      kind: QuestionType::Degree,
      prompt: "How sure?".into(),
      rubric: None,
      points_max: 20,
      threshold: None,
      scale_min: Some(1),
      scale_max: Some(5),
      options: None,
    };
    let v = serde_json::to_value(&q).unwrap();
    assert_eq!(
      v,
      json!({ "key": "Q1.1", "parentKey": "Q1", "type": "degree", "prompt": "How sure?", "pointsMax": 20, "scaleMin": 1, "scaleMax": 5 })
    );
    let back: Question = serde_json::from_value(v).unwrap();
    assert_eq!(back, q);
  }

  #[test]
  fn question_accepts_snake_case_catalog_keys() {
    let q: Question = serde_json::from_value(json!({
      "key": "Q2", "type": "degree", "prompt": "p", "points_max": 10, "scale_min": 0, "scale_max": 4
    }))
    .unwrap();
    assert_eq!((q.points_max, q.scale_min, q.scale_max), (10, Some(0), Some(4)));
  }
}
