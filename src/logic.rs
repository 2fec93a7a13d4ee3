//! Core behaviors shared by both HTTP and WebSocket handlers.
//!
//! This includes:
//!   - Room control (create, start, end, analytics upload)
//!   - Joining, current question, drafts and skips
//!   - The answer pipeline: idempotency guard, scoring, follow-up splicing,
//!     queue advancement, score update and best-effort broadcasts

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::cache::{question_analytics_key, room_analytics_key};
use crate::domain::{
  Answer, AnswerKey, FollowUpBucket, Player, Question, QuestionType, Resolution, Room, RoomStatus,
};
use crate::error::{AnswerLogError, SessionError, SessionResult};
use crate::followup::{pregenerate_pools, FollowUpRequest};
use crate::hub::{self, Envelope};
use crate::protocol::{CreateRoomOut, JoinOut, SkipOut, SubmitIn, SubmitOut, SubmitStatus};
use crate::scores::RankEntry;
use crate::state::AppState;
use crate::util::{now_millis, trunc_for_log};

const CLAIM_POLL: Duration = Duration::from_millis(50);

// -------- Room control --------

#[instrument(level = "info", skip(state))]
pub async fn create_room(state: &AppState, survey_id: &str) -> SessionResult<CreateRoomOut> {
  let survey = state.survey(survey_id)?.clone();
  let room = state.rooms.create(survey_id).await?;
  if state.settings.pregenerate_pools {
    tokio::spawn(pregenerate_pools(state.evaluators.clone(), state.pool.clone(), room.code.clone(), survey));
  }
  Ok(CreateRoomOut { room_code: room.code, host_token: room.host_token })
}

/// Go live: every primed queue releases its head and each player is told.
#[instrument(level = "info", skip(state, host_token))]
pub async fn start_room(state: &AppState, code: &str, host_token: &str) -> SessionResult<Room> {
  state.rooms.authorize_host(code, host_token).await?;
  let room = state.rooms.transition(code, RoomStatus::Active).await?;
  let players = state.rooms.players(code).await?;
  for p in &players {
    match state.queues.release(code, &p.id).await {
      Ok(q) => push_next_question(state, code, &p.id, q.as_ref()),
      Err(e) => warn!(target: "session", room = %code, player = %p.id, error = %e, "Could not release queue"),
    }
  }
  info!(target: "session", room = %code, players = players.len(), "Room started");
  Ok(room)
}

#[instrument(level = "info", skip(state, host_token))]
pub async fn end_room(state: &AppState, code: &str, host_token: &str) -> SessionResult<Room> {
  state.rooms.authorize_host(code, host_token).await?;
  let room = state.rooms.transition(code, RoomStatus::Ended).await?;
  let ranking = state.scores.ranking(code).await.unwrap_or_default();
  state.hub.broadcast_to_all_players(code, Envelope::new(hub::ROOM_ENDED, json!({ "leaderboard": ranking })));
  state.hub.broadcast_to_host(code, Envelope::new(hub::LEADERBOARD_UPDATE, json!({ "entries": ranking, "final": true })));
  info!(target: "session", room = %code, "Room ended");
  Ok(room)
}

/// Store externally computed analytics used as follow-up generation context.
#[instrument(level = "info", skip(state, host_token, summary), fields(summary_len = summary.len()))]
pub async fn put_analytics(
  state: &AppState,
  code: &str,
  host_token: &str,
  question_key: Option<&str>,
  summary: &str,
) -> SessionResult<()> {
  state.rooms.authorize_host(code, host_token).await?;
  let key = match question_key {
    Some(q) => question_analytics_key(code, q),
    None => room_analytics_key(code),
  };
  state.cache.set(&key, &summary.to_string()).await
}

pub async fn leaderboard(state: &AppState, code: &str) -> SessionResult<Vec<RankEntry>> {
  state.rooms.get(code).await?;
  state.scores.ranking(code).await
}

// -------- Player operations --------

#[instrument(level = "info", skip(state))]
pub async fn join(state: &AppState, code: &str, nickname: &str) -> SessionResult<JoinOut> {
  let room = state.rooms.get(code).await?;
  if room.status == RoomStatus::Ended {
    return Err(SessionError::InvalidState(format!("room {} has ended", code)));
  }
  enroll(state, &room, nickname).await
}

/// Register the player and prime their queue from a room snapshot. If the
/// room went live after the snapshot was taken, the queue is released here:
/// `start_room` may already have walked a roster that did not include us.
async fn enroll(state: &AppState, room: &Room, nickname: &str) -> SessionResult<JoinOut> {
  let code = room.code.as_str();
  let survey = state.survey(&room.survey_id)?;
  let player = state.rooms.add_player(code, nickname).await?;
  let active = room.status == RoomStatus::Active;
  let mut first_question = state.queues.join(code, &player.id, &survey.questions, active).await?;
  if !active && state.rooms.get(code).await?.status == RoomStatus::Active {
    debug!(target: "session", room = %code, player = %player.id, "Room went live during join; releasing queue");
    first_question = state.queues.release(code, &player.id).await?;
  }
  state.scores.register(code, &player.id, &player.nickname).await?;
  info!(target: "session", room = %code, player = %player.id, nickname = %player.nickname, "Player joined");
  Ok(JoinOut { player_id: player.id, token: player.token, first_question })
}

#[instrument(level = "debug", skip(state, token))]
pub async fn current_question(state: &AppState, code: &str, player_id: &str, token: &str) -> SessionResult<Option<Question>> {
  state.rooms.authorize_player(code, player_id, token).await?;
  let room = state.rooms.get(code).await?;
  if room.status != RoomStatus::Active {
    return Ok(None);
  }
  state.queues.current(code, player_id).await
}

#[instrument(level = "debug", skip(state, token, text), fields(text_len = text.len()))]
pub async fn save_draft(state: &AppState, code: &str, player_id: &str, token: &str, question_key: &str, text: &str) -> SessionResult<()> {
  state.rooms.authorize_player(code, player_id, token).await?;
  let qs = state.queues.state(code, player_id).await?;
  if !qs.question_map.contains_key(question_key) {
    return Err(SessionError::not_found("question", question_key));
  }
  state.attempts.save_draft(code, player_id, question_key, text).await?;
  Ok(())
}

#[instrument(level = "info", skip(state, token))]
pub async fn skip(state: &AppState, code: &str, player_id: &str, token: &str, question_key: &str) -> SessionResult<SkipOut> {
  let player = state.rooms.authorize_player(code, player_id, token).await?;
  require_active(state, code).await?;
  let qs = state.queues.state(code, player_id).await?;
  if !qs.question_map.contains_key(question_key) {
    return Err(SessionError::not_found("question", question_key));
  }
  let next = state.queues.skip(code, player_id, question_key).await?;
  state.attempts.resolve(code, player_id, question_key, Resolution::Skipped, "skipped").await?;
  info!(target: "session", room = %code, player = %player_id, %question_key, next = ?next.as_ref().map(|q| &q.key), "Question skipped");

  let remaining = state.queues.state(code, player_id).await.map(|s| s.ordered_queue.len()).unwrap_or(0);
  push_progress(state, code, &player, question_key, Resolution::Skipped, 0, remaining);
  push_next_question(state, code, player_id, next.as_ref());
  Ok(SkipOut { done: next.is_none(), next_question: next })
}

// -------- Answer pipeline --------

/// What a validated payload means for scoring.
enum Parsed {
  Essay(String),
  Degree(i64),
  Mcq { option_id: String, points: u32 },
}

impl Parsed {
  fn as_text(&self) -> String {
    match self {
      Parsed::Essay(t) => t.clone(),
      Parsed::Degree(v) => v.to_string(),
      Parsed::Mcq { option_id, .. } => option_id.clone(),
    }
  }
}

/// Result of grading one submission, before anything is persisted.
struct Graded {
  resolution: Resolution,
  points: u32,
  signals: Option<Value>,
  summary: String,
  hint: Option<String>,
}

#[instrument(level = "info", skip(state, token, body), fields(question_key = %body.question_key, attempt = %body.client_attempt_id))]
pub async fn submit_answer(state: &AppState, code: &str, player_id: &str, token: &str, body: SubmitIn) -> SessionResult<SubmitOut> {
  let player = state.rooms.authorize_player(code, player_id, token).await?;
  let key = AnswerKey {
    room_code: code.to_string(),
    player_id: player_id.to_string(),
    question_key: body.question_key.clone(),
    client_attempt_id: body.client_attempt_id.clone(),
  };

  // 1. Idempotency guard.
  if let Some(prev) = state.answers.find(&key).await? {
    debug!(target: "session", room = %code, player = %player_id, "Replaying recorded answer");
    return replay(state, &prev).await;
  }
  if !claim(state, &key).await? {
    return wait_for_winner(state, &key).await;
  }

  // The evaluation runs on its own task: if the caller goes away (client
  // disconnect drops the handler), the row is still written and the claim
  // still released, so a retry replays instead of waiting on a dead claim.
  let owned = state.clone();
  let task = tokio::spawn(async move {
    // A previous holder may have finished between the lookup and the claim.
    let res = match owned.answers.find(&key).await {
      Ok(Some(prev)) => replay(&owned, &prev).await,
      Ok(None) => evaluate_and_record(&owned, &player, &key, body.payload).await,
      Err(e) => Err(e.into()),
    };
    release_claim(&owned, &key).await;
    res
  });
  task
    .await
    .map_err(|e| SessionError::Consistency(format!("submission task failed: {}", e)))?
}

async fn evaluate_and_record(state: &AppState, player: &Player, key: &AnswerKey, payload: Value) -> SessionResult<SubmitOut> {
  let code = key.room_code.as_str();
  let player_id = key.player_id.as_str();
  require_active(state, code).await?;

  // 2. Resolve the question from this player's map.
  let qs = state.queues.state(code, player_id).await?;
  let q = qs
    .question_map
    .get(&key.question_key)
    .cloned()
    .ok_or_else(|| SessionError::not_found("question", key.question_key.clone()))?;
  if qs.current_key != q.key {
    return Err(SessionError::InvalidState(format!("question {} is not the current question", q.key)));
  }
  let parsed = parse_payload(&q, &payload)?;

  // 3. Count the try.
  let attempt = state.attempts.record_submission(code, player_id, &q.key, &parsed.as_text()).await?;

  // 4. Grade.
  let graded = grade(state, &q, &parsed).await;

  // Follow-up on an unsatisfying essay, within the per-question budget.
  let mut follow_up: Option<Question> = None;
  if graded.resolution == Resolution::Unsat {
    let root = q.root_key().to_string();
    let used = qs.follow_up_count(&root);
    if used < state.settings.max_follow_ups {
      let base = qs.question_map.get(&root).cloned().unwrap_or_else(|| q.clone());
      let req = FollowUpRequest {
        room: code.to_string(),
        player: player_id.to_string(),
        base,
        answered: q.clone(),
        bucket: FollowUpBucket::from_hint(graded.hint.as_deref()),
      };
      let (mut fu, origin) = state.follow_ups.get_follow_up(&req).await;
      fu.key = format!("{}.{}", root, used + 1);
      fu.parent_key = Some(root);
      info!(target: "session", room = %code, player = %player_id, follow_up = %fu.key, %origin, "Follow-up acquired");
      follow_up = Some(fu);
    } else {
      debug!(target: "session", room = %code, player = %player_id, question = %q.key, "Follow-up budget exhausted");
    }
  }

  // 5./6./7. Move the player in one conditional transition. Only the answer
  // that wins it is recorded and scored; a racing answer to the same
  // question finds it no longer current.
  let move_on = graded.resolution == Resolution::Sat || follow_up.is_some();
  let next_question = state.queues.settle(code, player_id, &q.key, follow_up.clone(), move_on).await?;

  let answer = Answer {
    room_code: code.to_string(),
    player_id: player_id.to_string(),
    question_key: q.key.clone(),
    client_attempt_id: key.client_attempt_id.clone(),
    payload,
    resolution: graded.resolution,
    points_earned: graded.points,
    signals: graded.signals.clone(),
    tries: attempt.tries,
    evaluated_at: now_millis(),
    follow_up_key: follow_up.as_ref().map(|f| f.key.clone()),
    next_key: next_question.as_ref().map(|n| n.key.clone()),
  };
  // The unique index settles anything the claim could not (an expired claim).
  if let Err(AnswerLogError::Duplicate) = state.answers.create(answer).await {
    let prev = state
      .answers
      .find(key)
      .await?
      .ok_or_else(|| SessionError::Consistency("duplicate answer without a stored row".into()))?;
    return replay(state, &prev).await;
  }
  state.attempts.resolve(code, player_id, &q.key, graded.resolution, &graded.summary).await?;

  if graded.points > 0 {
    match state.scores.add_points(code, player_id, &player.nickname, graded.points).await {
      Ok(ranking) => state
        .hub
        .broadcast_to_host(code, Envelope::new(hub::LEADERBOARD_UPDATE, json!({ "entries": ranking }))),
      Err(e) => {
        warn!(target: "session", room = %code, player = %player_id, error = %e, "Score update failed");
        state.hub.broadcast_to_player(
          code,
          player_id,
          Envelope::new(hub::ERROR, json!({ "message": "score update failed; points will not show yet", "questionKey": q.key })),
        );
      }
    }
  }

  info!(
    target: "session",
    room = %code,
    player = %player_id,
    question = %q.key,
    resolution = ?graded.resolution,
    points = graded.points,
    tries = attempt.tries,
    "Answer evaluated"
  );

  // 8. Best-effort fan-out.
  let remaining = state.queues.state(code, player_id).await.map(|s| s.ordered_queue.len()).unwrap_or(0);
  push_progress(state, code, player, &q.key, graded.resolution, graded.points, remaining);
  state.hub.broadcast_to_player(
    code,
    player_id,
    Envelope::new(
      hub::EVALUATION_RESULT,
      json!({
        "questionKey": q.key,
        "resolution": graded.resolution,
        "pointsEarned": graded.points,
        "summary": graded.summary,
        "followUp": follow_up,
      }),
    ),
  );
  push_next_question(state, code, player_id, next_question.as_ref());

  let done = next_question.is_none();
  Ok(SubmitOut {
    status: SubmitStatus::Evaluated,
    resolution: graded.resolution,
    points_earned: graded.points,
    next_question: if graded.resolution == Resolution::Sat { next_question } else { None },
    follow_up,
    done,
  })
}

fn parse_payload(q: &Question, payload: &Value) -> SessionResult<Parsed> {
  match q.kind {
    QuestionType::Essay => {
      let text = payload
        .get("text")
        .and_then(Value::as_str)
        .or_else(|| payload.as_str())
        .ok_or_else(|| SessionError::InvalidPayload("essay answers need a 'text' string".into()))?;
      Ok(Parsed::Essay(text.to_string()))
    }
    QuestionType::Degree => {
      let value = payload
        .get("value")
        .and_then(Value::as_i64)
        .or_else(|| payload.as_i64())
        .ok_or_else(|| SessionError::InvalidPayload("degree answers need an integer 'value'".into()))?;
      let min = i64::from(q.scale_min.unwrap_or(i32::MIN));
      let max = i64::from(q.scale_max.unwrap_or(i32::MAX));
      if value < min || value > max {
        return Err(SessionError::InvalidPayload(format!("value {} outside {}..={}", value, min, max)));
      }
      Ok(Parsed::Degree(value))
    }
    QuestionType::Mcq => {
      let option_id = payload
        .get("optionId")
        .or_else(|| payload.get("option_id"))
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::InvalidPayload("mcq answers need an 'optionId'".into()))?;
      let option = q
        .options
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|o| o.id == option_id)
        .ok_or_else(|| SessionError::InvalidPayload(format!("unknown option {}", option_id)))?;
      Ok(Parsed::Mcq { option_id: option.id.clone(), points: option.points.min(q.points_max) })
    }
  }
}

async fn grade(state: &AppState, q: &Question, parsed: &Parsed) -> Graded {
  match parsed {
    Parsed::Essay(text) => {
      let eval = state.evaluators.evaluate(q, text).await;
      let points = if eval.resolution == Resolution::Sat {
        (eval.quality.clamp(0.0, 1.0) * q.points_max as f32).round() as u32
      } else {
        0
      };
      debug!(target: "session", key = %q.key, answer = %trunc_for_log(text, 80), quality = eval.quality, "Essay graded");
      Graded {
        resolution: eval.resolution,
        points,
        signals: eval.signals,
        summary: eval.summary,
        hint: eval.follow_up_hint,
      }
    }
    Parsed::Degree(value) => Graded {
      resolution: Resolution::Sat,
      points: q.points_max / 2,
      signals: Some(json!({ "value": value })),
      summary: "participation".into(),
      hint: None,
    },
    Parsed::Mcq { option_id, points } => Graded {
      resolution: Resolution::Sat,
      points: *points,
      signals: Some(json!({ "optionId": option_id })),
      summary: format!("option {}", option_id),
      hint: None,
    },
  }
}

/// Rebuild the original outcome from a stored answer row.
async fn replay(state: &AppState, prev: &Answer) -> SessionResult<SubmitOut> {
  let qs = state.queues.state(&prev.room_code, &prev.player_id).await?;
  let lookup = |k: &Option<String>| k.as_ref().and_then(|k| qs.question_map.get(k).cloned());
  Ok(SubmitOut {
    status: SubmitStatus::AlreadyProcessed,
    resolution: prev.resolution,
    points_earned: prev.points_earned,
    next_question: if prev.resolution == Resolution::Sat { lookup(&prev.next_key) } else { None },
    follow_up: lookup(&prev.follow_up_key),
    done: prev.next_key.is_none(),
  })
}

fn claim_key(key: &AnswerKey) -> String {
  format!("claim:{}:{}:{}:{}", key.room_code, key.player_id, key.question_key, key.client_attempt_id)
}

/// Mark this attempt as in flight. False if another request holds it.
async fn claim(state: &AppState, key: &AnswerKey) -> SessionResult<bool> {
  state
    .cache
    .update_with_ttl::<bool, _, _>(&claim_key(key), claim_ttl(state), |slot| {
      if slot.is_some() {
        return Ok(false);
      }
      *slot = Some(true);
      Ok(true)
    })
    .await
}

/// Evaluation and follow-up generation are each bounded by the evaluator
/// deadline; a claim outliving both belongs to a holder that is gone.
fn claim_ttl(state: &AppState) -> Duration {
  Duration::from_millis(state.settings.evaluator_timeout_ms.saturating_mul(2)) + Duration::from_secs(2)
}

async fn release_claim(state: &AppState, key: &AnswerKey) {
  state.cache.delete(&claim_key(key)).await;
}

/// A concurrent duplicate is being evaluated: wait for its row and replay it.
async fn wait_for_winner(state: &AppState, key: &AnswerKey) -> SessionResult<SubmitOut> {
  let deadline = tokio::time::Instant::now() + claim_ttl(state);
  loop {
    // Read the claim first: the holder writes its row before releasing it.
    let still_claimed = state.cache.get::<bool>(&claim_key(key)).await?.is_some();
    if let Some(prev) = state.answers.find(key).await? {
      return replay(state, &prev).await;
    }
    if !still_claimed || tokio::time::Instant::now() >= deadline {
      return Err(SessionError::InvalidState("submission is still being processed; retry".into()));
    }
    tokio::time::sleep(CLAIM_POLL).await;
  }
}

async fn require_active(state: &AppState, code: &str) -> SessionResult<Room> {
  let room = state.rooms.get(code).await?;
  if room.status != RoomStatus::Active {
    return Err(SessionError::InvalidState(format!("room {} is {:?}", code, room.status)));
  }
  Ok(room)
}

// -------- Broadcast helpers (fire and forget) --------

fn push_next_question(state: &AppState, code: &str, player_id: &str, q: Option<&Question>) {
  state.hub.broadcast_to_player(
    code,
    player_id,
    Envelope::new(hub::NEXT_QUESTION, json!({ "question": q, "done": q.is_none() })),
  );
}

fn push_progress(state: &AppState, code: &str, player: &Player, question_key: &str, resolution: Resolution, points: u32, remaining: usize) {
  state.hub.broadcast_to_host(
    code,
    Envelope::new(
      hub::PLAYER_PROGRESS_UPDATE,
      json!({
        "playerId": player.id,
        "nickname": player.nickname,
        "questionKey": question_key,
        "resolution": resolution,
        "pointsEarned": points,
        "remaining": remaining,
      }),
    ),
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Settings;
  use crate::domain::{McqOption, Survey};
  use crate::error::EvaluatorError;
  use crate::evaluator::{Evaluation, Evaluator, FollowUpContext, LocalEvaluator};
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  /// Reads the quality from the answer text ("q=0.4"); counts calls.
  #[derive(Default)]
  struct Scripted {
    calls: AtomicUsize,
    delay: Option<Duration>,
  }

  impl Scripted {
    fn slow(ms: u64) -> Self {
      Self { delay: Some(Duration::from_millis(ms)), ..Self::default() }
    }
  }

  #[async_trait]
  impl Evaluator for Scripted {
    fn name(&self) -> &'static str { "scripted" }

    async fn evaluate(&self, q: &Question, answer: &str) -> Result<Evaluation, EvaluatorError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(d) = self.delay {
        tokio::time::sleep(d).await;
      }
      let quality: f32 = answer
        .strip_prefix("q=")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EvaluatorError::Malformed(answer.to_string()))?;
      let resolution = if quality >= q.threshold_or_default() { Resolution::Sat } else { Resolution::Unsat };
      Ok(Evaluation { resolution, quality, signals: None, follow_up_hint: Some("clarify".into()), summary: String::new() })
    }

    async fn generate_follow_up(&self, q: &Question, ctx: &FollowUpContext) -> Result<Question, EvaluatorError> {
      LocalEvaluator.generate_follow_up(q, ctx).await
    }
  }

  fn essay(key: &str) -> Question {
    Question {
      key: key.into(),
      parent_key: None,
      kind: QuestionType::Essay,
      prompt: "What did you learn?".into(),
      rubric: None,
      points_max: 100,
      threshold: Some(0.6),
      scale_min: None,
      scale_max: None,
      options: None,
    }
  }

  fn degree(key: &str) -> Question {
    Question { kind: QuestionType::Degree, points_max: 30, threshold: None, scale_min: Some(1), scale_max: Some(5), ..essay(key) }
  }

  fn mcq(key: &str) -> Question {
    Question {
      kind: QuestionType::Mcq,
      points_max: 10,
      threshold: None,
      options: Some(vec![
        McqOption { id: "a".into(), label: "A".into(), points: 10 },
        McqOption { id: "b".into(), label: "B".into(), points: 0 },
      ]),
      ..essay(key)
    }
  }

  fn app(questions: Vec<Question>) -> (AppState, Arc<Scripted>) {
    app_with(questions, Scripted::default())
  }

  fn app_with(questions: Vec<Question>, scripted: Scripted) -> (AppState, Arc<Scripted>) {
    let settings = Settings { pregenerate_pools: false, evaluator_timeout_ms: 1_000, ..Settings::default() };
    let scripted = Arc::new(scripted);
    let survey = Survey { id: "s".into(), title: "t".into(), questions };
    (AppState::with_parts(settings, vec![survey], scripted.clone()), scripted)
  }

  async fn live_room(state: &AppState) -> (String, String) {
    let room = create_room(state, "s").await.unwrap();
    start_room(state, &room.room_code, &room.host_token).await.unwrap();
    (room.room_code, room.host_token)
  }

  fn submit(key: &str, attempt: &str, payload: Value) -> SubmitIn {
    SubmitIn { question_key: key.into(), client_attempt_id: attempt.into(), payload }
  }

  #[tokio::test]
  async fn essay_follow_up_scenario() {
    let (state, scripted) = app(vec![essay("Q1")]);
    let (code, _) = live_room(&state).await;
    let p1 = join(&state, &code, "p1").await.unwrap();
    assert_eq!(p1.first_question.as_ref().unwrap().key, "Q1");

    let first = submit_answer(&state, &code, &p1.player_id, &p1.token, submit("Q1", "a1", json!({ "text": "q=0.4" })))
      .await
      .unwrap();
    assert_eq!(first.status, SubmitStatus::Evaluated);
    assert_eq!(first.resolution, Resolution::Unsat);
    assert_eq!(first.points_earned, 0);
    assert_eq!(first.follow_up.as_ref().unwrap().key, "Q1.1");
    let cur = current_question(&state, &code, &p1.player_id, &p1.token).await.unwrap().unwrap();
    assert_eq!(cur.key, "Q1.1");
    assert_eq!(cur.parent_key.as_deref(), Some("Q1"));

    let again = submit_answer(&state, &code, &p1.player_id, &p1.token, submit("Q1", "a1", json!({ "text": "q=0.4" })))
      .await
      .unwrap();
    assert_eq!(again.status, SubmitStatus::AlreadyProcessed);
    assert_eq!(again.resolution, Resolution::Unsat);
    assert_eq!(again.points_earned, 0);
    assert_eq!(again.follow_up.as_ref().unwrap().key, "Q1.1");
    assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.answers.recent_for_player(&code, &p1.player_id, 10).await.unwrap().len(), 1);

    let second = submit_answer(&state, &code, &p1.player_id, &p1.token, submit("Q1.1", "a2", json!({ "text": "q=0.8" })))
      .await
      .unwrap();
    assert_eq!(second.resolution, Resolution::Sat);
    assert_eq!(second.points_earned, 80);
    assert!(second.next_question.is_none());
    assert!(second.done);
    assert!(current_question(&state, &code, &p1.player_id, &p1.token).await.unwrap().is_none());
    assert!(state.queues.current(&code, &p1.player_id).await.unwrap().is_none());

    let board = leaderboard(&state, &code).await.unwrap();
    assert_eq!(board[0].score, 80);
  }

  #[tokio::test]
  async fn concurrent_duplicates_score_once() {
    let (state, scripted) = app(vec![essay("Q1"), essay("Q2")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "dup").await.unwrap();
    let mut handles = Vec::new();
    for _ in 0..8 {
      let (s, c, id, tok) = (state.clone(), code.clone(), p.player_id.clone(), p.token.clone());
      handles.push(tokio::spawn(async move {
        submit_answer(&s, &c, &id, &tok, submit("Q1", "same", json!({ "text": "q=0.9" }))).await
      }));
    }
    for h in handles {
      let out = h.await.unwrap().unwrap();
      assert_eq!(out.points_earned, 90);
      assert_eq!(out.next_question.unwrap().key, "Q2");
    }
    assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
    assert_eq!(leaderboard(&state, &code).await.unwrap()[0].score, 90);
    assert_eq!(current_question(&state, &code, &p.player_id, &p.token).await.unwrap().unwrap().key, "Q2");
  }

  #[tokio::test]
  async fn dropped_submission_still_lands_and_retry_replays() {
    let (state, scripted) = app_with(vec![essay("Q1"), essay("Q2")], Scripted::slow(300));
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "flaky").await.unwrap();
    let (s, c, id, tok) = (state.clone(), code.clone(), p.player_id.clone(), p.token.clone());
    let first = tokio::spawn(async move {
      submit_answer(&s, &c, &id, &tok, submit("Q1", "a1", json!({ "text": "q=0.9" }))).await
    });
    // The client gives up while the evaluator is still working.
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.abort();

    for _ in 0..2 {
      let retry = submit_answer(&state, &code, &p.player_id, &p.token, submit("Q1", "a1", json!({ "text": "q=0.9" })))
        .await
        .unwrap();
      assert_eq!(retry.status, SubmitStatus::AlreadyProcessed);
      assert_eq!(retry.points_earned, 90);
      assert_eq!(retry.next_question.unwrap().key, "Q2");
    }
    assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
    assert_eq!(leaderboard(&state, &code).await.unwrap()[0].score, 90);
  }

  #[tokio::test]
  async fn racing_attempts_on_one_question_move_the_player_once() {
    let (state, _) = app_with(vec![essay("Q1"), essay("Q2"), essay("Q3")], Scripted::slow(100));
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "twice").await.unwrap();
    let mut handles = Vec::new();
    for attempt in ["a1", "b1"] {
      let (s, c, id, tok) = (state.clone(), code.clone(), p.player_id.clone(), p.token.clone());
      handles.push(tokio::spawn(async move {
        submit_answer(&s, &c, &id, &tok, submit("Q1", attempt, json!({ "text": "q=0.9" }))).await
      }));
    }
    let mut won = Vec::new();
    let mut refused = 0;
    for h in handles {
      match h.await.unwrap() {
        Ok(out) => won.push(out),
        Err(SessionError::InvalidState(_)) => refused += 1,
        Err(e) => panic!("unexpected error {:?}", e),
      }
    }
    assert_eq!((won.len(), refused), (1, 1));
    assert_eq!(won[0].next_question.as_ref().unwrap().key, "Q2");
    assert_eq!(current_question(&state, &code, &p.player_id, &p.token).await.unwrap().unwrap().key, "Q2");
    assert_eq!(leaderboard(&state, &code).await.unwrap()[0].score, 90);
    assert_eq!(state.answers.recent_for_player(&code, &p.player_id, 10).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn join_overtaken_by_room_start_still_gets_a_question() {
    let (state, _) = app(vec![essay("Q1")]);
    let room = create_room(&state, "s").await.unwrap();
    // Join read the room while it was still in the lobby...
    let snapshot = state.rooms.get(&room.room_code).await.unwrap();
    assert_eq!(snapshot.status, RoomStatus::Lobby);
    // ...and the host started it before the player reached the roster.
    start_room(&state, &room.room_code, &room.host_token).await.unwrap();
    let p = enroll(&state, &snapshot, "late").await.unwrap();

    assert_eq!(p.first_question.unwrap().key, "Q1");
    assert_eq!(current_question(&state, &room.room_code, &p.player_id, &p.token).await.unwrap().unwrap().key, "Q1");
    let out = submit_answer(&state, &room.room_code, &p.player_id, &p.token, submit("Q1", "a", json!({ "text": "q=0.9" })))
      .await
      .unwrap();
    assert_eq!(out.resolution, Resolution::Sat);
  }

  #[tokio::test]
  async fn degree_and_mcq_always_satisfy() {
    let (state, _) = app(vec![degree("D1"), degree("D2"), mcq("M1")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "sc").await.unwrap();
    let d1 = submit_answer(&state, &code, &p.player_id, &p.token, submit("D1", "x", json!({ "value": 1 }))).await.unwrap();
    let d2 = submit_answer(&state, &code, &p.player_id, &p.token, submit("D2", "y", json!({ "value": 5 }))).await.unwrap();
    assert_eq!((d1.resolution, d1.points_earned), (Resolution::Sat, 15));
    assert_eq!((d2.resolution, d2.points_earned), (Resolution::Sat, 15));
    let m = submit_answer(&state, &code, &p.player_id, &p.token, submit("M1", "z", json!({ "optionId": "b" }))).await.unwrap();
    assert_eq!((m.resolution, m.points_earned), (Resolution::Sat, 0));
    assert!(m.done);
  }

  #[tokio::test]
  async fn invalid_payload_leaves_state_untouched() {
    let (state, _) = app(vec![degree("D1")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "bad").await.unwrap();
    let err = submit_answer(&state, &code, &p.player_id, &p.token, submit("D1", "x", json!({ "value": 9 }))).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidPayload(_)));
    assert!(state.attempts.get(&code, &p.player_id, "D1").await.unwrap().is_none());
    // The same attempt id is usable after a rejected payload.
    let ok = submit_answer(&state, &code, &p.player_id, &p.token, submit("D1", "x", json!({ "value": 3 }))).await.unwrap();
    assert_eq!(ok.status, SubmitStatus::Evaluated);
  }

  #[tokio::test]
  async fn skip_closes_follow_up_chain() {
    let (state, _) = app(vec![essay("Q1"), essay("Q2")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "sk").await.unwrap();
    submit_answer(&state, &code, &p.player_id, &p.token, submit("Q1", "a1", json!({ "text": "q=0.1" }))).await.unwrap();
    let out = skip(&state, &code, &p.player_id, &p.token, "Q1.1").await.unwrap();
    assert_eq!(out.next_question.unwrap().key, "Q2");
    assert!(!out.done);
    let attempt = state.attempts.get(&code, &p.player_id, "Q1.1").await.unwrap().unwrap();
    assert_eq!(attempt.resolution, Resolution::Skipped);
  }

  #[tokio::test]
  async fn follow_up_budget_keeps_player_on_question() {
    let (state, _) = app(vec![essay("Q1")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "budget").await.unwrap();
    let a = submit_answer(&state, &code, &p.player_id, &p.token, submit("Q1", "1", json!({ "text": "q=0.1" }))).await.unwrap();
    let b = submit_answer(&state, &code, &p.player_id, &p.token, submit("Q1.1", "2", json!({ "text": "q=0.1" }))).await.unwrap();
    let c = submit_answer(&state, &code, &p.player_id, &p.token, submit("Q1.2", "3", json!({ "text": "q=0.1" }))).await.unwrap();
    assert_eq!(a.follow_up.unwrap().key, "Q1.1");
    assert_eq!(b.follow_up.unwrap().key, "Q1.2");
    assert!(c.follow_up.is_none());
    assert!(!c.done);
    assert_eq!(current_question(&state, &code, &p.player_id, &p.token).await.unwrap().unwrap().key, "Q1.2");
  }

  #[tokio::test]
  async fn lobby_withholds_and_start_releases() {
    let (state, _) = app(vec![essay("Q1")]);
    let room = create_room(&state, "s").await.unwrap();
    let p = join(&state, &room.room_code, "early").await.unwrap();
    assert!(p.first_question.is_none());
    assert!(current_question(&state, &room.room_code, &p.player_id, &p.token).await.unwrap().is_none());
    assert!(matches!(
      start_room(&state, &room.room_code, "wrong").await,
      Err(SessionError::Unauthorized)
    ));
    start_room(&state, &room.room_code, &room.host_token).await.unwrap();
    let cur = current_question(&state, &room.room_code, &p.player_id, &p.token).await.unwrap();
    assert_eq!(cur.unwrap().key, "Q1");
    end_room(&state, &room.room_code, &room.host_token).await.unwrap();
    assert!(matches!(join(&state, &room.room_code, "late").await, Err(SessionError::InvalidState(_))));
  }

  #[tokio::test]
  async fn unknown_question_and_bad_token_are_rejected() {
    let (state, _) = app(vec![essay("Q1")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "x").await.unwrap();
    let err = submit_answer(&state, &code, &p.player_id, &p.token, submit("Q9", "a", json!({ "text": "q=1" }))).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound { .. }));
    let err = submit_answer(&state, &code, &p.player_id, "nope", submit("Q1", "a", json!({ "text": "q=1" }))).await.unwrap_err();
    assert!(matches!(err, SessionError::Unauthorized));
  }

  #[tokio::test]
  async fn evaluator_failure_degrades_to_local_rubric() {
    let (state, _) = app(vec![essay("Q1")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "fallback").await.unwrap();
    // Not "q=..": the scripted evaluator rejects it and the local rubric grades it.
    let out = submit_answer(&state, &code, &p.player_id, &p.token, submit("Q1", "a", json!({ "text": "ok" }))).await.unwrap();
    assert_eq!(out.resolution, Resolution::Unsat);
    assert!(out.follow_up.is_some());
  }

  #[tokio::test]
  async fn submission_events_reach_host_and_player() {
    let (state, _) = app(vec![degree("D1")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "ev").await.unwrap();
    let (_, mut host) = state.hub.register(&code, None).await;
    let ident = hub::PlayerIdentity { id: p.player_id.clone(), nickname: "ev".into() };
    let (_, mut me) = state.hub.register(&code, Some(ident)).await;
    submit_answer(&state, &code, &p.player_id, &p.token, submit("D1", "a", json!({ "value": 2 }))).await.unwrap();

    let mut host_kinds = Vec::new();
    for _ in 0..3 {
      let env = tokio::time::timeout(Duration::from_secs(2), host.recv()).await.unwrap().unwrap();
      host_kinds.push(env.kind);
    }
    assert_eq!(host_kinds, vec![hub::PLAYER_JOINED, hub::LEADERBOARD_UPDATE, hub::PLAYER_PROGRESS_UPDATE]);
    let first = tokio::time::timeout(Duration::from_secs(2), me.recv()).await.unwrap().unwrap();
    assert_eq!(first.kind, hub::EVALUATION_RESULT);
    let second = tokio::time::timeout(Duration::from_secs(2), me.recv()).await.unwrap().unwrap();
    assert_eq!(second.kind, hub::NEXT_QUESTION);
    assert_eq!(second.payload["done"], true);
  }

  #[tokio::test]
  async fn failed_score_update_reaches_player_as_error() {
    let (state, _) = app(vec![degree("D1")]);
    let (code, _) = live_room(&state).await;
    let p = join(&state, &code, "unlucky").await.unwrap();
    let ident = hub::PlayerIdentity { id: p.player_id.clone(), nickname: "unlucky".into() };
    let (_, mut me) = state.hub.register(&code, Some(ident)).await;
    // Unreadable score board: the answer still counts, the points do not land.
    state.cache.set(&crate::cache::scores_key(&code), &"not a board").await.unwrap();

    let out = submit_answer(&state, &code, &p.player_id, &p.token, submit("D1", "a", json!({ "value": 3 }))).await.unwrap();
    assert_eq!(out.resolution, Resolution::Sat);
    let env = tokio::time::timeout(Duration::from_secs(2), me.recv()).await.unwrap().unwrap();
    assert_eq!(env.kind, hub::ERROR);
    assert_eq!(env.payload["questionKey"], "D1");
    let next = tokio::time::timeout(Duration::from_secs(2), me.recv()).await.unwrap().unwrap();
    assert_eq!(next.kind, hub::EVALUATION_RESULT);
  }
}
