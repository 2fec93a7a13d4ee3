//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented; credentials travel as `Authorization: Bearer <token>`.

use std::sync::Arc;
use axum::{
  extract::{Path, State},
  http::{header::AUTHORIZATION, HeaderMap, StatusCode},
  response::{IntoResponse, Response},
  Json,
};
use tracing::{info, instrument, warn};

use crate::error::SessionError;
use crate::logic::*;
use crate::protocol::*;
use crate::state::AppState;

impl IntoResponse for SessionError {
  fn into_response(self) -> Response {
    let status = match &self {
      SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
      SessionError::Unauthorized => StatusCode::UNAUTHORIZED,
      SessionError::InvalidState(_) => StatusCode::CONFLICT,
      SessionError::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
      SessionError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
      SessionError::Consistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
      warn!(target: "survey_live", error = %self, "Request failed");
    }
    (status, Json(ErrorOut { error: self.to_string() })).into_response()
  }
}

type ApiResult<T> = Result<Json<T>, SessionError>;

fn bearer(headers: &HeaderMap) -> Result<String, SessionError> {
  headers
    .get(AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
    .map(|t| t.trim().to_string())
    .filter(|t| !t.is_empty())
    .ok_or(SessionError::Unauthorized)
}

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, evaluator: state.evaluators.primary_name() })
}

#[instrument(level = "info", skip(state, body), fields(survey = %body.survey_id))]
pub async fn http_create_room(
  State(state): State<Arc<AppState>>,
  Json(body): Json<CreateRoomIn>,
) -> ApiResult<CreateRoomOut> {
  let out = create_room(&state, &body.survey_id).await?;
  info!(target: "survey_live", room = %out.room_code, "HTTP room created");
  Ok(Json(out))
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_start_room(
  State(state): State<Arc<AppState>>,
  Path(code): Path<String>,
  headers: HeaderMap,
) -> ApiResult<RoomStateOut> {
  let room = start_room(&state, &code, &bearer(&headers)?).await?;
  let players = state.rooms.players(&code).await?.len();
  Ok(Json(RoomStateOut { room_code: room.code, status: room.status, players }))
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_end_room(
  State(state): State<Arc<AppState>>,
  Path(code): Path<String>,
  headers: HeaderMap,
) -> ApiResult<RoomStateOut> {
  let room = end_room(&state, &code, &bearer(&headers)?).await?;
  let players = state.rooms.players(&code).await?.len();
  Ok(Json(RoomStateOut { room_code: room.code, status: room.status, players }))
}

#[instrument(level = "info", skip(state))]
pub async fn http_leaderboard(
  State(state): State<Arc<AppState>>,
  Path(code): Path<String>,
) -> ApiResult<LeaderboardOut> {
  Ok(Json(LeaderboardOut { entries: leaderboard(&state, &code).await? }))
}

#[instrument(level = "info", skip(state, headers, body), fields(question = ?body.question_key))]
pub async fn http_put_analytics(
  State(state): State<Arc<AppState>>,
  Path(code): Path<String>,
  headers: HeaderMap,
  Json(body): Json<AnalyticsIn>,
) -> Result<StatusCode, SessionError> {
  put_analytics(&state, &code, &bearer(&headers)?, body.question_key.as_deref(), &body.summary).await?;
  Ok(StatusCode::NO_CONTENT)
}

#[instrument(level = "info", skip(state, body))]
pub async fn http_join(
  State(state): State<Arc<AppState>>,
  Path(code): Path<String>,
  Json(body): Json<JoinIn>,
) -> ApiResult<JoinOut> {
  Ok(Json(join(&state, &code, &body.nickname).await?))
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_current(
  State(state): State<Arc<AppState>>,
  Path((code, player_id)): Path<(String, String)>,
  headers: HeaderMap,
) -> ApiResult<Option<crate::domain::Question>> {
  Ok(Json(current_question(&state, &code, &player_id, &bearer(&headers)?).await?))
}

#[instrument(level = "info", skip(state, headers, body), fields(question = %body.question_key, attempt = %body.client_attempt_id))]
pub async fn http_submit_answer(
  State(state): State<Arc<AppState>>,
  Path((code, player_id)): Path<(String, String)>,
  headers: HeaderMap,
  Json(body): Json<SubmitIn>,
) -> ApiResult<SubmitOut> {
  let out = submit_answer(&state, &code, &player_id, &bearer(&headers)?, body).await?;
  info!(target: "session", room = %code, player = %player_id, status = ?out.status, resolution = ?out.resolution, points = out.points_earned, "HTTP answer processed");
  Ok(Json(out))
}

#[instrument(level = "info", skip(state, headers, body), fields(question = %body.question_key))]
pub async fn http_skip(
  State(state): State<Arc<AppState>>,
  Path((code, player_id)): Path<(String, String)>,
  headers: HeaderMap,
  Json(body): Json<SkipIn>,
) -> ApiResult<SkipOut> {
  Ok(Json(skip(&state, &code, &player_id, &bearer(&headers)?, &body.question_key).await?))
}

#[instrument(level = "debug", skip(state, headers, body), fields(question = %body.question_key, text_len = body.text.len()))]
pub async fn http_save_draft(
  State(state): State<Arc<AppState>>,
  Path((code, player_id)): Path<(String, String)>,
  headers: HeaderMap,
  Json(body): Json<DraftIn>,
) -> Result<StatusCode, SessionError> {
  save_draft(&state, &code, &player_id, &bearer(&headers)?, &body.question_key, &body.text).await?;
  Ok(StatusCode::NO_CONTENT)
}
