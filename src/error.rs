//! Error taxonomy for session operations.
//!
//! Idempotent replays are not errors: they surface as a successful outcome
//! with `SubmitStatus::AlreadyProcessed`. Evaluator failures never reach
//! callers; the pipeline recovers them with the local evaluator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
  /// Room, player or question absent. Terminal for the request.
  #[error("{what} not found: {key}")]
  NotFound { what: &'static str, key: String },

  /// Host or player credential mismatch.
  #[error("unauthorized")]
  Unauthorized,

  /// The room is not in a state that accepts the action.
  #[error("invalid room state: {0}")]
  InvalidState(String),

  #[error("invalid payload: {0}")]
  InvalidPayload(String),

  /// Backing store could not serve the single in-flight request.
  #[error("store unavailable: {0}")]
  Store(String),

  /// Internal invariant violated (e.g. advance exceeded the queue length bound).
  #[error("internal consistency error: {0}")]
  Consistency(String),
}

impl SessionError {
  pub fn not_found(what: &'static str, key: impl Into<String>) -> Self {
    SessionError::NotFound { what, key: key.into() }
  }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Failures of the evaluator collaborator.
#[derive(Debug, Error)]
pub enum EvaluatorError {
  #[error("evaluator unavailable: {0}")]
  Unavailable(String),
  #[error("evaluator timed out after {0} ms")]
  Timeout(u64),
  #[error("evaluator returned a malformed response: {0}")]
  Malformed(String),
}

/// Failures of the durable answer log.
#[derive(Debug, Error)]
pub enum AnswerLogError {
  /// The idempotency tuple already has a record.
  #[error("answer already recorded for this attempt")]
  Duplicate,
}

impl From<AnswerLogError> for SessionError {
  fn from(e: AnswerLogError) -> Self {
    SessionError::Store(e.to_string())
  }
}
