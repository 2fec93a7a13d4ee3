//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and front-ends independently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Question, Resolution};
use crate::scores::RankEntry;

/// Messages a player can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerWsMessage {
    Ping,
    CurrentQuestion,
    SubmitAnswer {
        #[serde(rename = "questionKey")]
        question_key: String,
        #[serde(rename = "clientAttemptId")]
        client_attempt_id: String,
        payload: Value,
    },
    Skip {
        #[serde(rename = "questionKey")]
        question_key: String,
    },
    SaveDraft {
        #[serde(rename = "questionKey")]
        question_key: String,
        text: String,
    },
}

/// Direct replies to a player's own WebSocket request. Pushed state changes
/// travel separately as hub envelopes.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerWsReply {
    Pong,
    CurrentQuestion { question: Option<Question> },
    SubmitResult { result: SubmitOut },
    SkipResult { result: SkipOut },
    DraftSaved {
        #[serde(rename = "questionKey")]
        question_key: String,
    },
    Error { message: String },
}

//
// HTTP request/response DTOs
//

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomIn {
    pub survey_id: String,
}
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomOut {
    pub room_code: String,
    pub host_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStateOut {
    pub room_code: String,
    pub status: crate::domain::RoomStatus,
    pub players: usize,
}

#[derive(Debug, Deserialize)]
pub struct JoinIn {
    pub nickname: String,
}
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOut {
    pub player_id: String,
    pub token: String,
    pub first_question: Option<Question>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitIn {
    pub question_key: String,
    pub client_attempt_id: String,
    pub payload: Value,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Evaluated,
    AlreadyProcessed,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOut {
    pub status: SubmitStatus,
    pub resolution: Resolution,
    pub points_earned: u32,
    pub next_question: Option<Question>,
    pub follow_up: Option<Question>,
    /// True when the player has nothing left to answer.
    pub done: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipIn {
    pub question_key: String,
}
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipOut {
    pub next_question: Option<Question>,
    pub done: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftIn {
    pub question_key: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsIn {
    /// Omit for room-wide context.
    #[serde(default)]
    pub question_key: Option<String>,
    pub summary: String,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardOut {
    pub entries: Vec<RankEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub evaluator: &'static str,
}

#[derive(Serialize)]
pub struct ErrorOut {
    pub error: String,
}
