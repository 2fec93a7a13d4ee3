//! WebSocket upgrades and the per-connection loop.
//!
//! Each socket registers with the hub and then multiplexes three sources:
//! client frames, hub envelopes from its outbound buffer, and a keepalive tick.
//! Player sockets can also drive the session (submit, skip, drafts); every such
//! request gets exactly one direct reply.

use std::{sync::Arc, time::{Duration, Instant}};
use axum::{
  extract::{
    ws::{Message, WebSocket},
    Path, Query, State, WebSocketUpgrade,
  },
  response::{IntoResponse, Response},
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::hub::{ConnectionId, Envelope, PlayerIdentity};
use crate::logic::*;
use crate::protocol::{PlayerWsMessage, PlayerWsReply, SubmitIn, TokenQuery};
use crate::state::AppState;

/// Authenticated owner of a socket.
#[derive(Clone, Debug)]
enum Peer {
  Host,
  Player { id: String, token: String },
}

#[instrument(level = "info", skip(ws, state, q))]
pub async fn host_ws_upgrade(
  ws: WebSocketUpgrade,
  Path(code): Path<String>,
  Query(q): Query<TokenQuery>,
  State(state): State<Arc<AppState>>,
) -> Response {
  if let Err(e) = state.rooms.authorize_host(&code, &q.token).await {
    return e.into_response();
  }
  info!(target: "survey_live", room = %code, "Host WebSocket upgrade");
  ws.on_upgrade(move |socket| async move {
    let (conn, rx) = state.hub.register(&code, None).await;
    run_socket(socket, state, code, Peer::Host, conn, rx).await
  })
}

#[instrument(level = "info", skip(ws, state, q))]
pub async fn player_ws_upgrade(
  ws: WebSocketUpgrade,
  Path((code, player_id)): Path<(String, String)>,
  Query(q): Query<TokenQuery>,
  State(state): State<Arc<AppState>>,
) -> Response {
  let player = match state.rooms.authorize_player(&code, &player_id, &q.token).await {
    Ok(p) => p,
    Err(e) => return e.into_response(),
  };
  info!(target: "survey_live", room = %code, player = %player.id, "Player WebSocket upgrade");
  ws.on_upgrade(move |socket| async move {
    let identity = PlayerIdentity { id: player.id.clone(), nickname: player.nickname.clone() };
    let (conn, rx) = state.hub.register(&code, Some(identity)).await;
    let peer = Peer::Player { id: player.id, token: q.token };
    run_socket(socket, state, code, peer, conn, rx).await
  })
}

#[instrument(level = "info", skip(socket, state, peer, rx))]
async fn run_socket(
  mut socket: WebSocket,
  state: Arc<AppState>,
  code: String,
  peer: Peer,
  conn: ConnectionId,
  mut rx: mpsc::Receiver<Envelope>,
) {
  let keepalive = Duration::from_secs(state.settings.keepalive_interval_secs.max(1));
  let pong_timeout = Duration::from_secs(state.settings.pong_timeout_secs.max(1));
  let mut ticker = tokio::time::interval(keepalive);
  ticker.tick().await;
  let mut last_seen = Instant::now();
  // Requests run off the loop; their replies come back here.
  let (reply_tx, mut reply_rx) = mpsc::channel::<PlayerWsReply>(REPLY_BUFFER);

  // A reconnecting player picks up where they left off.
  if let Peer::Player { id, token } = &peer {
    let reply = match current_question(&state, &code, id, token).await {
      Ok(question) => PlayerWsReply::CurrentQuestion { question },
      Err(e) => PlayerWsReply::Error { message: e.to_string() },
    };
    if send_json(&mut socket, &reply).await.is_err() {
      state.hub.unregister(conn).await;
      return;
    }
  }

  loop {
    tokio::select! {
      frame = socket.recv() => {
        let msg = match frame {
          Some(Ok(m)) => m,
          Some(Err(e)) => {
            debug!(target: "survey_live", error = %e, "WS receive error");
            break;
          }
          None => break,
        };
        last_seen = Instant::now();
        match msg {
          Message::Text(txt) => {
            let Peer::Player { id, token } = &peer else {
              debug!(target: "survey_live", room = %code, "Ignoring host text frame");
              continue;
            };
            match serde_json::from_str::<PlayerWsMessage>(&txt) {
              Ok(incoming) => {
                debug!(target: "session", room = %code, player = %id, "WS received: {:?}", &incoming);
                spawn_request(state.clone(), code.clone(), id.clone(), token.clone(), incoming, reply_tx.clone());
              }
              Err(e) => {
                let reply = PlayerWsReply::Error { message: format!("Invalid JSON: {}", e) };
                if send_json(&mut socket, &reply).await.is_err() {
                  break;
                }
              }
            }
          }
          Message::Ping(payload) => {
            if socket.send(Message::Pong(payload)).await.is_err() {
              break;
            }
          }
          Message::Close(_) => break,
          _ => {}
        }
      }
      Some(reply) = reply_rx.recv() => {
        if send_json(&mut socket, &reply).await.is_err() {
          break;
        }
      }
      envelope = rx.recv() => {
        // None means the hub replaced or dropped this connection.
        let Some(envelope) = envelope else { break };
        if send_json(&mut socket, &envelope).await.is_err() {
          break;
        }
      }
      _ = ticker.tick() => {
        match keepalive_step(last_seen, Instant::now(), pong_timeout) {
          Keepalive::Close => {
            warn!(target: "survey_live", room = %code, "WS peer missed keepalive; closing");
            let _ = socket.send(Message::Close(None)).await;
            break;
          }
          Keepalive::Ping => {
            if socket.send(Message::Ping(Vec::new())).await.is_err() {
              break;
            }
          }
        }
      }
    }
  }

  state.hub.unregister(conn).await;
  info!(target: "survey_live", room = %code, peer = ?peer_kind(&peer), "WebSocket disconnected");
}

const REPLY_BUFFER: usize = 16;

#[derive(Debug, PartialEq, Eq)]
enum Keepalive {
  Ping,
  Close,
}

/// Any frame from the peer counts as a sign of life.
fn keepalive_step(last_seen: Instant, now: Instant, pong_timeout: Duration) -> Keepalive {
  if now.saturating_duration_since(last_seen) > pong_timeout {
    Keepalive::Close
  } else {
    Keepalive::Ping
  }
}

/// Handle one player request on its own task so a slow evaluation does not
/// stall envelope delivery or keepalives. Replies may overtake each other.
fn spawn_request(
  state: Arc<AppState>,
  code: String,
  player_id: String,
  token: String,
  msg: PlayerWsMessage,
  reply_tx: mpsc::Sender<PlayerWsReply>,
) {
  tokio::spawn(async move {
    let reply = handle_player_message(&state, &code, &player_id, &token, msg).await;
    if reply_tx.send(reply).await.is_err() {
      debug!(target: "survey_live", room = %code, player = %player_id, "Socket closed before reply");
    }
  });
}

fn peer_kind(peer: &Peer) -> &'static str {
  match peer {
    Peer::Host => "host",
    Peer::Player { .. } => "player",
  }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
  let out = serde_json::to_string(value).unwrap_or_else(|e| {
    serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
  });
  socket.send(Message::Text(out)).await.map_err(|e| {
    debug!(target: "survey_live", error = %e, "WS send error");
    e
  })
}

#[instrument(level = "info", skip(state, token, msg))]
async fn handle_player_message(state: &AppState, code: &str, player_id: &str, token: &str, msg: PlayerWsMessage) -> PlayerWsReply {
  let result = match msg {
    PlayerWsMessage::Ping => return PlayerWsReply::Pong,
    PlayerWsMessage::CurrentQuestion => current_question(state, code, player_id, token)
      .await
      .map(|question| PlayerWsReply::CurrentQuestion { question }),
    PlayerWsMessage::SubmitAnswer { question_key, client_attempt_id, payload } => {
      let body = SubmitIn { question_key, client_attempt_id, payload };
      submit_answer(state, code, player_id, token, body)
        .await
        .map(|result| PlayerWsReply::SubmitResult { result })
    }
    PlayerWsMessage::Skip { question_key } => skip(state, code, player_id, token, &question_key)
      .await
      .map(|result| PlayerWsReply::SkipResult { result }),
    PlayerWsMessage::SaveDraft { question_key, text } => save_draft(state, code, player_id, token, &question_key, &text)
      .await
      .map(|_| PlayerWsReply::DraftSaved { question_key }),
  };
  result.unwrap_or_else(|e| PlayerWsReply::Error { message: e.to_string() })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Settings;
  use crate::domain::{Question, Resolution};
  use crate::error::EvaluatorError;
  use crate::evaluator::{Evaluation, Evaluator, FollowUpContext, LocalEvaluator};
  use async_trait::async_trait;
  use serde_json::json;

  /// Takes its time, then accepts everything.
  struct Sluggish;

  #[async_trait]
  impl Evaluator for Sluggish {
    fn name(&self) -> &'static str { "sluggish" }

    async fn evaluate(&self, _q: &Question, _answer: &str) -> Result<Evaluation, EvaluatorError> {
      tokio::time::sleep(Duration::from_millis(300)).await;
      Ok(Evaluation { resolution: Resolution::Sat, quality: 1.0, signals: None, follow_up_hint: None, summary: String::new() })
    }

    async fn generate_follow_up(&self, q: &Question, ctx: &FollowUpContext) -> Result<Question, EvaluatorError> {
      LocalEvaluator.generate_follow_up(q, ctx).await
    }
  }

  async fn active_room() -> (AppState, String, String, String) {
    active_room_with(Arc::new(LocalEvaluator)).await
  }

  async fn active_room_with(evaluator: Arc<dyn Evaluator>) -> (AppState, String, String, String) {
    let settings = Settings { pregenerate_pools: false, ..Settings::default() };
    let state = AppState::with_parts(settings, Vec::new(), evaluator);
    let room = create_room(&state, "demo").await.unwrap();
    start_room(&state, &room.room_code, &room.host_token).await.unwrap();
    let joined = join(&state, &room.room_code, "ws").await.unwrap();
    (state, room.room_code, joined.player_id, joined.token)
  }

  #[tokio::test]
  async fn player_messages_map_to_replies() {
    let (state, code, pid, token) = active_room().await;

    let reply = handle_player_message(&state, &code, &pid, &token, PlayerWsMessage::Ping).await;
    assert!(matches!(reply, PlayerWsReply::Pong));

    let reply = handle_player_message(&state, &code, &pid, &token, PlayerWsMessage::CurrentQuestion).await;
    match reply {
      PlayerWsReply::CurrentQuestion { question } => assert_eq!(question.map(|q| q.key), Some("Q1".to_string())),
      other => panic!("unexpected reply {:?}", other),
    }

    let draft = PlayerWsMessage::SaveDraft { question_key: "Q1".into(), text: "half".into() };
    let reply = handle_player_message(&state, &code, &pid, &token, draft).await;
    assert!(matches!(reply, PlayerWsReply::DraftSaved { .. }));

    let skip = PlayerWsMessage::Skip { question_key: "Q1".into() };
    match handle_player_message(&state, &code, &pid, &token, skip).await {
      PlayerWsReply::SkipResult { result } => assert_eq!(result.next_question.map(|q| q.key), Some("Q2".to_string())),
      other => panic!("unexpected reply {:?}", other),
    }
  }

  #[tokio::test]
  async fn errors_become_error_replies() {
    let (state, code, pid, _) = active_room().await;
    let submit = PlayerWsMessage::SubmitAnswer {
      question_key: "Q1".into(),
      client_attempt_id: "a".into(),
      payload: json!({ "text": "hello" }),
    };
    match handle_player_message(&state, &code, &pid, "wrong", submit).await {
      PlayerWsReply::Error { message } => assert_eq!(message, "unauthorized"),
      other => panic!("unexpected reply {:?}", other),
    }
  }

  #[test]
  fn wire_messages_parse() {
    let raw = r#"{"type":"submit_answer","questionKey":"Q1","clientAttemptId":"c1","payload":{"text":"x"}}"#;
    let msg: PlayerWsMessage = serde_json::from_str(raw).unwrap();
    assert!(matches!(msg, PlayerWsMessage::SubmitAnswer { ref question_key, .. } if question_key == "Q1"));
    let out = serde_json::to_value(PlayerWsReply::DraftSaved { question_key: "Q1".into() }).unwrap();
    assert_eq!(out, json!({ "type": "draft_saved", "questionKey": "Q1" }));
  }

  #[tokio::test]
  async fn slow_request_does_not_hold_up_later_ones() {
    let (state, code, pid, token) = active_room_with(Arc::new(Sluggish)).await;
    let state = Arc::new(state);
    let (tx, mut replies) = mpsc::channel(REPLY_BUFFER);
    let submit = PlayerWsMessage::SubmitAnswer {
      question_key: "Q1".into(),
      client_attempt_id: "slow".into(),
      payload: json!({ "text": "a thoughtful answer" }),
    };
    spawn_request(state.clone(), code.clone(), pid.clone(), token.clone(), submit, tx.clone());
    spawn_request(state.clone(), code.clone(), pid.clone(), token.clone(), PlayerWsMessage::Ping, tx);

    let first = tokio::time::timeout(Duration::from_millis(200), replies.recv()).await.unwrap().unwrap();
    assert!(matches!(first, PlayerWsReply::Pong));
    let second = tokio::time::timeout(Duration::from_secs(2), replies.recv()).await.unwrap().unwrap();
    match second {
      PlayerWsReply::SubmitResult { result } => assert_eq!(result.resolution, Resolution::Sat),
      other => panic!("unexpected reply {:?}", other),
    }
  }

  #[test]
  fn keepalive_closes_only_after_silence() {
    let timeout = Duration::from_secs(45);
    let seen = Instant::now();
    assert_eq!(keepalive_step(seen, seen + Duration::from_secs(20), timeout), Keepalive::Ping);
    assert_eq!(keepalive_step(seen, seen + Duration::from_secs(45), timeout), Keepalive::Ping);
    assert_eq!(keepalive_step(seen, seen + Duration::from_secs(46), timeout), Keepalive::Close);
    // A clock reading from before the last frame never closes.
    assert_eq!(keepalive_step(seen + Duration::from_secs(5), seen, timeout), Keepalive::Ping);
  }
}
