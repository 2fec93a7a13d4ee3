//! Room metadata and player roster, kept in the cache under the room's lifetime.

use std::{collections::HashMap, sync::Arc};

use rand::Rng;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::cache::{room_key, roster_key, KvCache};
use crate::domain::{Player, Room, RoomStatus};
use crate::error::{SessionError, SessionResult};
use crate::util::now_millis;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;
const MAX_NICKNAME_CHARS: usize = 32;

#[derive(Clone)]
pub struct RoomStore {
  cache: Arc<KvCache>,
}

impl RoomStore {
  pub fn new(cache: Arc<KvCache>) -> Self {
    Self { cache }
  }

  /// Create a lobby room for a survey with a fresh code and host token.
  #[instrument(level = "info", skip(self))]
  pub async fn create(&self, survey_id: &str) -> SessionResult<Room> {
    loop {
      let code = random_code();
      let room = Room {
        code: code.clone(),
        survey_id: survey_id.to_string(),
        status: RoomStatus::Lobby,
        host_token: Uuid::new_v4().to_string(),
        created_at: now_millis(),
      };
      // Claim the code atomically; retry on the (rare) collision.
      let claimed = self
        .cache
        .update::<Room, _, _>(&room_key(&code), |slot| {
          if slot.is_some() {
            return Ok(false);
          }
          *slot = Some(room.clone());
          Ok(true)
        })
        .await?;
      if claimed {
        self.cache.set(&roster_key(&code), &HashMap::<String, Player>::new()).await?;
        info!(target: "survey_live", room = %code, %survey_id, "Room created");
        return Ok(room);
      }
    }
  }

  pub async fn get(&self, code: &str) -> SessionResult<Room> {
    self
      .cache
      .get::<Room>(&room_key(code))
      .await?
      .ok_or_else(|| SessionError::not_found("room", code))
  }

  pub async fn authorize_host(&self, code: &str, token: &str) -> SessionResult<Room> {
    let room = self.get(code).await?;
    if room.host_token != token {
      return Err(SessionError::Unauthorized);
    }
    Ok(room)
  }

  /// Move the room to `next`. Allowed: lobby → active, lobby/active → ended.
  #[instrument(level = "info", skip(self))]
  pub async fn transition(&self, code: &str, next: RoomStatus) -> SessionResult<Room> {
    self
      .cache
      .update::<Room, _, _>(&room_key(code), |slot| {
        let room = slot.as_mut().ok_or_else(|| SessionError::not_found("room", code))?;
        let allowed = matches!(
          (room.status, next),
          (RoomStatus::Lobby, RoomStatus::Active)
            | (RoomStatus::Lobby, RoomStatus::Ended)
            | (RoomStatus::Active, RoomStatus::Ended)
        );
        if !allowed {
          return Err(SessionError::InvalidState(format!("{:?} -> {:?}", room.status, next)));
        }
        room.status = next;
        Ok(room.clone())
      })
      .await
  }

  /// Register a player in the roster and issue its session token.
  #[instrument(level = "info", skip(self))]
  pub async fn add_player(&self, code: &str, nickname: &str) -> SessionResult<Player> {
    let nickname = nickname.trim();
    if nickname.is_empty() || nickname.chars().count() > MAX_NICKNAME_CHARS {
      return Err(SessionError::InvalidPayload(format!(
        "nickname must be 1..={} characters",
        MAX_NICKNAME_CHARS
      )));
    }
    let player = Player {
      id: Uuid::new_v4().to_string(),
      nickname: nickname.to_string(),
      token: Uuid::new_v4().to_string(),
      joined_at: now_millis(),
    };
    self
      .cache
      .update::<HashMap<String, Player>, _, _>(&roster_key(code), |slot| {
        let roster = slot.as_mut().ok_or_else(|| SessionError::not_found("room", code))?;
        roster.insert(player.id.clone(), player.clone());
        Ok(())
      })
      .await?;
    Ok(player)
  }

  pub async fn players(&self, code: &str) -> SessionResult<Vec<Player>> {
    let roster = self
      .cache
      .get::<HashMap<String, Player>>(&roster_key(code))
      .await?
      .ok_or_else(|| SessionError::not_found("room", code))?;
    let mut players: Vec<Player> = roster.into_values().collect();
    players.sort_by_key(|p| p.joined_at);
    Ok(players)
  }

  pub async fn get_player(&self, code: &str, player_id: &str) -> SessionResult<Player> {
    self
      .cache
      .get::<HashMap<String, Player>>(&roster_key(code))
      .await?
      .ok_or_else(|| SessionError::not_found("room", code))?
      .remove(player_id)
      .ok_or_else(|| SessionError::not_found("player", player_id))
  }

  /// Resolve a player and check its token.
  pub async fn authorize_player(&self, code: &str, player_id: &str, token: &str) -> SessionResult<Player> {
    let player = self.get_player(code, player_id).await?;
    if player.token != token {
      return Err(SessionError::Unauthorized);
    }
    Ok(player)
  }
}

fn random_code() -> String {
  let mut rng = rand::thread_rng();
  (0..CODE_LEN)
    .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn store() -> RoomStore {
    RoomStore::new(Arc::new(KvCache::new(Duration::from_secs(60))))
  }

  #[tokio::test]
  async fn lifecycle_rejects_backwards_transitions() {
    let rooms = store();
    let room = rooms.create("s1").await.unwrap();
    assert_eq!(room.code.len(), CODE_LEN);
    rooms.transition(&room.code, RoomStatus::Active).await.unwrap();
    let err = rooms.transition(&room.code, RoomStatus::Lobby).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(_)));
    rooms.transition(&room.code, RoomStatus::Ended).await.unwrap();
    assert_eq!(rooms.get(&room.code).await.unwrap().status, RoomStatus::Ended);
  }

  #[tokio::test]
  async fn tokens_are_checked() {
    let rooms = store();
    let room = rooms.create("s1").await.unwrap();
    let p = rooms.add_player(&room.code, "  ada ").await.unwrap();
    assert_eq!(p.nickname, "ada");
    assert!(rooms.authorize_player(&room.code, &p.id, &p.token).await.is_ok());
    assert!(matches!(
      rooms.authorize_player(&room.code, &p.id, "nope").await,
      Err(SessionError::Unauthorized)
    ));
    assert!(matches!(rooms.authorize_host(&room.code, "nope").await, Err(SessionError::Unauthorized)));
    assert!(matches!(rooms.add_player("ZZZZZZ", "x").await, Err(SessionError::NotFound { .. })));
  }
}
