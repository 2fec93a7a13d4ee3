//! In-memory key-value cache with per-key expiration.
//!
//! Values are stored as JSON so the stores above it behave as they would on
//! an external cache: every read hands out an owned copy and every write is a
//! whole-value overwrite. `update` is the only read-modify-write primitive and
//! runs under the write lock, which makes it atomic for its single key.

use std::{
  collections::HashMap,
  time::{Duration, Instant},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::error::{SessionError, SessionResult};

struct Entry {
  value: Value,
  expires_at: Instant,
}

pub struct KvCache {
  entries: RwLock<HashMap<String, Entry>>,
  default_ttl: Duration,
}

impl KvCache {
  pub fn new(default_ttl: Duration) -> Self {
    Self { entries: RwLock::new(HashMap::new()), default_ttl }
  }

  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> SessionResult<Option<T>> {
    let entries = self.entries.read().await;
    match entries.get(key) {
      Some(e) if e.expires_at > Instant::now() => decode(key, e.value.clone()).map(Some),
      _ => Ok(None),
    }
  }

  pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> SessionResult<()> {
    self.set_with_ttl(key, value, self.default_ttl).await
  }

  pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> SessionResult<()> {
    let value = encode(key, value)?;
    let mut entries = self.entries.write().await;
    entries.insert(key.to_string(), Entry { value, expires_at: Instant::now() + ttl });
    Ok(())
  }

  /// Atomic read-modify-write of one key.
  ///
  /// `f` sees the current value (`None` when absent or expired). If it returns
  /// `Ok`, the value left in the slot is written back with a refreshed TTL
  /// (`None` deletes the key). If it returns `Err`, nothing is written.
  pub async fn update<T, R, F>(&self, key: &str, f: F) -> SessionResult<R>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut Option<T>) -> SessionResult<R>,
  {
    self.update_with_ttl(key, self.default_ttl, f).await
  }

  /// `update` with an explicit TTL for the written value.
  pub async fn update_with_ttl<T, R, F>(&self, key: &str, ttl: Duration, f: F) -> SessionResult<R>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut Option<T>) -> SessionResult<R>,
  {
    let mut entries = self.entries.write().await;
    let now = Instant::now();
    let mut slot: Option<T> = match entries.get(key) {
      Some(e) if e.expires_at > now => Some(decode(key, e.value.clone())?),
      _ => None,
    };
    let out = f(&mut slot)?;
    match slot {
      Some(v) => {
        let value = encode(key, &v)?;
        entries.insert(key.to_string(), Entry { value, expires_at: now + ttl });
      }
      None => {
        entries.remove(key);
      }
    }
    Ok(out)
  }

  pub async fn delete(&self, key: &str) {
    self.entries.write().await.remove(key);
  }

  /// Drop expired entries; returns how many were removed.
  #[instrument(level = "debug", skip(self))]
  pub async fn purge_expired(&self) -> usize {
    let mut entries = self.entries.write().await;
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, e| e.expires_at > now);
    let removed = before - entries.len();
    if removed > 0 {
      debug!(target: "survey_live", removed, "Purged expired cache entries");
    }
    removed
  }
}

fn encode<T: Serialize>(key: &str, value: &T) -> SessionResult<Value> {
  serde_json::to_value(value).map_err(|e| SessionError::Store(format!("encode {}: {}", key, e)))
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> SessionResult<T> {
  serde_json::from_value(value).map_err(|e| SessionError::Store(format!("decode {}: {}", key, e)))
}

// Key layout. Everything belonging to a room shares the room's lifetime.

pub fn room_key(room: &str) -> String { format!("room:{}", room) }
pub fn roster_key(room: &str) -> String { format!("room:{}:players", room) }
pub fn queue_key(room: &str, player: &str) -> String { format!("queue:{}:{}", room, player) }
pub fn attempt_key(room: &str, player: &str, question: &str) -> String { format!("attempt:{}:{}:{}", room, player, question) }
pub fn pool_key(room: &str, base: &str, bucket: &str) -> String { format!("pool:{}:{}:{}", room, base, bucket) }
pub fn scores_key(room: &str) -> String { format!("scores:{}", room) }
pub fn room_analytics_key(room: &str) -> String { format!("analytics:{}", room) }
pub fn question_analytics_key(room: &str, question: &str) -> String { format!("analytics:{}:{}", room, question) }

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn expired_entries_are_invisible_and_purged() {
    let cache = KvCache::new(Duration::from_secs(60));
    cache.set_with_ttl("a", &1u32, Duration::from_millis(0)).await.unwrap();
    cache.set("b", &2u32).await.unwrap();
    assert_eq!(cache.get::<u32>("a").await.unwrap(), None);
    assert_eq!(cache.get::<u32>("b").await.unwrap(), Some(2));
    assert_eq!(cache.purge_expired().await, 1);
  }

  #[tokio::test]
  async fn failed_update_leaves_value_untouched() {
    let cache = KvCache::new(Duration::from_secs(60));
    cache.set("k", &vec![1u32]).await.unwrap();
    let res: SessionResult<()> = cache
      .update::<Vec<u32>, _, _>("k", |v| {
        if let Some(v) = v { v.push(2); }
        Err(SessionError::Consistency("boom".into()))
      })
      .await;
    assert!(res.is_err());
    assert_eq!(cache.get::<Vec<u32>>("k").await.unwrap(), Some(vec![1]));
  }

  #[tokio::test]
  async fn concurrent_updates_do_not_lose_writes() {
    let cache = std::sync::Arc::new(KvCache::new(Duration::from_secs(60)));
    let mut handles = Vec::new();
    for _ in 0..50 {
      let c = cache.clone();
      handles.push(tokio::spawn(async move {
        c.update::<u32, _, _>("n", |v| { *v = Some(v.unwrap_or(0) + 1); Ok(()) }).await
      }));
    }
    for h in handles { h.await.unwrap().unwrap(); }
    assert_eq!(cache.get::<u32>("n").await.unwrap(), Some(50));
  }

  #[tokio::test]
  async fn short_lived_update_expires_on_its_own() {
    let cache = KvCache::new(Duration::from_secs(60));
    let claimed = cache
      .update_with_ttl::<bool, _, _>("claim", Duration::from_millis(20), |slot| {
        Ok(slot.replace(true).is_none())
      })
      .await
      .unwrap();
    assert!(claimed);
    assert_eq!(cache.get::<bool>("claim").await.unwrap(), Some(true));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get::<bool>("claim").await.unwrap(), None);
  }
}
