//! Broadcast hub: one coordinator task owns every connection registry.
//!
//! All registry mutation and dispatch goes through three channels
//! (register, unregister, broadcast) drained by a single `select!` loop, so no
//! locks guard the maps. Each connection has a bounded outbound buffer; a full
//! buffer drops the newest message for that connection and the loop moves on.
//! Delivery is at-most-once and best-effort.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Typed message pushed to hosts and players.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self { kind: kind.to_string(), payload }
    }
}

// Host-bound message types.
pub const PLAYER_JOINED: &str = "player_joined";
pub const PLAYER_LEFT: &str = "player_left";
pub const LEADERBOARD_UPDATE: &str = "leaderboard_update";
pub const PLAYER_PROGRESS_UPDATE: &str = "player_progress_update";
// Player-bound message types.
pub const NEXT_QUESTION: &str = "next_question";
pub const EVALUATION_RESULT: &str = "evaluation_result";
pub const ERROR: &str = "error";
pub const ROOM_ENDED: &str = "room_ended";

/// Who a connection belongs to. `None` player means the room's host.
#[derive(Clone, Debug)]
pub struct PlayerIdentity {
    pub id: String,
    pub nickname: String,
}

struct Registration {
    id: ConnectionId,
    room: String,
    player: Option<PlayerIdentity>,
    tx: mpsc::Sender<Envelope>,
}

#[derive(Clone, Debug)]
enum Target {
    Host,
    Player(String),
    AllPlayers,
}

struct Broadcast {
    room: String,
    target: Target,
    envelope: Envelope,
}

struct Conn {
    id: ConnectionId,
    tx: mpsc::Sender<Envelope>,
}

/// Cloneable handle. Every method only enqueues onto the coordinator.
#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ConnectionId>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    outbound_buffer: usize,
}

impl Hub {
    /// Start the coordinator. It stops once every handle is dropped.
    pub fn spawn(outbound_buffer: usize, broadcast_inbox: usize) -> Self {
        let (register_tx, register_rx) = mpsc::channel(64);
        let (unregister_tx, unregister_rx) = mpsc::channel(64);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(broadcast_inbox.max(1));
        tokio::spawn(run(register_rx, unregister_rx, broadcast_rx));
        Self { register_tx, unregister_tx, broadcast_tx, outbound_buffer: outbound_buffer.max(1) }
    }

    /// Register a connection; the receiver is the connection's outbound buffer.
    pub async fn register(&self, room: &str, player: Option<PlayerIdentity>) -> (ConnectionId, mpsc::Receiver<Envelope>) {
        self.register_with_buffer(room, player, self.outbound_buffer).await
    }

    pub async fn register_with_buffer(
        &self,
        room: &str,
        player: Option<PlayerIdentity>,
        buffer: usize,
    ) -> (ConnectionId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = Uuid::new_v4();
        let reg = Registration { id, room: room.to_string(), player, tx };
        if self.register_tx.send(reg).await.is_err() {
            warn!(target: "survey_live", %room, "Hub is gone; connection not registered");
        }
        (id, rx)
    }

    /// Remove a connection. Unknown or already replaced ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.unregister_tx.send(id).await;
    }

    pub fn broadcast_to_host(&self, room: &str, envelope: Envelope) {
        self.enqueue(room, Target::Host, envelope);
    }

    pub fn broadcast_to_player(&self, room: &str, player: &str, envelope: Envelope) {
        self.enqueue(room, Target::Player(player.to_string()), envelope);
    }

    pub fn broadcast_to_all_players(&self, room: &str, envelope: Envelope) {
        self.enqueue(room, Target::AllPlayers, envelope);
    }

    fn enqueue(&self, room: &str, target: Target, envelope: Envelope) {
        let kind = envelope.kind.clone();
        let msg = Broadcast { room: room.to_string(), target, envelope };
        if let Err(e) = self.broadcast_tx.try_send(msg) {
            let reason = match e {
                TrySendError::Full(_) => "inbox full",
                TrySendError::Closed(_) => "hub stopped",
            };
            warn!(target: "survey_live", %room, %kind, reason, "Broadcast dropped");
        }
    }
}

#[derive(Default)]
struct Registry {
    hosts: HashMap<String, Conn>,
    players: HashMap<String, HashMap<String, Conn>>,
    // connection id -> (room, player id); the reverse index for unregister.
    index: HashMap<ConnectionId, (String, Option<PlayerIdentity>)>,
}

#[instrument(level = "info", skip_all)]
async fn run(
    mut register_rx: mpsc::Receiver<Registration>,
    mut unregister_rx: mpsc::Receiver<ConnectionId>,
    mut broadcast_rx: mpsc::Receiver<Broadcast>,
) {
    info!(target: "survey_live", "Broadcast hub started");
    let mut reg = Registry::default();
    loop {
        tokio::select! {
            biased;
            Some(r) = register_rx.recv() => reg.register(r),
            Some(id) = unregister_rx.recv() => reg.unregister(id),
            Some(b) = broadcast_rx.recv() => reg.dispatch(b),
            else => break,
        }
    }
    info!(target: "survey_live", "Broadcast hub stopped");
}

impl Registry {
    fn register(&mut self, r: Registration) {
        let Registration { id, room, player, tx } = r;
        match &player {
            None => {
                if let Some(old) = self.hosts.insert(room.clone(), Conn { id, tx }) {
                    self.index.remove(&old.id);
                    info!(target: "survey_live", %room, "Host connection replaced");
                }
            }
            Some(p) => {
                let room_players = self.players.entry(room.clone()).or_default();
                if let Some(old) = room_players.insert(p.id.clone(), Conn { id, tx }) {
                    self.index.remove(&old.id);
                    debug!(target: "survey_live", %room, player = %p.id, "Player connection replaced");
                }
                let env = Envelope::new(PLAYER_JOINED, json!({ "playerId": p.id, "nickname": p.nickname }));
                if let Some(host) = self.hosts.get(&room) {
                    deliver(host, env);
                }
            }
        }
        self.index.insert(id, (room, player));
    }

    fn unregister(&mut self, id: ConnectionId) {
        let Some((room, player)) = self.index.remove(&id) else {
            return;
        };
        match player {
            None => {
                if self.hosts.get(&room).map(|c| c.id) == Some(id) {
                    self.hosts.remove(&room);
                }
            }
            Some(p) => {
                if let Some(room_players) = self.players.get_mut(&room) {
                    if room_players.get(&p.id).map(|c| c.id) == Some(id) {
                        room_players.remove(&p.id);
                    }
                    if room_players.is_empty() {
                        self.players.remove(&room);
                    }
                }
                let env = Envelope::new(PLAYER_LEFT, json!({ "playerId": p.id, "nickname": p.nickname }));
                if let Some(host) = self.hosts.get(&room) {
                    deliver(host, env);
                }
            }
        }
    }

    fn dispatch(&mut self, b: Broadcast) {
        match b.target {
            Target::Host => {
                if let Some(host) = self.hosts.get(&b.room) {
                    deliver(host, b.envelope);
                }
            }
            Target::Player(player) => {
                if let Some(conn) = self.players.get(&b.room).and_then(|m| m.get(&player)) {
                    deliver(conn, b.envelope);
                }
            }
            Target::AllPlayers => {
                if let Some(room_players) = self.players.get(&b.room) {
                    for conn in room_players.values() {
                        deliver(conn, b.envelope.clone());
                    }
                }
            }
        }
    }
}

/// Never blocks: a full buffer drops this (newest) message.
fn deliver(conn: &Conn, env: Envelope) {
    match conn.tx.try_send(env) {
        Ok(()) => {}
        Err(TrySendError::Full(env)) => {
            debug!(target: "survey_live", conn = %conn.id, kind = %env.kind, "Outbound buffer full; message dropped");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(target: "survey_live", conn = %conn.id, "Connection gone; message dropped");
        }
    }
}
