// Domain-level player/room records, intents and snapshot types.

use super::field::Position;
use std::collections::HashMap;

/// Opaque, stable identity handed out by the transport.
pub type PlayerId = String;

/// Room-level lifecycle stage. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Waiting,
    Running,
    Ended,
}

/// Coordinator lifecycle, a superset of [`Phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    Idle,
    Waiting,
    Running,
    Ended,
    Terminated,
}

/// Connection state of a player record; disconnected records are tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected,
    Disconnected { broadcasts_seen: u32 },
}

#[derive(Debug, Clone)]
pub struct PlayerState {
    pub id: PlayerId,
    pub nickname: String,
    pub is_alive: bool,
    pub connection: Connection,
    pub score: i64,
    pub position: Position,
    pub color: String,
}

impl PlayerState {
    pub fn is_connected(&self) -> bool {
        self.connection == Connection::Connected
    }
}

/// Player actions accepted by a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Move(Position),
    Died,
    StartGame,
    EndGame,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSnapshot {
    pub nickname: String,
    pub is_alive: bool,
    pub is_connected: bool,
    pub score: i64,
    pub position: Position,
    pub color: String,
}

impl From<&PlayerState> for PlayerSnapshot {
    fn from(p: &PlayerState) -> Self {
        Self {
            nickname: p.nickname.clone(),
            is_alive: p.is_alive,
            is_connected: p.is_connected(),
            score: p.score,
            position: p.position,
            color: p.color.clone(),
        }
    }
}

/// Full room state published on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub players: HashMap<PlayerId, PlayerSnapshot>,
    pub total_players: usize,
    pub phase: Phase,
}
