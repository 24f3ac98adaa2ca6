// Use-case level messages exchanged between coordinators, the registry and sessions.

use crate::domain::{Intent, Phase, PlayerId, RoomSnapshot};
use std::sync::Arc;

/// Everything a coordinator reacts to besides its ticker, in arrival order.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    PresenceEnter { player_id: PlayerId, nickname: String },
    PresenceLeave { player_id: PlayerId },
    Intent { player_id: PlayerId, intent: Intent },
    /// Re-publish the readiness signal for a host routed into an existing room.
    Announce,
}

/// Coordinator -> registry notification.
#[derive(Debug, Clone)]
pub struct LifecycleMessage {
    pub room_code: Arc<str>,
    /// Distinguishes coordinators that reuse a room code.
    pub instance_id: u64,
    pub total_players: usize,
    pub phase: Phase,
    pub terminated: bool,
}

/// Display projection of a room kept by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_code: String,
    pub total_players: usize,
    pub phase: Phase,
}

/// Process-wide player counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerTotals {
    /// Players currently connected across all rooms.
    pub online: usize,
    /// Running count of admissions since start-up.
    pub seen: u64,
}

/// One-shot events a client session derives for its UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoomReady {
        room_code: String,
    },
    RoomFailed {
        reason: String,
    },
    RoomState(RoomSnapshot),
    PlayerJoined {
        player_id: PlayerId,
        nickname: String,
        total_players: usize,
    },
    PlayerLeft {
        player_id: PlayerId,
        nickname: String,
        in_game: bool,
    },
    /// The player's removal animation starts here.
    PlayerDied {
        player_id: PlayerId,
        nickname: String,
    },
    GameStarted,
    GameEnded,
    ReturnToLobby,
}
