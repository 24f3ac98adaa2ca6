// Wire protocol DTOs and conversions.
// Bus payloads (snapshots, intents, presence data) use camelCase field names;
// the WebSocket gateway wraps session events in `{type, data}` envelopes.

use crate::domain::{Direction, Intent, Phase, PlayerSnapshot, Position, RoomSnapshot};
use crate::use_cases::{PlayerTotals, RoomSummary, SessionEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const LOBBY_CHANNEL: &str = "lobby";

pub const ROOM_READY_EVENT: &str = "room-ready";
pub const ROOM_FAILED_EVENT: &str = "room-failed";
pub const ROOM_STATE_EVENT: &str = "room-state";
pub const INTENT_EVENT: &str = "intent";

/// Channel carrying snapshots and readiness signals for a room.
pub fn room_channel(room_code: &str) -> String {
    format!("{room_code}:primary")
}

/// Channel a single player publishes intents on.
pub fn player_channel(room_code: &str, player_id: &str) -> String {
    format!("{room_code}:player-ch-{player_id}")
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("coordinates must be finite")]
    NonFiniteCoordinates,
}

/// Presence data a host enters the lobby channel with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPresenceData {
    #[serde(default)]
    pub nickname: String,
    pub room_code: String,
    #[serde(default)]
    pub is_host: bool,
}

/// Presence data every player enters the room channel with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPresenceData {
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub is_host: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomReadyDto {
    pub room_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomFailedDto {
    pub room_code: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseDto {
    Waiting,
    Running,
    Ended,
}

impl From<Phase> for PhaseDto {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Waiting => PhaseDto::Waiting,
            Phase::Running => PhaseDto::Running,
            Phase::Ended => PhaseDto::Ended,
        }
    }
}

impl From<PhaseDto> for Phase {
    fn from(phase: PhaseDto) -> Self {
        match phase {
            PhaseDto::Waiting => Phase::Waiting,
            PhaseDto::Running => Phase::Running,
            PhaseDto::Ended => Phase::Ended,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStateDto {
    pub nickname: String,
    pub is_alive: bool,
    pub is_connected: bool,
    pub score: i64,
    pub x: i32,
    pub y: i32,
    pub color: String,
}

impl From<&PlayerSnapshot> for PlayerStateDto {
    fn from(p: &PlayerSnapshot) -> Self {
        Self {
            nickname: p.nickname.clone(),
            is_alive: p.is_alive,
            is_connected: p.is_connected,
            score: p.score,
            x: p.position.x,
            y: p.position.y,
            color: p.color.clone(),
        }
    }
}

impl From<PlayerStateDto> for PlayerSnapshot {
    fn from(p: PlayerStateDto) -> Self {
        Self {
            nickname: p.nickname,
            is_alive: p.is_alive,
            is_connected: p.is_connected,
            score: p.score,
            position: Position::new(p.x, p.y),
            color: p.color,
        }
    }
}

/// Full room state broadcast on every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDto {
    pub players: std::collections::HashMap<String, PlayerStateDto>,
    pub total_players: usize,
    pub phase: PhaseDto,
}

impl From<&RoomSnapshot> for SnapshotDto {
    fn from(snapshot: &RoomSnapshot) -> Self {
        Self {
            players: snapshot
                .players
                .iter()
                .map(|(id, p)| (id.clone(), PlayerStateDto::from(p)))
                .collect(),
            total_players: snapshot.total_players,
            phase: snapshot.phase.into(),
        }
    }
}

impl From<SnapshotDto> for RoomSnapshot {
    fn from(dto: SnapshotDto) -> Self {
        Self {
            players: dto
                .players
                .into_iter()
                .map(|(id, p)| (id, PlayerSnapshot::from(p)))
                .collect(),
            total_players: dto.total_players,
            phase: dto.phase.into(),
        }
    }
}

pub fn parse_snapshot(data: Value) -> Result<RoomSnapshot, ProtocolError> {
    let dto: SnapshotDto = serde_json::from_value(data)?;
    Ok(dto.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentKind {
    Move,
    Died,
    StartGame,
    EndGame,
}

/// Player intent as published on the player channel:
/// `{type, payload}` where only `Move` carries `{x, y}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDto {
    #[serde(rename = "type")]
    pub kind: IntentKind,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MovePayload {
    pub x: f64,
    pub y: f64,
}

impl From<Intent> for IntentDto {
    fn from(intent: Intent) -> Self {
        let (kind, payload) = match intent {
            Intent::Move(pos) => (
                IntentKind::Move,
                serde_json::json!({ "x": pos.x, "y": pos.y }),
            ),
            Intent::Died => (IntentKind::Died, Value::Object(Default::default())),
            Intent::StartGame => (IntentKind::StartGame, Value::Object(Default::default())),
            Intent::EndGame => (IntentKind::EndGame, Value::Object(Default::default())),
        };
        Self { kind, payload }
    }
}

impl TryFrom<IntentDto> for Intent {
    type Error = ProtocolError;

    fn try_from(dto: IntentDto) -> Result<Self, Self::Error> {
        match dto.kind {
            IntentKind::Move => {
                let payload: MovePayload = serde_json::from_value(dto.payload)?;
                Ok(Intent::Move(position_from_coordinates(payload.x, payload.y)?))
            }
            IntentKind::Died => Ok(Intent::Died),
            IntentKind::StartGame => Ok(Intent::StartGame),
            IntentKind::EndGame => Ok(Intent::EndGame),
        }
    }
}

pub fn parse_intent(data: Value) -> Result<Intent, ProtocolError> {
    let dto: IntentDto = serde_json::from_value(data)?;
    Intent::try_from(dto)
}

pub fn intent_payload(intent: Intent) -> Value {
    serde_json::to_value(IntentDto::from(intent)).unwrap_or(Value::Null)
}

fn position_from_coordinates(x: f64, y: f64) -> Result<Position, ProtocolError> {
    if !x.is_finite() || !y.is_finite() {
        return Err(ProtocolError::NonFiniteCoordinates);
    }
    // `as` saturates; the room clamps to the field afterwards.
    Ok(Position::new(x.round() as i32, y.round() as i32))
}

/// Messages the WebSocket gateway accepts from a browser.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    Move { x: f64, y: f64 },
    Step { direction: DirectionDto },
    Died,
    StartGame,
    EndGame,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionDto {
    Left,
    Right,
    Up,
    Down,
}

impl From<DirectionDto> for Direction {
    fn from(d: DirectionDto) -> Self {
        match d {
            DirectionDto::Left => Direction::Left,
            DirectionDto::Right => Direction::Right,
            DirectionDto::Up => Direction::Up,
            DirectionDto::Down => Direction::Down,
        }
    }
}

impl ClientMessage {
    /// Converts coordinates for `Move`; other variants never fail.
    pub fn move_target(x: f64, y: f64) -> Result<Position, ProtocolError> {
        position_from_coordinates(x, y)
    }
}

/// Messages the WebSocket gateway sends to a browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    Identity { player_id: String, room_code: String },
    RoomReady { room_code: String },
    RoomFailed { reason: String },
    RoomState(SnapshotDto),
    PlayerJoined { player_id: String, nickname: String, total_players: usize },
    PlayerLeft { player_id: String, nickname: String, in_game: bool },
    PlayerDied { player_id: String, nickname: String },
    GameStarted,
    GameEnded,
    ReturnToLobby,
}

impl From<&SessionEvent> for ServerMessage {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::RoomReady { room_code } => ServerMessage::RoomReady {
                room_code: room_code.clone(),
            },
            SessionEvent::RoomFailed { reason } => ServerMessage::RoomFailed {
                reason: reason.clone(),
            },
            SessionEvent::RoomState(snapshot) => ServerMessage::RoomState(snapshot.into()),
            SessionEvent::PlayerJoined {
                player_id,
                nickname,
                total_players,
            } => ServerMessage::PlayerJoined {
                player_id: player_id.clone(),
                nickname: nickname.clone(),
                total_players: *total_players,
            },
            SessionEvent::PlayerLeft {
                player_id,
                nickname,
                in_game,
            } => ServerMessage::PlayerLeft {
                player_id: player_id.clone(),
                nickname: nickname.clone(),
                in_game: *in_game,
            },
            SessionEvent::PlayerDied {
                player_id,
                nickname,
            } => ServerMessage::PlayerDied {
                player_id: player_id.clone(),
                nickname: nickname.clone(),
            },
            SessionEvent::GameStarted => ServerMessage::GameStarted,
            SessionEvent::GameEnded => ServerMessage::GameEnded,
            SessionEvent::ReturnToLobby => ServerMessage::ReturnToLobby,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummaryDto {
    pub room_code: String,
    pub total_players: usize,
    pub phase: PhaseDto,
}

impl From<&RoomSummary> for RoomSummaryDto {
    fn from(summary: &RoomSummary) -> Self {
        Self {
            room_code: summary.room_code.clone(),
            total_players: summary.total_players,
            phase: summary.phase.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomsResponse {
    pub rooms: Vec<RoomSummaryDto>,
    pub players_online: usize,
    pub players_seen: u64,
}

impl RoomsResponse {
    pub fn new(summaries: &[RoomSummary], totals: PlayerTotals) -> Self {
        Self {
            rooms: summaries.iter().map(RoomSummaryDto::from).collect(),
            players_online: totals.online,
            players_seen: totals.seen,
        }
    }
}

/// Which page a requester should see for a room code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomView {
    Host,
    Waiting,
    Started,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRouteDto {
    pub room_code: String,
    pub view: RoomView,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn move_intent_parses_coordinates() {
        let intent = parse_intent(json!({"type": "Move", "payload": {"x": 120.4, "y": 80}}))
            .expect("valid move");
        assert_eq!(intent, Intent::Move(Position::new(120, 80)));
    }

    #[test]
    fn marker_payloads_and_missing_payloads_are_accepted() {
        assert_eq!(
            parse_intent(json!({"type": "StartGame", "payload": {"startGame": true}}))
                .expect("start"),
            Intent::StartGame
        );
        assert_eq!(
            parse_intent(json!({"type": "EndGame"})).expect("end"),
            Intent::EndGame
        );
        assert_eq!(
            parse_intent(json!({"type": "Died", "payload": {}})).expect("died"),
            Intent::Died
        );
    }

    #[test]
    fn malformed_intents_are_rejected() {
        assert!(parse_intent(json!({"type": "Teleport"})).is_err());
        assert!(parse_intent(json!({"type": "Move", "payload": {"x": "left"}})).is_err());
        assert!(parse_intent(json!({"payload": {}})).is_err());
        assert!(matches!(
            ClientMessage::move_target(f64::NAN, 1.0),
            Err(ProtocolError::NonFiniteCoordinates)
        ));
    }

    #[test]
    fn intent_payload_round_trips_through_the_parser() {
        let intent = Intent::Move(Position::new(20, 40));
        assert_eq!(parse_intent(intent_payload(intent)).expect("parse"), intent);
    }

    #[test]
    fn snapshot_uses_camel_case_wire_names() {
        let mut players = HashMap::new();
        players.insert(
            "id-1".to_string(),
            PlayerSnapshot {
                nickname: "Hana".to_string(),
                is_alive: true,
                is_connected: false,
                score: 0,
                position: Position::new(3, 4),
                color: "#00ff00".to_string(),
            },
        );
        let snapshot = RoomSnapshot {
            players,
            total_players: 0,
            phase: Phase::Running,
        };

        let value = serde_json::to_value(SnapshotDto::from(&snapshot)).expect("serialize");

        assert_eq!(value["phase"], "Running");
        assert_eq!(value["totalPlayers"], 0);
        assert_eq!(value["players"]["id-1"]["isConnected"], false);
        assert_eq!(value["players"]["id-1"]["x"], 3);
        assert_eq!(parse_snapshot(value).expect("parse"), snapshot);
    }

    #[test]
    fn client_messages_use_type_and_data_tags() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "Step", "data": {"direction": "left"}}))
                .expect("step");
        assert!(matches!(
            msg,
            ClientMessage::Step {
                direction: DirectionDto::Left
            }
        ));
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "StartGame"})).expect("start");
        assert!(matches!(msg, ClientMessage::StartGame));
    }
}
