// Authoritative room state machine. Owned by exactly one coordinator.

use super::field::{PlayField, Position};
use super::state::{
    Connection, CoordinatorStatus, Intent, Phase, PlayerId, PlayerSnapshot, PlayerState,
    RoomSnapshot,
};
use std::collections::HashMap;

const MAX_ROOM_CODE_LEN: usize = 64;

/// Room codes travel inside channel names, so keep them to a safe alphabet.
pub fn is_valid_room_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= MAX_ROOM_CODE_LEN
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `first` is true for the very first admission of the room's lifetime.
    Admitted { first: bool },
    AlreadyPresent,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dismissal {
    /// `remaining` is the number of players still connected.
    Dismissed { remaining: usize },
    AlreadyDisconnected,
    UnknownPlayer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredIntent {
    UnknownPlayer,
    Disconnected,
    NotHost,
    WrongPhase,
    AlreadyDead,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentOutcome {
    Moved(Position),
    Died,
    PhaseChanged(Phase),
    Ignored(IgnoredIntent),
}

#[derive(Debug)]
pub struct Room {
    code: String,
    host_id: PlayerId,
    field: PlayField,
    phase: Phase,
    players: HashMap<PlayerId, PlayerState>,
    total_players: usize,
    // Broadcasts a tombstone must appear in before it is removed.
    grace_broadcasts: u32,
    admitted_any: bool,
    terminated: bool,
}

impl Room {
    pub fn new(
        code: impl Into<String>,
        host_id: impl Into<PlayerId>,
        field: PlayField,
        grace_broadcasts: u32,
    ) -> Self {
        Self {
            code: code.into(),
            host_id: host_id.into(),
            field,
            phase: Phase::Waiting,
            players: HashMap::new(),
            total_players: 0,
            grace_broadcasts,
            admitted_any: false,
            terminated: false,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn total_players(&self) -> usize {
        self.total_players
    }

    pub fn player(&self, id: &str) -> Option<&PlayerState> {
        self.players.get(id)
    }

    pub fn status(&self) -> CoordinatorStatus {
        if self.terminated {
            return CoordinatorStatus::Terminated;
        }
        if !self.admitted_any {
            return CoordinatorStatus::Idle;
        }
        match self.phase {
            Phase::Waiting => CoordinatorStatus::Waiting,
            Phase::Running => CoordinatorStatus::Running,
            Phase::Ended => CoordinatorStatus::Ended,
        }
    }

    /// Adds a connected, alive player at `spawn` (clamped into the field).
    pub fn admit(
        &mut self,
        id: impl Into<PlayerId>,
        nickname: impl Into<String>,
        spawn: Position,
        color: impl Into<String>,
    ) -> Admission {
        if self.terminated {
            return Admission::Terminated;
        }
        let id = id.into();
        if self.players.contains_key(&id) {
            return Admission::AlreadyPresent;
        }

        let player = PlayerState {
            id: id.clone(),
            nickname: nickname.into(),
            is_alive: true,
            connection: Connection::Connected,
            score: 0,
            position: self.field.clamp(spawn),
            color: color.into(),
        };
        self.players.insert(id, player);
        self.total_players += 1;

        let first = !self.admitted_any;
        self.admitted_any = true;
        Admission::Admitted { first }
    }

    /// Marks the player disconnected; the record stays as a tombstone until
    /// it has been broadcast `grace_broadcasts` times.
    pub fn dismiss(&mut self, id: &str) -> Dismissal {
        let Some(player) = self.players.get_mut(id) else {
            return Dismissal::UnknownPlayer;
        };
        if !player.is_connected() {
            return Dismissal::AlreadyDisconnected;
        }

        player.connection = Connection::Disconnected { broadcasts_seen: 0 };
        self.total_players = self.total_players.saturating_sub(1);
        Dismissal::Dismissed {
            remaining: self.total_players,
        }
    }

    pub fn apply_intent(&mut self, id: &str, intent: Intent) -> IntentOutcome {
        if self.terminated {
            return IntentOutcome::Ignored(IgnoredIntent::Terminated);
        }
        let is_host = id == self.host_id;
        let Some(player) = self.players.get_mut(id) else {
            return IntentOutcome::Ignored(IgnoredIntent::UnknownPlayer);
        };
        if !player.is_connected() {
            return IntentOutcome::Ignored(IgnoredIntent::Disconnected);
        }

        match intent {
            Intent::Move(pos) => {
                player.position = self.field.clamp(pos);
                IntentOutcome::Moved(player.position)
            }
            Intent::Died => {
                if !player.is_alive {
                    return IntentOutcome::Ignored(IgnoredIntent::AlreadyDead);
                }
                player.is_alive = false;
                IntentOutcome::Died
            }
            Intent::StartGame => self.advance(is_host, Phase::Waiting, Phase::Running),
            Intent::EndGame => self.advance(is_host, Phase::Running, Phase::Ended),
        }
    }

    fn advance(&mut self, is_host: bool, from: Phase, to: Phase) -> IntentOutcome {
        if !is_host {
            return IntentOutcome::Ignored(IgnoredIntent::NotHost);
        }
        if self.phase != from {
            return IntentOutcome::Ignored(IgnoredIntent::WrongPhase);
        }
        self.phase = to;
        IntentOutcome::PhaseChanged(to)
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            players: self
                .players
                .iter()
                .map(|(id, p)| (id.clone(), PlayerSnapshot::from(p)))
                .collect(),
            total_players: self.total_players,
            phase: self.phase,
        }
    }

    /// Ages tombstones after a snapshot went out and removes the expired ones.
    /// Returns the removed player ids in sorted order.
    pub fn record_broadcast(&mut self) -> Vec<PlayerId> {
        let grace = self.grace_broadcasts;
        let mut removed = Vec::new();
        for (id, player) in self.players.iter_mut() {
            if let Connection::Disconnected { broadcasts_seen } = &mut player.connection {
                *broadcasts_seen += 1;
                if *broadcasts_seen >= grace {
                    removed.push(id.clone());
                }
            }
        }
        for id in &removed {
            self.players.remove(id);
        }
        removed.sort();
        removed
    }

    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    #[cfg(test)]
    fn connected_count(&self) -> usize {
        self.players.values().filter(|p| p.is_connected()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> Room {
        Room::new("room-abc", "host", PlayField::default(), 2)
    }

    fn admit(room: &mut Room, id: &str) -> Admission {
        room.admit(id, id.to_uppercase(), Position::new(10, 10), "#112233")
    }

    #[test]
    fn first_admission_moves_idle_room_to_waiting() {
        let mut room = room();
        assert_eq!(room.status(), CoordinatorStatus::Idle);

        assert_eq!(admit(&mut room, "host"), Admission::Admitted { first: true });
        assert_eq!(admit(&mut room, "p1"), Admission::Admitted { first: false });

        assert_eq!(room.status(), CoordinatorStatus::Waiting);
        let snapshot = room.snapshot();
        assert_eq!(snapshot.total_players, 2);
        assert_eq!(snapshot.phase, Phase::Waiting);
        assert!(snapshot.players.contains_key("host"));
        assert!(snapshot.players.contains_key("p1"));
    }

    #[test]
    fn admitted_player_starts_alive_connected_with_zero_score() {
        let mut room = room();
        room.admit("p1", "Pim", Position::new(5000, -3), "#abcdef");

        let player = room.player("p1").expect("player admitted");
        assert!(player.is_alive);
        assert!(player.is_connected());
        assert_eq!(player.score, 0);
        assert_eq!(player.color, "#abcdef");
        assert_eq!(player.position, Position::new(800, 0));
    }

    #[test]
    fn duplicate_admission_is_a_no_op() {
        let mut room = room();
        admit(&mut room, "p1");

        assert_eq!(admit(&mut room, "p1"), Admission::AlreadyPresent);
        assert_eq!(room.total_players(), 1);
    }

    #[test]
    fn total_players_tracks_connected_records() {
        let mut room = room();
        for id in ["host", "p1", "p2", "p3"] {
            admit(&mut room, id);
            assert_eq!(room.total_players(), room.connected_count());
        }
        room.dismiss("p2");
        assert_eq!(room.total_players(), room.connected_count());
        room.dismiss("p2");
        room.dismiss("ghost");
        assert_eq!(room.total_players(), room.connected_count());
        room.record_broadcast();
        room.record_broadcast();
        assert_eq!(room.total_players(), room.connected_count());
        assert_eq!(room.total_players(), 3);
    }

    #[test]
    fn dismissing_the_last_player_reports_zero_remaining() {
        let mut room = room();
        admit(&mut room, "host");
        admit(&mut room, "p1");

        assert_eq!(room.dismiss("p1"), Dismissal::Dismissed { remaining: 1 });
        assert_eq!(room.dismiss("host"), Dismissal::Dismissed { remaining: 0 });
        assert_eq!(room.dismiss("host"), Dismissal::AlreadyDisconnected);
    }

    #[test]
    fn tombstone_survives_two_broadcasts() {
        let mut room = room();
        admit(&mut room, "host");
        admit(&mut room, "p1");
        room.dismiss("p1");

        let first = room.snapshot();
        assert!(!first.players["p1"].is_connected);
        assert!(room.record_broadcast().is_empty());

        let second = room.snapshot();
        assert!(!second.players["p1"].is_connected);
        assert_eq!(room.record_broadcast(), vec!["p1".to_string()]);

        assert!(!room.snapshot().players.contains_key("p1"));
    }

    #[test]
    fn start_game_is_idempotent() {
        let mut room = room();
        admit(&mut room, "host");

        assert_eq!(
            room.apply_intent("host", Intent::StartGame),
            IntentOutcome::PhaseChanged(Phase::Running)
        );
        for _ in 0..3 {
            assert_eq!(
                room.apply_intent("host", Intent::StartGame),
                IntentOutcome::Ignored(IgnoredIntent::WrongPhase)
            );
        }
        assert_eq!(room.phase(), Phase::Running);
    }

    #[test]
    fn end_game_only_applies_while_running() {
        let mut room = room();
        admit(&mut room, "host");

        assert_eq!(
            room.apply_intent("host", Intent::EndGame),
            IntentOutcome::Ignored(IgnoredIntent::WrongPhase)
        );
        room.apply_intent("host", Intent::StartGame);
        assert_eq!(
            room.apply_intent("host", Intent::EndGame),
            IntentOutcome::PhaseChanged(Phase::Ended)
        );
        assert_eq!(
            room.apply_intent("host", Intent::EndGame),
            IntentOutcome::Ignored(IgnoredIntent::WrongPhase)
        );
        // No way back once ended.
        assert_eq!(
            room.apply_intent("host", Intent::StartGame),
            IntentOutcome::Ignored(IgnoredIntent::WrongPhase)
        );
        assert_eq!(room.status(), CoordinatorStatus::Ended);
    }

    #[test]
    fn non_host_cannot_change_phase() {
        let mut room = room();
        admit(&mut room, "host");
        admit(&mut room, "p1");

        assert_eq!(
            room.apply_intent("p1", Intent::StartGame),
            IntentOutcome::Ignored(IgnoredIntent::NotHost)
        );
        assert_eq!(room.snapshot().phase, Phase::Waiting);
    }

    #[test]
    fn death_is_irreversible() {
        let mut room = room();
        admit(&mut room, "p1");

        assert_eq!(room.apply_intent("p1", Intent::Died), IntentOutcome::Died);
        assert_eq!(
            room.apply_intent("p1", Intent::Died),
            IntentOutcome::Ignored(IgnoredIntent::AlreadyDead)
        );
        room.apply_intent("p1", Intent::Move(Position::new(40, 40)));
        assert!(!room.player("p1").expect("player").is_alive);
    }

    #[test]
    fn move_is_clamped_to_the_field() {
        let mut room = room();
        admit(&mut room, "p1");

        assert_eq!(
            room.apply_intent("p1", Intent::Move(Position::new(900, -20))),
            IntentOutcome::Moved(Position::new(800, 0))
        );
    }

    #[test]
    fn intents_from_tombstones_and_strangers_are_ignored() {
        let mut room = room();
        admit(&mut room, "p1");
        room.dismiss("p1");

        assert_eq!(
            room.apply_intent("p1", Intent::Move(Position::new(1, 1))),
            IntentOutcome::Ignored(IgnoredIntent::Disconnected)
        );
        assert_eq!(
            room.apply_intent("nobody", Intent::Died),
            IntentOutcome::Ignored(IgnoredIntent::UnknownPlayer)
        );
    }

    #[test]
    fn terminated_room_rejects_everything() {
        let mut room = room();
        admit(&mut room, "host");
        room.terminate();

        assert_eq!(room.status(), CoordinatorStatus::Terminated);
        assert_eq!(admit(&mut room, "p1"), Admission::Terminated);
        assert_eq!(
            room.apply_intent("host", Intent::StartGame),
            IntentOutcome::Ignored(IgnoredIntent::Terminated)
        );
    }

    #[test]
    fn room_codes_are_validated() {
        assert!(is_valid_room_code("room-k3j9x0ab"));
        assert!(!is_valid_room_code(""));
        assert!(!is_valid_room_code("room:primary"));
        assert!(!is_valid_room_code(&"a".repeat(65)));
    }
}
