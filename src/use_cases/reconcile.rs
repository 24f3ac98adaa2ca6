// Client-side reconciliation: diffs each snapshot against the last one seen
// and emits at most one event per player edge.

use crate::domain::{Phase, PlayerId, PlayerSnapshot, Position, RoomSnapshot};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowPlayer {
    pub nickname: String,
    pub is_alive: bool,
    pub score: i64,
    pub position: Position,
    pub color: String,
}

impl From<&PlayerSnapshot> for ShadowPlayer {
    fn from(p: &PlayerSnapshot) -> Self {
        Self {
            nickname: p.nickname.clone(),
            is_alive: p.is_alive,
            score: p.score,
            position: p.position,
            color: p.color.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Joined { player_id: PlayerId, nickname: String },
    Left { player_id: PlayerId, nickname: String },
    Died { player_id: PlayerId, nickname: String },
}

/// Result of applying one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// First snapshot showing a running game.
    pub entered_game: bool,
    /// First snapshot showing an ended game.
    pub ended: bool,
    pub events: Vec<PlayerEvent>,
}

#[derive(Debug, Default)]
pub struct ShadowState {
    players: HashMap<PlayerId, ShadowPlayer>,
    in_game: bool,
    ended: bool,
    total_players: usize,
}

impl ShadowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn player(&self, id: &str) -> Option<&ShadowPlayer> {
        self.players.get(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.players.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn in_game(&self) -> bool {
        self.in_game
    }

    pub fn total_players(&self) -> usize {
        self.total_players
    }

    pub fn apply(&mut self, snapshot: &RoomSnapshot) -> Reconciliation {
        let mut out = Reconciliation::default();
        if self.ended {
            return out;
        }

        if snapshot.phase == Phase::Running && !self.in_game {
            self.in_game = true;
            out.entered_game = true;
        }
        if snapshot.phase == Phase::Ended {
            self.ended = true;
            out.ended = true;
            return out;
        }
        self.total_players = snapshot.total_players;

        // Sorted so event order does not depend on map iteration order.
        let mut ids: Vec<&PlayerId> = snapshot.players.keys().collect();
        ids.sort();

        for id in ids {
            let Some(incoming) = snapshot.players.get(id) else {
                continue;
            };
            match (self.players.get_mut(id), incoming.is_connected) {
                (Some(shadow), true) => {
                    if shadow.is_alive && !incoming.is_alive {
                        shadow.is_alive = false;
                        out.events.push(PlayerEvent::Died {
                            player_id: id.clone(),
                            nickname: shadow.nickname.clone(),
                        });
                    } else if incoming.is_alive {
                        shadow.position = incoming.position;
                        shadow.score = incoming.score;
                    }
                }
                (Some(shadow), false) => {
                    out.events.push(PlayerEvent::Left {
                        player_id: id.clone(),
                        nickname: shadow.nickname.clone(),
                    });
                    self.players.remove(id);
                }
                (None, true) => {
                    self.players.insert(id.clone(), ShadowPlayer::from(incoming));
                    out.events.push(PlayerEvent::Joined {
                        player_id: id.clone(),
                        nickname: incoming.nickname.clone(),
                    });
                }
                (None, false) => {}
            }
        }

        // Players whose tombstone snapshots never reached us.
        let mut vanished: Vec<PlayerId> = self
            .players
            .keys()
            .filter(|id| !snapshot.players.contains_key(*id))
            .cloned()
            .collect();
        vanished.sort();
        for id in vanished {
            if let Some(gone) = self.players.remove(&id) {
                out.events.push(PlayerEvent::Left {
                    player_id: id,
                    nickname: gone.nickname,
                });
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(nickname: &str, alive: bool, connected: bool, x: i32) -> PlayerSnapshot {
        PlayerSnapshot {
            nickname: nickname.to_string(),
            is_alive: alive,
            is_connected: connected,
            score: 0,
            position: Position::new(x, 0),
            color: "#123456".to_string(),
        }
    }

    fn snapshot(phase: Phase, players: &[(&str, PlayerSnapshot)]) -> RoomSnapshot {
        RoomSnapshot {
            total_players: players.iter().filter(|(_, p)| p.is_connected).count(),
            players: players
                .iter()
                .map(|(id, p)| (id.to_string(), p.clone()))
                .collect(),
            phase,
        }
    }

    fn joined(id: &str, nickname: &str) -> PlayerEvent {
        PlayerEvent::Joined {
            player_id: id.to_string(),
            nickname: nickname.to_string(),
        }
    }

    #[test]
    fn new_players_join_once() {
        let mut shadow = ShadowState::new();
        let snap = snapshot(
            Phase::Waiting,
            &[
                ("h", player("Hana", true, true, 0)),
                ("p1", player("Pim", true, true, 0)),
            ],
        );

        let first = shadow.apply(&snap);
        assert_eq!(first.events, vec![joined("h", "Hana"), joined("p1", "Pim")]);
        assert!(!first.entered_game);

        assert_eq!(shadow.apply(&snap), Reconciliation::default());
        assert_eq!(shadow.len(), 2);
        assert_eq!(shadow.total_players(), 2);
    }

    #[test]
    fn positions_follow_the_latest_snapshot() {
        let mut shadow = ShadowState::new();
        shadow.apply(&snapshot(Phase::Waiting, &[("p1", player("Pim", true, true, 0))]));

        let moved = shadow.apply(&snapshot(Phase::Waiting, &[("p1", player("Pim", true, true, 40))]));

        assert!(moved.events.is_empty());
        assert_eq!(shadow.player("p1").expect("p1").position, Position::new(40, 0));
    }

    #[test]
    fn death_is_reported_once() {
        let mut shadow = ShadowState::new();
        shadow.apply(&snapshot(Phase::Running, &[("p1", player("Pim", true, true, 0))]));

        let dead = snapshot(Phase::Running, &[("p1", player("Pim", false, true, 0))]);
        assert_eq!(
            shadow.apply(&dead).events,
            vec![PlayerEvent::Died {
                player_id: "p1".to_string(),
                nickname: "Pim".to_string()
            }]
        );
        assert!(shadow.apply(&dead).events.is_empty());
        assert!(!shadow.player("p1").expect("p1").is_alive);
    }

    #[test]
    fn disconnect_is_reported_once_and_forgotten() {
        let mut shadow = ShadowState::new();
        shadow.apply(&snapshot(Phase::Waiting, &[("p1", player("Pim", true, true, 0))]));

        let gone = snapshot(Phase::Waiting, &[("p1", player("Pim", true, false, 0))]);
        assert_eq!(
            shadow.apply(&gone).events,
            vec![PlayerEvent::Left {
                player_id: "p1".to_string(),
                nickname: "Pim".to_string()
            }]
        );
        assert!(shadow.apply(&gone).events.is_empty());
        assert!(shadow.apply(&snapshot(Phase::Waiting, &[])).events.is_empty());
        assert!(shadow.is_empty());
    }

    #[test]
    fn unseen_disconnected_players_are_ignored() {
        let mut shadow = ShadowState::new();
        let snap = snapshot(Phase::Waiting, &[("p1", player("Pim", true, false, 0))]);

        assert!(shadow.apply(&snap).events.is_empty());
        assert!(shadow.is_empty());
    }

    #[test]
    fn vanished_players_leave_once() {
        let mut shadow = ShadowState::new();
        shadow.apply(&snapshot(
            Phase::Waiting,
            &[
                ("h", player("Hana", true, true, 0)),
                ("p1", player("Pim", true, true, 0)),
            ],
        ));

        let without_p1 = snapshot(Phase::Waiting, &[("h", player("Hana", true, true, 0))]);
        assert_eq!(shadow.apply(&without_p1).events.len(), 1);
        assert!(shadow.apply(&without_p1).events.is_empty());
    }

    #[test]
    fn running_phase_enters_the_game_once() {
        let mut shadow = ShadowState::new();
        let running = snapshot(Phase::Running, &[("h", player("Hana", true, true, 0))]);

        assert!(shadow.apply(&running).entered_game);
        assert!(!shadow.apply(&running).entered_game);
        assert!(shadow.in_game());
    }

    #[test]
    fn ended_phase_fires_once_and_freezes_the_shadow() {
        let mut shadow = ShadowState::new();
        shadow.apply(&snapshot(Phase::Running, &[("h", player("Hana", true, true, 0))]));

        let ended = snapshot(Phase::Ended, &[("h", player("Hana", true, false, 0))]);
        let first = shadow.apply(&ended);
        assert!(first.ended);
        assert!(first.events.is_empty());
        assert_eq!(shadow.apply(&ended), Reconciliation::default());
    }

    #[test]
    fn events_depend_only_on_transitions_not_redelivery() {
        let sequence = [
            snapshot(Phase::Waiting, &[("p1", player("Pim", true, true, 0))]),
            snapshot(Phase::Running, &[("p1", player("Pim", true, true, 20))]),
            snapshot(Phase::Running, &[("p1", player("Pim", false, true, 20))]),
            snapshot(Phase::Running, &[("p1", player("Pim", false, false, 20))]),
        ];

        let mut once = ShadowState::new();
        let single: Vec<PlayerEvent> = sequence
            .iter()
            .flat_map(|s| once.apply(s).events)
            .collect();

        let mut twice = ShadowState::new();
        let doubled: Vec<PlayerEvent> = sequence
            .iter()
            .flat_map(|s| {
                let mut events = twice.apply(s).events;
                events.extend(twice.apply(s).events);
                events
            })
            .collect();

        assert_eq!(single.len(), 3);
        assert_eq!(single, doubled);
    }
}
