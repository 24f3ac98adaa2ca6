// One browser's view of a room: publishes intents, reconciles snapshots.

use crate::domain::{Direction, Intent, PlayField, Position};
use crate::interface_adapters::bus::{BusError, Connection, Envelope, Subscription};
use crate::interface_adapters::protocol::{
    HostPresenceData, INTENT_EVENT, LOBBY_CHANNEL, ROOM_FAILED_EVENT, ROOM_READY_EVENT,
    ROOM_STATE_EVENT, RoomFailedDto, RoomPresenceData, intent_payload, parse_snapshot,
    player_channel, room_channel,
};
use crate::use_cases::reconcile::{PlayerEvent, ShadowState};
use crate::use_cases::types::SessionEvent;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_code: String,
    pub nickname: String,
    pub is_host: bool,
    pub field: PlayField,
    /// Delay between the end of a game and `ReturnToLobby`.
    pub end_navigation_delay: Duration,
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(room_code: impl Into<String>, nickname: impl Into<String>, is_host: bool) -> Self {
        Self {
            room_code: room_code.into(),
            nickname: nickname.into(),
            is_host,
            field: PlayField::default(),
            end_navigation_delay: Duration::from_secs(3),
            event_capacity: 256,
        }
    }

    pub fn with_field(mut self, field: PlayField) -> Self {
        self.field = field;
        self
    }

    pub fn with_end_navigation_delay(mut self, delay: Duration) -> Self {
        self.end_navigation_delay = delay;
        self
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("could not join the room: {0}")]
    Bus(#[from] BusError),
}

#[derive(Debug)]
enum SessionCommand {
    Step(Direction),
    MoveTo(Position),
    Intent(Intent),
    Leave,
}

/// Command handle for a running session. Dropping it leaves the room.
pub struct ClientSession {
    client_id: Arc<str>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl ClientSession {
    /// Subscribes to the room and announces the player: hosts through the
    /// lobby (waiting for `room-ready`), everyone else directly on the room
    /// channel. The connection is owned by the session from here on.
    pub fn start(
        conn: Connection,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let client_id: Arc<str> = Arc::from(conn.client_id());
        let room = room_channel(&config.room_code);

        // Subscribe before announcing so readiness cannot be missed.
        let room_sub = conn.subscribe_all(&room)?;
        if config.is_host {
            conn.presence_enter(LOBBY_CHANNEL, host_presence(&config))?;
        } else {
            conn.presence_enter(&room, room_presence(&config))?;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

        let span = info_span!(
            "session",
            room_code = %config.room_code,
            player_id = %client_id,
            is_host = config.is_host
        );
        let task = SessionTask {
            player_id: client_id.clone(),
            intent_channel: player_channel(&config.room_code, &client_id),
            room_channel: room,
            conn,
            config,
            shadow: ShadowState::new(),
            room_sub,
            cmd_rx,
            event_tx,
            ready: false,
            ended: false,
            navigation: None,
        };
        tokio::spawn(task.run().instrument(span));

        Ok((Self { client_id, cmd_tx }, event_rx))
    }

    /// Identity this session publishes under.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Moves one grid step from the last known position.
    pub fn step(&self, direction: Direction) -> Result<(), SessionError> {
        self.send(SessionCommand::Step(direction))
    }

    pub fn move_to(&self, target: Position) -> Result<(), SessionError> {
        self.send(SessionCommand::MoveTo(target))
    }

    pub fn die(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Intent(Intent::Died))
    }

    pub fn start_game(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Intent(Intent::StartGame))
    }

    pub fn end_game(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Intent(Intent::EndGame))
    }

    /// Leaves the room and closes the connection.
    pub fn leave(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Leave)
    }

    fn send(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.cmd_tx.send(cmd).map_err(|_| SessionError::Closed)
    }
}

fn host_presence(config: &SessionConfig) -> serde_json::Value {
    serde_json::to_value(HostPresenceData {
        nickname: config.nickname.clone(),
        room_code: config.room_code.clone(),
        is_host: true,
    })
    .unwrap_or_default()
}

fn room_presence(config: &SessionConfig) -> serde_json::Value {
    serde_json::to_value(RoomPresenceData {
        nickname: config.nickname.clone(),
        is_host: config.is_host,
    })
    .unwrap_or_default()
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct SessionTask {
    player_id: Arc<str>,
    intent_channel: String,
    room_channel: String,
    conn: Connection,
    config: SessionConfig,
    shadow: ShadowState,
    room_sub: Subscription,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    // Host has been routed into its room.
    ready: bool,
    // The game ended; only the pending navigation remains.
    ended: bool,
    navigation: Option<Pin<Box<Sleep>>>,
}

impl SessionTask {
    async fn run(mut self) {
        debug!("session started");
        loop {
            let following = !self.ended;
            let flow = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Leave) | None => Flow::Stop,
                    Some(cmd) => {
                        self.handle_command(cmd);
                        Flow::Continue
                    }
                },
                Some(envelope) = self.room_sub.recv(), if following => {
                    self.handle_envelope(envelope).await
                }
                _ = next_navigation(&mut self.navigation) => {
                    self.emit(SessionEvent::ReturnToLobby).await;
                    Flow::Stop
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }

        self.conn.close();
        debug!("session closed");
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        if self.ended {
            return;
        }
        let intent = match cmd {
            SessionCommand::Step(direction) => {
                let Some(own) = self.shadow.player(&self.player_id) else {
                    debug!("step before the first snapshot dropped");
                    return;
                };
                let Some(next) = self.config.field.step(own.position, direction) else {
                    return;
                };
                Intent::Move(next)
            }
            SessionCommand::MoveTo(target) => Intent::Move(self.config.field.clamp(target)),
            SessionCommand::Intent(intent) => intent,
            SessionCommand::Leave => return,
        };

        if let Err(err) = self
            .conn
            .publish(&self.intent_channel, INTENT_EVENT, intent_payload(intent))
        {
            debug!(error = %err, ?intent, "intent not published");
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Flow {
        match &*envelope.name {
            ROOM_READY_EVENT => self.on_room_ready().await,
            ROOM_FAILED_EVENT => self.on_room_failed(envelope.data).await,
            ROOM_STATE_EVENT => self.on_room_state(envelope.data).await,
            other => {
                debug!(event = other, "unhandled room event");
                Flow::Continue
            }
        }
    }

    async fn on_room_ready(&mut self) -> Flow {
        if !self.config.is_host || self.ready {
            return Flow::Continue;
        }
        self.conn.detach(LOBBY_CHANNEL);
        if let Err(err) = self
            .conn
            .presence_enter(&self.room_channel, room_presence(&self.config))
        {
            warn!(error = %err, "host could not enter its room");
            self.emit(SessionEvent::RoomFailed {
                reason: err.to_string(),
            })
            .await;
            return Flow::Stop;
        }
        self.ready = true;
        info!("room ready");
        self.emit(SessionEvent::RoomReady {
            room_code: self.config.room_code.clone(),
        })
        .await;
        Flow::Continue
    }

    async fn on_room_failed(&mut self, data: serde_json::Value) -> Flow {
        if !self.config.is_host || self.ready {
            return Flow::Continue;
        }
        let reason = serde_json::from_value::<RoomFailedDto>(data)
            .map(|failure| failure.reason)
            .unwrap_or_else(|_| "room could not be created".to_string());
        warn!(%reason, "room creation failed");
        self.emit(SessionEvent::RoomFailed { reason }).await;
        Flow::Stop
    }

    async fn on_room_state(&mut self, data: serde_json::Value) -> Flow {
        let snapshot = match parse_snapshot(data) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(error = %err, "invalid snapshot dropped");
                return Flow::Continue;
            }
        };

        let outcome = self.shadow.apply(&snapshot);
        if outcome.entered_game {
            self.emit(SessionEvent::GameStarted).await;
        }
        if outcome.ended {
            self.finish().await;
            return Flow::Continue;
        }

        for event in outcome.events {
            let event = match event {
                PlayerEvent::Joined {
                    player_id,
                    nickname,
                } => SessionEvent::PlayerJoined {
                    player_id,
                    nickname,
                    total_players: self.shadow.total_players(),
                },
                PlayerEvent::Left {
                    player_id,
                    nickname,
                } => SessionEvent::PlayerLeft {
                    player_id,
                    nickname,
                    in_game: self.shadow.in_game(),
                },
                PlayerEvent::Died {
                    player_id,
                    nickname,
                } => SessionEvent::PlayerDied {
                    player_id,
                    nickname,
                },
            };
            self.emit(event).await;
        }
        self.emit(SessionEvent::RoomState(snapshot)).await;
        Flow::Continue
    }

    /// One-shot cleanup for an ended game: drop every channel, close the
    /// connection and schedule the navigation back to the lobby.
    async fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.conn.detach(&self.intent_channel);
        self.conn.detach(&self.room_channel);
        self.conn.close();
        info!("game ended");
        self.emit(SessionEvent::GameEnded).await;
        self.navigation = Some(Box::pin(tokio::time::sleep(
            self.config.end_navigation_delay,
        )));
    }

    /// Snapshots are superseded by the next tick and are skipped while the
    /// consumer lags. Every other event fires once and waits for queue space.
    async fn emit(&self, event: SessionEvent) {
        if let SessionEvent::RoomState(_) = event {
            if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
                debug!("event queue full; snapshot skipped");
            }
            return;
        }
        if self.event_tx.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}

async fn next_navigation(navigation: &mut Option<Pin<Box<Sleep>>>) {
    match navigation {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}
