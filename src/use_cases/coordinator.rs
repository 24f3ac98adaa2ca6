// Per-room actor: owns the room state and handles its inbox in arrival order.

use crate::domain::{
    Admission, CoordinatorStatus, Dismissal, IntentOutcome, PlayField, Room,
};
use crate::interface_adapters::bus::{
    Bus, BusError, Connection, PresenceAction, PresenceSubscription, Subscription,
};
use crate::interface_adapters::protocol::{
    INTENT_EVENT, ROOM_FAILED_EVENT, ROOM_READY_EVENT, ROOM_STATE_EVENT, RoomFailedDto,
    RoomPresenceData, RoomReadyDto, SnapshotDto, parse_intent, player_channel, room_channel,
};
use crate::interface_adapters::utils::rng;
use crate::use_cases::types::{LifecycleMessage, RoomEvent};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{Instrument, debug, info, info_span, warn};

const DEFAULT_NICKNAME: &str = "player";
const PUBLISH_WARN_THROTTLE: Duration = Duration::from_secs(2);

/// Settings shared by every coordinator a registry spawns.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Interval between full-state broadcasts.
    pub tick_interval: Duration,
    /// Broadcasts a disconnected player stays visible for before removal.
    pub grace_broadcasts: u32,
    /// How long a room may wait for its first player.
    pub idle_timeout: Duration,
    /// Capacity of the coordinator inbox.
    pub inbox_capacity: usize,
    pub field: PlayField,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            grace_broadcasts: 2,
            idle_timeout: Duration::from_secs(30),
            inbox_capacity: 1024,
            field: PlayField::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("could not reach the room channel: {0}")]
    Bus(#[from] BusError),
    #[error("could not encode the readiness signal: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Registry-side handle to a running coordinator.
#[derive(Clone)]
pub struct RoomHandle {
    pub room_code: Arc<str>,
    pub instance_id: u64,
    inbox_tx: mpsc::Sender<RoomEvent>,
    shutdown: Arc<Notify>,
}

impl RoomHandle {
    /// Asks the coordinator to repeat its readiness signal. Returns `false`
    /// once the coordinator has stopped reading its inbox.
    pub fn announce(&self) -> bool {
        match self.inbox_tx.try_send(RoomEvent::Announce) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let inbox = self.inbox_tx.clone();
                tokio::spawn(async move {
                    let _ = inbox.send(event).await;
                });
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Requests a graceful termination. The permit is kept if the
    /// coordinator is not currently waiting.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Wires a coordinator for `room_code` to the bus and spawns it.
///
/// The room channel presence is subscribed before `room-ready` goes out, so a
/// host reacting to readiness can never enter unnoticed.
pub fn spawn_coordinator(
    bus: &Bus,
    room_code: &str,
    host_id: &str,
    settings: &CoordinatorSettings,
    lifecycle_tx: mpsc::Sender<LifecycleMessage>,
) -> Result<(RoomHandle, JoinHandle<()>), CoordinatorError> {
    let room_code: Arc<str> = Arc::from(room_code);
    let instance_id = rng::rand_id();
    let conn = bus.connect(format!("coordinator:{room_code}:{instance_id}"));
    let channel = room_channel(&room_code);

    let (inbox_tx, inbox_rx) = mpsc::channel::<RoomEvent>(settings.inbox_capacity.max(1));
    let presence = conn.presence_subscribe(&channel)?;
    let presence_task = tokio::spawn(forward_presence(presence, inbox_tx.clone()));

    let ready = serde_json::to_value(RoomReadyDto {
        room_code: room_code.to_string(),
    })?;
    if let Err(err) = conn.publish(&channel, ROOM_READY_EVENT, ready) {
        presence_task.abort();
        conn.close();
        return Err(err.into());
    }

    let shutdown = Arc::new(Notify::new());
    let mut forwarders = HashMap::new();
    forwarders.insert(channel.clone(), presence_task);

    let coordinator = Coordinator {
        instance_id,
        room: Room::new(
            room_code.to_string(),
            host_id,
            settings.field,
            settings.grace_broadcasts,
        ),
        room_code: room_code.clone(),
        channel,
        conn,
        settings: settings.clone(),
        inbox_tx: inbox_tx.clone(),
        inbox_rx,
        lifecycle_tx,
        shutdown: shutdown.clone(),
        forwarders,
        ticker: None,
        last_publish_warn: None,
    };

    let span = info_span!("room", room_code = %room_code, instance_id);
    let join = tokio::spawn(coordinator.run().instrument(span));

    Ok((
        RoomHandle {
            room_code,
            instance_id,
            inbox_tx,
            shutdown,
        },
        join,
    ))
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

struct Coordinator {
    instance_id: u64,
    room: Room,
    room_code: Arc<str>,
    channel: String,
    conn: Connection,
    settings: CoordinatorSettings,
    // Kept so intent forwarders can be wired after construction.
    inbox_tx: mpsc::Sender<RoomEvent>,
    inbox_rx: mpsc::Receiver<RoomEvent>,
    lifecycle_tx: mpsc::Sender<LifecycleMessage>,
    shutdown: Arc<Notify>,
    // Bus channel -> task forwarding it into the inbox.
    forwarders: HashMap<String, JoinHandle<()>>,
    ticker: Option<Interval>,
    last_publish_warn: Option<Instant>,
}

impl Coordinator {
    async fn run(mut self) {
        info!(host_id = %self.room.host_id(), "room coordinator started");
        self.emit_lifecycle(false).await;

        let idle = tokio::time::sleep(self.settings.idle_timeout);
        tokio::pin!(idle);

        loop {
            let idle_room = self.room.status() == CoordinatorStatus::Idle;
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("shutdown requested");
                    break;
                }
                _ = &mut idle, if idle_room => {
                    info!("no player entered before the idle timeout");
                    break;
                }
                Some(event) = self.inbox_rx.recv() => {
                    if self.handle_event(event).await == Flow::Terminate {
                        break;
                    }
                }
                _ = next_tick(&mut self.ticker) => self.tick(),
            }
        }

        self.terminate().await;
    }

    async fn handle_event(&mut self, event: RoomEvent) -> Flow {
        match event {
            RoomEvent::PresenceEnter {
                player_id,
                nickname,
            } => {
                let nickname = match nickname.trim() {
                    "" => DEFAULT_NICKNAME.to_string(),
                    trimmed => trimmed.to_string(),
                };
                let spawn = rng::spawn_position(&self.settings.field);
                match self
                    .room
                    .admit(player_id.clone(), nickname, spawn, rng::player_color())
                {
                    Admission::Admitted { first } => {
                        info!(
                            %player_id,
                            total_players = self.room.total_players(),
                            "player admitted"
                        );
                        self.watch_intents(&player_id);
                        if first {
                            self.start_ticker();
                        }
                        self.emit_lifecycle(false).await;
                    }
                    Admission::AlreadyPresent | Admission::Terminated => {
                        debug!(%player_id, "duplicate admission ignored");
                    }
                }
                Flow::Continue
            }
            RoomEvent::PresenceLeave { player_id } => match self.room.dismiss(&player_id) {
                Dismissal::Dismissed { remaining } => {
                    info!(%player_id, total_players = remaining, "player disconnected");
                    self.emit_lifecycle(false).await;
                    if remaining == 0 {
                        Flow::Terminate
                    } else {
                        Flow::Continue
                    }
                }
                Dismissal::AlreadyDisconnected | Dismissal::UnknownPlayer => {
                    debug!(%player_id, "leave for unknown or absent player ignored");
                    Flow::Continue
                }
            },
            RoomEvent::Intent { player_id, intent } => {
                match self.room.apply_intent(&player_id, intent) {
                    IntentOutcome::PhaseChanged(phase) => {
                        info!(%player_id, ?phase, "phase changed");
                        self.emit_lifecycle(false).await;
                    }
                    IntentOutcome::Died => info!(%player_id, "player died"),
                    IntentOutcome::Moved(_) => {}
                    IntentOutcome::Ignored(reason) => {
                        debug!(%player_id, ?intent, ?reason, "intent dropped");
                    }
                }
                Flow::Continue
            }
            RoomEvent::Announce => {
                self.announce();
                Flow::Continue
            }
        }
    }

    fn start_ticker(&mut self) {
        let period = self.settings.tick_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        debug!(tick_ms = period.as_millis() as u64, "broadcast ticker started");
    }

    /// Publishes the full room state. A failed publish is not retried; the
    /// next tick carries the same information.
    fn tick(&mut self) {
        let snapshot = self.room.snapshot();
        let payload = match serde_json::to_value(SnapshotDto::from(&snapshot)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode snapshot");
                return;
            }
        };

        match self.conn.publish(&self.channel, ROOM_STATE_EVENT, payload) {
            Ok(_) => {
                for player_id in self.room.record_broadcast() {
                    debug!(%player_id, "tombstone removed");
                    self.release_channel(&player_channel(&self.room_code, &player_id));
                }
            }
            Err(err) => {
                let now = Instant::now();
                let throttled = self
                    .last_publish_warn
                    .is_some_and(|last| now.duration_since(last) < PUBLISH_WARN_THROTTLE);
                if !throttled {
                    self.last_publish_warn = Some(now);
                    warn!(error = %err, "snapshot publish failed; next tick supersedes it");
                }
            }
        }
    }

    fn announce(&self) {
        let payload = match serde_json::to_value(RoomReadyDto {
            room_code: self.room_code.to_string(),
        }) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode readiness signal");
                return;
            }
        };
        if let Err(err) = self.conn.publish(&self.channel, ROOM_READY_EVENT, payload) {
            warn!(error = %err, "failed to repeat readiness signal");
        }
    }

    /// A host routed here after the loop ended gets `room-failed` instead
    /// of a readiness signal that will never come.
    fn reject_announcement(&self) {
        let failure = RoomFailedDto {
            room_code: self.room_code.to_string(),
            reason: "room closed".to_string(),
        };
        let published = serde_json::to_value(failure)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                self.conn
                    .publish(&self.channel, ROOM_FAILED_EVENT, payload)
                    .map_err(|e| e.to_string())
            });
        if let Err(err) = published {
            warn!(error = %err, "failed to reject a late announcement");
        }
    }

    fn watch_intents(&mut self, player_id: &str) {
        let channel = player_channel(&self.room_code, player_id);
        match self.conn.subscribe(&channel, INTENT_EVENT) {
            Ok(sub) => {
                let task = tokio::spawn(forward_intents(
                    sub,
                    Arc::from(player_id),
                    self.inbox_tx.clone(),
                ));
                if let Some(previous) = self.forwarders.insert(channel, task) {
                    previous.abort();
                }
            }
            Err(err) => warn!(%player_id, error = %err, "failed to subscribe to intents"),
        }
    }

    fn release_channel(&mut self, channel: &str) {
        if let Some(task) = self.forwarders.remove(channel) {
            task.abort();
        }
        self.conn.detach(channel);
    }

    async fn terminate(&mut self) {
        self.inbox_rx.close();
        let mut stranded = false;
        while let Ok(event) = self.inbox_rx.try_recv() {
            stranded |= matches!(event, RoomEvent::Announce);
        }
        if stranded {
            self.reject_announcement();
        }

        self.ticker = None;
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
        self.conn.close();
        self.room.terminate();
        self.emit_lifecycle(true).await;
        info!(total_players = self.room.total_players(), "room terminated");
    }

    async fn emit_lifecycle(&self, terminated: bool) {
        let msg = LifecycleMessage {
            room_code: self.room_code.clone(),
            instance_id: self.instance_id,
            total_players: self.room.total_players(),
            phase: self.room.phase(),
            terminated,
        };
        if self.lifecycle_tx.send(msg).await.is_err() {
            warn!("registry is gone; lifecycle message dropped");
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn forward_presence(mut presence: PresenceSubscription, inbox: mpsc::Sender<RoomEvent>) {
    while let Some(msg) = presence.recv().await {
        let player_id = msg.client_id.to_string();
        let event = match msg.action {
            PresenceAction::Enter => {
                let data: RoomPresenceData = serde_json::from_value(msg.data).unwrap_or_default();
                RoomEvent::PresenceEnter {
                    player_id,
                    nickname: data.nickname,
                }
            }
            PresenceAction::Leave => RoomEvent::PresenceLeave { player_id },
        };
        if inbox.send(event).await.is_err() {
            break;
        }
    }
}

async fn forward_intents(
    mut intents: Subscription,
    player_id: Arc<str>,
    inbox: mpsc::Sender<RoomEvent>,
) {
    while let Some(envelope) = intents.recv().await {
        // Only the channel owner may speak for the player.
        if envelope.client_id != player_id {
            debug!(%player_id, sender = %envelope.client_id, "foreign intent dropped");
            continue;
        }
        let intent = match parse_intent(envelope.data) {
            Ok(intent) => intent,
            Err(err) => {
                debug!(%player_id, error = %err, "invalid intent dropped");
                continue;
            }
        };
        let event = RoomEvent::Intent {
            player_id: player_id.to_string(),
            intent,
        };
        if inbox.send(event).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Intent, Phase, RoomSnapshot};
    use crate::interface_adapters::protocol::{intent_payload, parse_snapshot};
    use serde_json::json;

    const ROOM: &str = "room-a";

    fn spawn(bus: &Bus) -> (RoomHandle, JoinHandle<()>, mpsc::Receiver<LifecycleMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let (handle, join) =
            spawn_coordinator(bus, ROOM, "h", &CoordinatorSettings::default(), tx).expect("spawn");
        (handle, join, rx)
    }

    async fn snapshot_where(
        states: &mut Subscription,
        pred: impl Fn(&RoomSnapshot) -> bool,
    ) -> RoomSnapshot {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(5), states.recv())
                .await
                .expect("snapshot in time")
                .expect("channel open");
            let snapshot = parse_snapshot(envelope.data).expect("snapshot");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_room_terminates_after_timeout() {
        let bus = Bus::new(64);
        let (_handle, join, mut lifecycle) = spawn(&bus);

        assert!(!lifecycle.recv().await.expect("created").terminated);
        join.await.expect("coordinator exits");

        let last = lifecycle.recv().await.expect("terminated");
        assert!(last.terminated);
        assert!(!bus.is_active(&room_channel(ROOM)));
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_channel_owner_can_speak_for_a_player() {
        let bus = Bus::new(64);
        let observer = bus.connect("observer");
        let mut states = observer
            .subscribe(&room_channel(ROOM), ROOM_STATE_EVENT)
            .expect("observe");
        let (_handle, _join, _lifecycle) = spawn(&bus);

        let host = bus.connect("h");
        host.presence_enter(&room_channel(ROOM), json!({"nickname": "Hana"}))
            .expect("enter");
        snapshot_where(&mut states, |s| s.players.contains_key("h")).await;

        let intruder = bus.connect("p9");
        intruder
            .publish(
                &player_channel(ROOM, "h"),
                INTENT_EVENT,
                intent_payload(Intent::StartGame),
            )
            .expect("publish");
        for _ in 0..3 {
            let snapshot = snapshot_where(&mut states, |_| true).await;
            assert_eq!(snapshot.phase, Phase::Waiting);
        }

        host.publish(
            &player_channel(ROOM, "h"),
            INTENT_EVENT,
            intent_payload(Intent::StartGame),
        )
        .expect("publish");
        snapshot_where(&mut states, |s| s.phase == Phase::Running).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_broadcasts_do_not_age_tombstones() {
        let bus = Bus::new(64);
        let observer = bus.connect("observer");
        let mut states = observer
            .subscribe(&room_channel(ROOM), ROOM_STATE_EVENT)
            .expect("observe");
        let (_handle, _join, _lifecycle) = spawn(&bus);

        let host = bus.connect("h");
        host.presence_enter(&room_channel(ROOM), json!({}))
            .expect("enter");
        let p1 = bus.connect("p1");
        p1.presence_enter(&room_channel(ROOM), json!({}))
            .expect("enter");
        snapshot_where(&mut states, |s| s.total_players == 2).await;

        drop(p1);
        snapshot_where(&mut states, |s| {
            s.players.get("p1").is_some_and(|p| !p.is_connected)
        })
        .await;

        bus.set_available(false);
        tokio::time::sleep(Duration::from_millis(550)).await;
        bus.set_available(true);

        let next = snapshot_where(&mut states, |_| true).await;
        assert!(next.players.get("p1").is_some_and(|p| !p.is_connected));
        let after = snapshot_where(&mut states, |_| true).await;
        assert!(!after.players.contains_key("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_and_reports() {
        let bus = Bus::new(64);
        let (handle, join, mut lifecycle) = spawn(&bus);
        let host = bus.connect("h");
        host.presence_enter(&room_channel(ROOM), json!({}))
            .expect("enter");

        handle.shutdown();
        join.await.expect("coordinator exits");

        let mut last = None;
        while let Ok(msg) = lifecycle.try_recv() {
            last = Some(msg);
        }
        let last = last.expect("lifecycle messages");
        assert!(last.terminated);
        assert_eq!(last.instance_id, handle.instance_id);
    }
}
