// Room registry: spawns coordinators and keeps a display projection of them.

use crate::domain::{Phase, is_valid_room_code};
use crate::interface_adapters::bus::{Bus, Connection, PresenceAction, PresenceSubscription};
use crate::interface_adapters::protocol::{
    HostPresenceData, LOBBY_CHANNEL, ROOM_FAILED_EVENT, RoomFailedDto, room_channel,
};
use crate::use_cases::coordinator::{
    CoordinatorError, CoordinatorSettings, RoomHandle, spawn_coordinator,
};
use crate::use_cases::types::{LifecycleMessage, PlayerTotals, RoomSummary};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REGISTRY_CLIENT_ID: &str = "room-registry";

/// Shared configuration for the registry and the coordinators it spawns.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Maximum number of concurrently active rooms.
    pub max_rooms: usize,
    /// Capacity for coordinator lifecycle messages.
    pub lifecycle_capacity: usize,
    pub coordinator: CoordinatorSettings,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_rooms: 1024,
            lifecycle_capacity: 256,
            coordinator: CoordinatorSettings::default(),
        }
    }
}

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid room code")]
    InvalidRoomCode,
    #[error("room limit of {0} reached")]
    CapacityReached(usize),
    #[error("failed to start room coordinator: {0}")]
    Spawn(#[from] CoordinatorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned,
    /// A coordinator already owns the code; the host was routed into it.
    Existing,
}

struct RoomSlot {
    summary: RoomSummary,
    handle: RoomHandle,
}

/// Directory of active rooms.
pub struct RoomRegistry {
    settings: RegistrySettings,
    bus: Bus,
    /// Room code -> summary and coordinator handle. Never holds room state.
    rooms: RwLock<HashMap<String, RoomSlot>>,
    totals: RwLock<PlayerTotals>,
    lifecycle_tx: mpsc::Sender<LifecycleMessage>,
    room_count_tx: watch::Sender<usize>,
}

impl RoomRegistry {
    /// Creates a registry without background tasks; the caller drives the
    /// returned lifecycle receiver.
    pub fn new(bus: Bus, settings: RegistrySettings) -> (Arc<Self>, mpsc::Receiver<LifecycleMessage>) {
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(settings.lifecycle_capacity.max(1));
        let (room_count_tx, _room_count_rx) = watch::channel(0);
        let registry = Arc::new(Self {
            settings,
            bus,
            rooms: RwLock::new(HashMap::new()),
            totals: RwLock::new(PlayerTotals::default()),
            lifecycle_tx,
            room_count_tx,
        });
        (registry, lifecycle_rx)
    }

    /// Creates a registry and spawns its lifecycle listener and the lobby
    /// presence watcher that turns host announcements into rooms.
    pub fn start(bus: Bus, settings: RegistrySettings) -> Arc<Self> {
        let (registry, lifecycle_rx) = Self::new(bus, settings);
        tokio::spawn(registry.clone().run_lifecycle_listener(lifecycle_rx));

        // Subscribe before returning so no host announcement is missed.
        let conn = registry.bus.connect(REGISTRY_CLIENT_ID);
        match conn.presence_subscribe(LOBBY_CHANNEL) {
            Ok(presence) => {
                tokio::spawn(registry.clone().watch_host_presence(conn, presence));
            }
            Err(err) => error!(error = %err, "failed to watch the lobby channel"),
        }
        registry
    }

    /// Creates a coordinator for `room_code` unless one already exists, in
    /// which case the existing coordinator repeats its readiness signal. A
    /// coordinator that is already shutting down is replaced.
    pub async fn spawn_room_if_absent(
        self: &Arc<Self>,
        host_id: &str,
        room_code: &str,
    ) -> Result<SpawnOutcome, RegistryError> {
        if !is_valid_room_code(room_code) {
            return Err(RegistryError::InvalidRoomCode);
        }

        let mut rooms = self.rooms.write().await;
        let stale = match rooms.get(room_code) {
            Some(slot) if slot.handle.announce() => return Ok(SpawnOutcome::Existing),
            Some(slot) => {
                info!(
                    room_code,
                    instance_id = slot.handle.instance_id,
                    "replacing a room that is shutting down"
                );
                rooms.remove(room_code)
            }
            None => None,
        };
        let spawned = self.insert_coordinator(&mut rooms, host_id, room_code);
        self.room_count_tx.send_replace(rooms.len());
        drop(rooms);

        if let Some(stale) = stale {
            self.release_online(stale.summary.total_players).await;
        }
        let (instance_id, join) = spawned?;
        self.supervise(room_code.to_string(), instance_id, join);
        info!(room_code, host_id, instance_id, "room spawned");
        Ok(SpawnOutcome::Spawned)
    }

    fn insert_coordinator(
        &self,
        rooms: &mut HashMap<String, RoomSlot>,
        host_id: &str,
        room_code: &str,
    ) -> Result<(u64, JoinHandle<()>), RegistryError> {
        if rooms.len() >= self.settings.max_rooms {
            return Err(RegistryError::CapacityReached(self.settings.max_rooms));
        }

        let (handle, join) = spawn_coordinator(
            &self.bus,
            room_code,
            host_id,
            &self.settings.coordinator,
            self.lifecycle_tx.clone(),
        )?;
        let instance_id = handle.instance_id;
        rooms.insert(
            room_code.to_string(),
            RoomSlot {
                summary: RoomSummary {
                    room_code: room_code.to_string(),
                    total_players: 0,
                    phase: Phase::Waiting,
                },
                handle,
            },
        );
        Ok((instance_id, join))
    }

    /// Applies a coordinator lifecycle message to the projection.
    pub async fn on_lifecycle_message(&self, msg: LifecycleMessage) {
        if msg.terminated {
            self.remove_room(&msg.room_code, msg.instance_id).await;
            return;
        }

        let mut rooms = self.rooms.write().await;
        let Some(slot) = rooms.get_mut(&*msg.room_code) else {
            debug!(room_code = %msg.room_code, "lifecycle message for unknown room");
            return;
        };
        if slot.handle.instance_id != msg.instance_id {
            debug!(room_code = %msg.room_code, "stale lifecycle message ignored");
            return;
        }

        let previous = slot.summary.total_players;
        slot.summary.total_players = msg.total_players;
        slot.summary.phase = msg.phase;
        drop(rooms);

        let mut totals = self.totals.write().await;
        if msg.total_players >= previous {
            let joined = msg.total_players - previous;
            totals.online += joined;
            totals.seen += joined as u64;
        } else {
            totals.online = totals.online.saturating_sub(previous - msg.total_players);
        }
    }

    /// Read-only projection sorted by room code.
    pub async fn list_summaries(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.read().await;
        let mut summaries: Vec<RoomSummary> =
            rooms.values().map(|slot| slot.summary.clone()).collect();
        summaries.sort_by(|a, b| a.room_code.cmp(&b.room_code));
        summaries
    }

    pub async fn summary(&self, room_code: &str) -> Option<RoomSummary> {
        let rooms = self.rooms.read().await;
        rooms.get(room_code).map(|slot| slot.summary.clone())
    }

    pub async fn totals(&self) -> PlayerTotals {
        *self.totals.read().await
    }

    /// Signals every coordinator to terminate and waits until all entries
    /// are gone or `timeout` elapses.
    pub async fn shutdown(&self, timeout: Duration) {
        {
            let rooms = self.rooms.read().await;
            for slot in rooms.values() {
                slot.handle.shutdown();
            }
            info!(rooms = rooms.len(), "shutting down rooms");
        }

        let mut count_rx = self.room_count_tx.subscribe();
        let drained = tokio::time::timeout(timeout, count_rx.wait_for(|count| *count == 0)).await;
        if drained.is_err() {
            warn!("rooms still active after shutdown timeout");
        }
    }

    pub async fn run_lifecycle_listener(self: Arc<Self>, mut rx: mpsc::Receiver<LifecycleMessage>) {
        while let Some(msg) = rx.recv().await {
            self.on_lifecycle_message(msg).await;
        }
    }

    /// Spawns a room for every host entering the lobby channel. Failures are
    /// published on the room channel so the host is never left waiting.
    async fn watch_host_presence(self: Arc<Self>, conn: Connection, mut presence: PresenceSubscription) {
        while let Some(msg) = presence.recv().await {
            if msg.action != PresenceAction::Enter {
                continue;
            }
            let data: HostPresenceData = match serde_json::from_value(msg.data) {
                Ok(data) => data,
                Err(err) => {
                    debug!(client_id = %msg.client_id, error = %err, "invalid host presence data");
                    continue;
                }
            };
            if !data.is_host {
                continue;
            }

            match self.spawn_room_if_absent(&msg.client_id, &data.room_code).await {
                Ok(outcome) => {
                    debug!(room_code = %data.room_code, ?outcome, "host announcement handled")
                }
                Err(err) => {
                    warn!(room_code = %data.room_code, error = %err, "room could not be created");
                    let failure = RoomFailedDto {
                        room_code: data.room_code.clone(),
                        reason: err.to_string(),
                    };
                    let published = serde_json::to_value(failure)
                        .map_err(|e| e.to_string())
                        .and_then(|payload| {
                            conn.publish(&room_channel(&data.room_code), ROOM_FAILED_EVENT, payload)
                                .map_err(|e| e.to_string())
                        });
                    if let Err(err) = published {
                        warn!(room_code = %data.room_code, error = %err, "failed to notify host");
                    }
                }
            }
        }
    }

    /// Removes the room when its coordinator task ends. A task that ends
    /// without having sent its termination message leaves an orphan entry
    /// behind; this is where it is cleaned up.
    fn supervise(self: &Arc<Self>, room_code: String, instance_id: u64, join: JoinHandle<()>) {
        let registry = self.clone();
        tokio::spawn(async move {
            match join.await {
                Ok(()) => debug!(%room_code, instance_id, "coordinator exited"),
                Err(err) if err.is_panic() => {
                    error!(%room_code, instance_id, "coordinator crashed; dropping orphaned room")
                }
                Err(err) => warn!(%room_code, instance_id, error = %err, "coordinator cancelled"),
            }
            registry.remove_room(&room_code, instance_id).await;
        });
    }

    async fn remove_room(&self, room_code: &str, instance_id: u64) {
        let mut rooms = self.rooms.write().await;
        let owned = rooms
            .get(room_code)
            .is_some_and(|slot| slot.handle.instance_id == instance_id);
        if !owned {
            return;
        }
        let Some(slot) = rooms.remove(room_code) else {
            return;
        };
        self.room_count_tx.send_replace(rooms.len());
        drop(rooms);

        self.release_online(slot.summary.total_players).await;
        info!(room_code, instance_id, "room removed");
    }

    async fn release_online(&self, players: usize) {
        let mut totals = self.totals.write().await;
        totals.online = totals.online.saturating_sub(players);
    }
}
