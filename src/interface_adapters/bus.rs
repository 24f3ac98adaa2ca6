// In-process pub/sub with presence. Dropping a `Connection` detaches every
// channel it attached and leaves presence everywhere it entered.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The substrate refused the operation (models a transport outage).
    #[error("messaging substrate unavailable")]
    Unavailable,
    /// The connection was closed and can no longer be used.
    #[error("connection closed")]
    Closed,
}

/// A message published on a channel.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub channel: Arc<str>,
    pub name: Arc<str>,
    pub client_id: Arc<str>,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Enter,
    Leave,
}

#[derive(Debug, Clone)]
pub struct PresenceMessage {
    pub channel: Arc<str>,
    pub action: PresenceAction,
    pub client_id: Arc<str>,
    pub data: Value,
}

struct ChannelSlot {
    messages: broadcast::Sender<Envelope>,
    presence: broadcast::Sender<PresenceMessage>,
    // Presence members and the data they entered with.
    members: HashMap<Arc<str>, Value>,
    // Connections currently attached.
    attached: HashSet<Arc<str>>,
}

impl ChannelSlot {
    fn new(capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        Self {
            messages,
            presence,
            members: HashMap::new(),
            attached: HashSet::new(),
        }
    }

    fn is_unused(&self) -> bool {
        self.members.is_empty() && self.attached.is_empty()
    }
}

struct BusInner {
    capacity: usize,
    available: AtomicBool,
    channels: Mutex<HashMap<Arc<str>, ChannelSlot>>,
}

/// Cheaply cloneable handle to the shared substrate.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// `capacity` bounds each channel's queue before slow subscribers lag.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                available: AtomicBool::new(true),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn connect(&self, client_id: impl Into<Arc<str>>) -> Connection {
        Connection {
            bus: self.clone(),
            client_id: client_id.into(),
            attached: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Toggles fault injection: while unavailable, publishing and entering
    /// presence fail with [`BusError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// True while any connection is attached to or present on `channel`.
    pub fn is_active(&self, channel: &str) -> bool {
        self.channels().contains_key(channel)
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    pub fn presence_members(&self, channel: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .channels()
            .get(channel)
            .map(|slot| slot.members.keys().map(|id| id.to_string()).collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<Arc<str>, ChannelSlot>> {
        // Critical sections never panic mid-update, so a poisoned map is still consistent.
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Message subscription, optionally filtered by event name.
pub struct Subscription {
    channel: Arc<str>,
    event: Option<Arc<str>>,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Next matching message, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    let matches = self
                        .event
                        .as_deref()
                        .is_none_or(|event| event == &*envelope.name);
                    if matches {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(channel = %self.channel, missed, "subscriber lagged; skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct PresenceSubscription {
    channel: Arc<str>,
    rx: broadcast::Receiver<PresenceMessage>,
}

impl PresenceSubscription {
    pub async fn recv(&mut self) -> Option<PresenceMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(channel = %self.channel, missed, "presence subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// One participant on the bus.
pub struct Connection {
    bus: Bus,
    client_id: Arc<str>,
    attached: Mutex<HashSet<Arc<str>>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publishes to every current subscriber of `channel`. Returns how many
    /// subscribers the message reached; zero is not an error.
    pub fn publish(&self, channel: &str, name: &str, data: Value) -> Result<usize, BusError> {
        self.ensure_usable()?;
        let channels = self.bus.channels();
        let Some(slot) = channels.get(channel) else {
            return Ok(0);
        };
        let envelope = Envelope {
            channel: Arc::from(channel),
            name: Arc::from(name),
            client_id: self.client_id.clone(),
            data,
        };
        Ok(slot.messages.send(envelope).unwrap_or(0))
    }

    /// Subscribes to messages named `event` on `channel`.
    pub fn subscribe(&self, channel: &str, event: &str) -> Result<Subscription, BusError> {
        self.subscribe_filtered(channel, Some(Arc::from(event)))
    }

    pub fn subscribe_all(&self, channel: &str) -> Result<Subscription, BusError> {
        self.subscribe_filtered(channel, None)
    }

    fn subscribe_filtered(
        &self,
        channel: &str,
        event: Option<Arc<str>>,
    ) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let channel: Arc<str> = Arc::from(channel);
        let rx = self.with_attached_slot(&channel, |slot| slot.messages.subscribe());
        Ok(Subscription { channel, event, rx })
    }

    pub fn presence_subscribe(&self, channel: &str) -> Result<PresenceSubscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let channel: Arc<str> = Arc::from(channel);
        let rx = self.with_attached_slot(&channel, |slot| slot.presence.subscribe());
        Ok(PresenceSubscription { channel, rx })
    }

    /// Enters presence on `channel`. Entering twice is not re-announced.
    pub fn presence_enter(&self, channel: &str, data: Value) -> Result<(), BusError> {
        self.ensure_usable()?;
        let channel: Arc<str> = Arc::from(channel);
        let client_id = self.client_id.clone();
        self.with_attached_slot(&channel, |slot| {
            if slot.members.contains_key(&client_id) {
                return;
            }
            slot.members.insert(client_id.clone(), data.clone());
            let _ = slot.presence.send(PresenceMessage {
                channel: channel.clone(),
                action: PresenceAction::Enter,
                client_id,
                data,
            });
        });
        Ok(())
    }

    /// Leaves presence on `channel` while staying attached.
    #[cfg(test)]
    pub fn presence_leave(&self, channel: &str) {
        let mut channels = self.bus.channels();
        if let Some(slot) = channels.get_mut(channel) {
            leave_slot(slot, channel, &self.client_id);
        }
    }

    /// Leaves presence and stops receiving on `channel`. Existing
    /// subscriptions end once nobody else keeps the channel alive.
    pub fn detach(&self, channel: &str) {
        self.attached_set().remove(channel);
        let mut channels = self.bus.channels();
        let Some(slot) = channels.get_mut(channel) else {
            return;
        };
        leave_slot(slot, channel, &self.client_id);
        slot.attached.remove(&self.client_id);
        if slot.is_unused() {
            channels.remove(channel);
            debug!(channel, "channel released");
        }
    }

    /// Detaches every channel. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let attached: Vec<Arc<str>> = self.attached_set().iter().cloned().collect();
        for channel in attached {
            self.detach(&channel);
        }
    }

    fn ensure_usable(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if !self.bus.is_available() {
            return Err(BusError::Unavailable);
        }
        Ok(())
    }

    fn with_attached_slot<T>(&self, channel: &Arc<str>, f: impl FnOnce(&mut ChannelSlot) -> T) -> T {
        self.attached_set().insert(channel.clone());
        let mut channels = self.bus.channels();
        let capacity = self.bus.inner.capacity;
        let slot = channels
            .entry(channel.clone())
            .or_insert_with(|| ChannelSlot::new(capacity));
        slot.attached.insert(self.client_id.clone());
        f(slot)
    }

    fn attached_set(&self) -> MutexGuard<'_, HashSet<Arc<str>>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn leave_slot(slot: &mut ChannelSlot, channel: &str, client_id: &Arc<str>) {
    if let Some(data) = slot.members.remove(client_id) {
        let _ = slot.presence.send(PresenceMessage {
            channel: Arc::from(channel),
            action: PresenceAction::Leave,
            client_id: client_id.clone(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_filtered_subscribers() {
        let bus = Bus::new(16);
        let alice = bus.connect("alice");
        let bob = bus.connect("bob");
        let mut states = bob.subscribe("room:primary", "room-state").expect("subscribe");

        alice
            .publish("room:primary", "room-ready", json!({}))
            .expect("publish");
        let reached = alice
            .publish("room:primary", "room-state", json!({"n": 1}))
            .expect("publish");

        assert_eq!(reached, 1);
        let envelope = states.recv().await.expect("message");
        assert_eq!(&*envelope.name, "room-state");
        assert_eq!(&*envelope.client_id, "alice");
        assert_eq!(envelope.data, json!({"n": 1}));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = Bus::new(16);
        let alice = bus.connect("alice");

        assert_eq!(alice.publish("nowhere", "x", Value::Null), Ok(0));
        assert!(!bus.is_active("nowhere"));
    }

    #[tokio::test]
    async fn presence_is_announced_once_per_transition() {
        let bus = Bus::new(16);
        let watcher = bus.connect("watcher");
        let mut presence = watcher.presence_subscribe("lobby").expect("presence");
        let host = bus.connect("host");

        host.presence_enter("lobby", json!({"nickname": "Hana"}))
            .expect("enter");
        host.presence_enter("lobby", json!({"nickname": "Hana"}))
            .expect("enter again");
        host.presence_leave("lobby");
        host.presence_leave("lobby");

        let enter = presence.recv().await.expect("enter");
        assert_eq!(enter.action, PresenceAction::Enter);
        assert_eq!(&*enter.client_id, "host");
        let leave = presence.recv().await.expect("leave");
        assert_eq!(leave.action, PresenceAction::Leave);
        assert!(bus.presence_members("lobby").is_empty());

        host.presence_enter("lobby", json!({})).expect("re-enter");
        let again = presence.recv().await.expect("re-enter event");
        assert_eq!(again.action, PresenceAction::Enter);
    }

    #[tokio::test]
    async fn dropping_a_connection_leaves_presence_and_releases_channels() {
        let bus = Bus::new(16);
        let watcher = bus.connect("watcher");
        let mut presence = watcher.presence_subscribe("room:primary").expect("presence");
        let player = bus.connect("p1");
        player
            .presence_enter("room:primary", json!({}))
            .expect("enter");
        let _sub = player.subscribe_all("room:player-ch-p1").expect("subscribe");
        assert!(bus.is_active("room:player-ch-p1"));

        drop(player);

        presence.recv().await.expect("enter");
        let leave = presence.recv().await.expect("leave");
        assert_eq!(leave.action, PresenceAction::Leave);
        assert!(!bus.is_active("room:player-ch-p1"));
        assert!(bus.is_active("room:primary"));

        watcher.detach("room:primary");
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_bus_rejects_publish_and_presence() {
        let bus = Bus::new(16);
        let conn = bus.connect("p1");
        bus.set_available(false);

        assert_eq!(
            conn.publish("room:primary", "x", Value::Null),
            Err(BusError::Unavailable)
        );
        assert_eq!(
            conn.presence_enter("room:primary", Value::Null),
            Err(BusError::Unavailable)
        );

        bus.set_available(true);
        assert!(conn.presence_enter("room:primary", Value::Null).is_ok());
    }

    #[tokio::test]
    async fn closed_connection_cannot_be_reused() {
        let bus = Bus::new(16);
        let conn = bus.connect("p1");
        conn.close();

        assert!(conn.is_closed());
        assert_eq!(conn.publish("c", "x", Value::Null), Err(BusError::Closed));
        assert!(conn.subscribe_all("c").is_err());
    }
}
