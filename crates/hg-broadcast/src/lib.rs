//! Real-time broadcast hub
//!
//! Observers hold a connection (a bounded channel handed to the transport)
//! and join named rooms. Each room keeps a bounded replay buffer of its most
//! recent messages.
//!
//! A room's mutex covers both "append to buffer + send to members" and
//! "replay buffer + add member", so a subscriber racing a broadcast sees
//! every buffered message exactly once: either in its replay or live.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hg_common::SharedClock;
use hg_config::BroadcastSettings;

pub mod message;

pub use message::{BroadcastMessage, MessagePriority};

pub const ROOM_API_STATUS: &str = "api_status_updates";
pub const ROOM_WEBHOOK_EVENTS: &str = "webhook_events";
pub const ROOM_COST_MONITORING: &str = "cost_monitoring";

pub type Delivery = Arc<BroadcastMessage>;

/// Rooms one connection may join at once
pub const MAX_ROOMS_PER_CONNECTION: usize = 32;
/// Unacknowledged critical messages kept per connection; oldest evicted first
pub const MAX_PENDING_ACKS: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Connection {0} is not keeping up; message dropped")]
    Backpressure(String),

    #[error("Connection {0} is closed")]
    Closed(String),

    #[error("Connection {0} has joined too many rooms")]
    TooManyRooms(String),
}

pub type Result<T> = std::result::Result<T, HubError>;

/// Per-connection bookkeeping as seen by monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub role: Option<String>,
    pub rooms: BTreeSet<String>,
    pub last_activity_at: DateTime<Utc>,
    pub stale: bool,
    pub pending_acks: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub buffered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: usize,
    pub stale_connections: usize,
    pub rooms: usize,
    pub pending_acks: usize,
}

struct Connection {
    sender: mpsc::Sender<Delivery>,
    role: Option<String>,
    rooms: BTreeSet<String>,
    last_activity_at: DateTime<Utc>,
    stale: bool,
    /// Critical messages delivered but not yet acknowledged, by message id
    pending_acks: BTreeMap<String, Delivery>,
}

#[derive(Default)]
struct Room {
    buffer: VecDeque<Delivery>,
    members: BTreeSet<String>,
}

impl Room {
    /// Nobody listening and nothing left to replay
    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.members.is_empty() && !self.buffer.iter().any(|m| m.is_deliverable(now))
    }
}

pub struct RealtimeBroadcastHub {
    settings: BroadcastSettings,
    clock: SharedClock,
    connections: DashMap<String, Connection>,
    rooms: DashMap<String, Arc<Mutex<Room>>>,
}

impl RealtimeBroadcastHub {
    pub fn new(settings: BroadcastSettings, clock: SharedClock) -> Self {
        Self {
            settings,
            clock,
            connections: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.settings
    }

    /// Build a message stamped with the hub clock and default TTL
    pub fn message(
        &self,
        room: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
        priority: MessagePriority,
    ) -> BroadcastMessage {
        BroadcastMessage::new(
            room,
            message_type,
            payload,
            priority,
            Duration::from_secs(self.settings.default_ttl_secs),
            self.clock.now(),
        )
    }

    /// Drop a room once it is idle. Room creation and removal both go through
    /// the map's shard lock, so a concurrent subscribe or broadcast never
    /// lands in a room that has already been removed.
    fn prune_room(&self, room_name: &str) {
        let now = self.clock.now();
        if self.rooms.remove_if(room_name, |_, room| room.lock().is_idle(now)).is_some() {
            debug!(room = %room_name, "Idle room removed");
        }
    }

    /// Register a connection. Reconnecting with the same id replaces the old
    /// channel and drops its room memberships.
    pub fn connect(&self, connection_id: impl Into<String>, role: Option<String>) -> mpsc::Receiver<Delivery> {
        let connection_id = connection_id.into();
        if self.connections.contains_key(&connection_id) {
            self.disconnect(&connection_id);
        }

        let (sender, receiver) = mpsc::channel(self.settings.connection_capacity.max(1));
        self.connections.insert(
            connection_id.clone(),
            Connection {
                sender,
                role: role.clone(),
                rooms: BTreeSet::new(),
                last_activity_at: self.clock.now(),
                stale: false,
                pending_acks: BTreeMap::new(),
            },
        );
        debug!(connection_id = %connection_id, role = ?role, "Connection registered");
        receiver
    }

    /// Forget a connection, its memberships and its pending acknowledgements
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return false;
        };
        for room_name in &connection.rooms {
            if let Some(room) = self.rooms.get(room_name).map(|r| r.clone()) {
                room.lock().members.remove(connection_id);
            }
            self.prune_room(room_name);
        }
        if !connection.pending_acks.is_empty() {
            warn!(
                connection_id = %connection_id,
                unacknowledged = connection.pending_acks.len(),
                "Connection closed with unacknowledged critical messages"
            );
        }
        debug!(connection_id = %connection_id, "Connection removed");
        true
    }

    /// Join a room. Buffered, still-deliverable messages are replayed in
    /// their original order before any live message. Returns the replay count.
    pub fn subscribe(&self, connection_id: &str, room_name: &str) -> Result<usize> {
        match self.connections.get(connection_id) {
            None => return Err(HubError::UnknownConnection(connection_id.to_string())),
            Some(connection) => {
                if !connection.rooms.contains(room_name) && connection.rooms.len() >= MAX_ROOMS_PER_CONNECTION {
                    return Err(HubError::TooManyRooms(connection_id.to_string()));
                }
            }
        }

        let entry = self.rooms.entry(room_name.to_string()).or_default();
        let now = self.clock.now();
        let mut room = entry.lock();

        if room.members.contains(connection_id) {
            return Ok(0);
        }

        let mut replayed = 0;
        for message in room.buffer.iter().filter(|m| m.is_deliverable(now)) {
            match self.deliver(connection_id, message) {
                Ok(()) => replayed += 1,
                Err(e) => {
                    warn!(connection_id = %connection_id, room = %room_name, error = %e, "Replay interrupted");
                    break;
                }
            }
        }
        room.members.insert(connection_id.to_string());
        drop(room);
        drop(entry);

        if let Some(mut connection) = self.connections.get_mut(connection_id) {
            connection.rooms.insert(room_name.to_string());
            connection.last_activity_at = now;
            connection.stale = false;
        }

        debug!(connection_id = %connection_id, room = %room_name, replayed = replayed, "Subscribed");
        Ok(replayed)
    }

    pub fn unsubscribe(&self, connection_id: &str, room_name: &str) -> bool {
        let removed = match self.rooms.get(room_name).map(|r| r.clone()) {
            Some(room) => room.lock().members.remove(connection_id),
            None => false,
        };
        if let Some(mut connection) = self.connections.get_mut(connection_id) {
            connection.rooms.remove(room_name);
        }
        self.prune_room(room_name);
        removed
    }

    /// Buffer a message in its room and deliver it to current members.
    ///
    /// Expired non-critical messages are dropped silently and never buffered.
    pub fn broadcast(&self, message: BroadcastMessage) -> BroadcastReport {
        let now = self.clock.now();
        if !message.is_deliverable(now) {
            debug!(message_id = %message.id, room = %message.room, "Expired before broadcast, dropped");
            return BroadcastReport::default();
        }

        let message = Arc::new(message);
        let entry = self.rooms.entry(message.room.clone()).or_default();
        let mut room = entry.lock();

        room.buffer.retain(|m| m.is_deliverable(now));
        while room.buffer.len() >= self.settings.replay_buffer_size.max(1) {
            room.buffer.pop_front();
        }
        room.buffer.push_back(message.clone());

        let mut report = BroadcastReport {
            buffered: true,
            ..Default::default()
        };
        let mut gone = Vec::new();
        for member in &room.members {
            match self.deliver(member, &message) {
                Ok(()) => report.delivered += 1,
                Err(HubError::UnknownConnection(id)) => gone.push(id),
                Err(e) => {
                    report.dropped += 1;
                    warn!(connection_id = %member, room = %message.room, error = %e, "Broadcast delivery dropped");
                }
            }
        }
        // Members whose connection went away mid-subscribe
        for id in gone {
            room.members.remove(&id);
        }
        report
    }

    /// Direct message to one connection; not buffered
    pub fn send_to_connection(&self, connection_id: &str, message: BroadcastMessage) -> Result<()> {
        if !message.is_deliverable(self.clock.now()) {
            return Ok(());
        }
        self.deliver(connection_id, &Arc::new(message))
    }

    /// Direct message to every connection registered with `role`; not buffered
    pub fn send_to_group(&self, role: &str, message: BroadcastMessage) -> usize {
        if !message.is_deliverable(self.clock.now()) {
            return 0;
        }
        let targets: Vec<String> = self
            .connections
            .iter()
            .filter(|c| c.role.as_deref() == Some(role))
            .map(|c| c.key().clone())
            .collect();

        let message = Arc::new(message);
        targets
            .iter()
            .filter(|id| self.deliver(id, &message).is_ok())
            .count()
    }

    fn deliver(&self, connection_id: &str, message: &Delivery) -> Result<()> {
        let mut connection = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.to_string()))?;

        connection.sender.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::Backpressure(connection_id.to_string()),
            mpsc::error::TrySendError::Closed(_) => HubError::Closed(connection_id.to_string()),
        })?;

        if message.is_critical() {
            connection.pending_acks.insert(message.id.clone(), message.clone());
            if connection.pending_acks.len() > MAX_PENDING_ACKS {
                let oldest = connection
                    .pending_acks
                    .values()
                    .min_by_key(|m| m.created_at)
                    .map(|m| m.id.clone());
                if let Some(oldest) = oldest {
                    connection.pending_acks.remove(&oldest);
                    warn!(
                        connection_id = %connection_id,
                        message_id = %oldest,
                        "Pending acknowledgements full, oldest dropped"
                    );
                }
            }
        }
        Ok(())
    }

    /// Record the observer's acknowledgement of a critical message
    pub fn acknowledge(&self, connection_id: &str, message_id: &str) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(mut connection) => {
                connection.last_activity_at = self.clock.now();
                connection.stale = false;
                connection.pending_acks.remove(message_id).is_some()
            }
            None => false,
        }
    }

    pub fn pending_acks(&self, connection_id: &str) -> Vec<Delivery> {
        self.connections
            .get(connection_id)
            .map(|c| {
                let mut pending: Vec<Delivery> = c.pending_acks.values().cloned().collect();
                pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                pending
            })
            .unwrap_or_default()
    }

    /// Any inbound traffic (pong, ack, command) counts as liveness
    pub fn touch(&self, connection_id: &str) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(mut connection) => {
                connection.last_activity_at = self.clock.now();
                connection.stale = false;
                true
            }
            None => false,
        }
    }

    /// Send a heartbeat to every connection and flag the silent ones.
    /// Returns the ids newly flagged stale.
    pub fn heartbeat(&self) -> Vec<String> {
        let ids: Vec<String> = self.connections.iter().map(|c| c.key().clone()).collect();
        for id in &ids {
            let ping = self.message("", "heartbeat", Value::Null, MessagePriority::Low);
            if let Err(e) = self.deliver(id, &Arc::new(ping)) {
                debug!(connection_id = %id, error = %e, "Heartbeat not delivered");
            }
        }
        self.sweep_stale()
    }

    /// Flag connections silent for longer than the stale threshold. Flagged
    /// connections stay registered; closing them is the transport's call.
    pub fn sweep_stale(&self) -> Vec<String> {
        let now = self.clock.now();
        let threshold = chrono::Duration::seconds(self.settings.stale_after_secs as i64);
        let mut flagged = Vec::new();

        for mut connection in self.connections.iter_mut() {
            if !connection.stale && now - connection.last_activity_at > threshold {
                connection.stale = true;
                flagged.push(connection.key().clone());
            }
        }
        self.rooms.retain(|_, room| !room.lock().is_idle(now));

        if !flagged.is_empty() {
            flagged.sort();
            info!(connections = ?flagged, "Connections flagged stale");
        }
        flagged
    }

    pub fn connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|c| ConnectionInfo {
            connection_id: c.key().clone(),
            role: c.role.clone(),
            rooms: c.rooms.clone(),
            last_activity_at: c.last_activity_at,
            stale: c.stale,
            pending_acks: c.pending_acks.len(),
        })
    }

    pub fn room_members(&self, room_name: &str) -> Vec<String> {
        self.rooms
            .get(room_name)
            .map(|r| r.clone())
            .map(|room| room.lock().members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Buffered messages of a room that could still be replayed
    pub fn buffered(&self, room_name: &str) -> Vec<Delivery> {
        let now = self.clock.now();
        self.rooms
            .get(room_name)
            .map(|r| r.clone())
            .map(|room| {
                room.lock()
                    .buffer
                    .iter()
                    .filter(|m| m.is_deliverable(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            rooms: self.rooms.len(),
            ..Default::default()
        };
        for connection in self.connections.iter() {
            stats.connections += 1;
            if connection.stale {
                stats.stale_connections += 1;
            }
            stats.pending_acks += connection.pending_acks.len();
        }
        stats
    }
}
