//! Broadcast messages and their wire frame

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Advisory for consumers. The hub never reorders by priority; only
/// `Critical` changes delivery rules (no TTL drop, acknowledgement tracked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub id: String,
    pub room: String,
    pub message_type: String,
    pub payload: Value,
    pub priority: MessagePriority,
    pub created_at: DateTime<Utc>,
    #[serde(with = "ttl_secs")]
    pub ttl: Duration,
}

impl BroadcastMessage {
    pub fn new(
        room: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
        priority: MessagePriority,
        ttl: Duration,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            room: room.into(),
            message_type: message_type.into(),
            payload,
            priority,
            created_at,
            ttl,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.priority == MessagePriority::Critical
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Deliverable at `now`: not expired, or critical
    pub fn is_deliverable(&self, now: DateTime<Utc>) -> bool {
        self.is_critical() || !self.is_expired(now)
    }

    /// Observer-facing frame: `{type, data, priority, timestamp}` plus routing ids
    pub fn to_frame(&self) -> Value {
        json!({
            "id": self.id,
            "room": self.room,
            "type": self.message_type,
            "data": self.payload,
            "priority": self.priority,
            "timestamp": self.created_at.to_rfc3339(),
            "requiresAck": self.is_critical(),
        })
    }
}

mod ttl_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(ttl.as_secs())
    }
}
