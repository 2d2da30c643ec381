//! Item events: the immutable records of a change to an item.
//!
//! The set of event kinds is closed. Consumers match on [`EventBody`] instead
//! of dispatching on type names.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version of [`ItemPayload`].
pub const ITEM_SCHEMA_VERSION: u16 = 1;

/// Current UTC time truncated to microseconds.
///
/// Timestamps produced here survive JSON and storage round trips on any
/// platform clock. Timestamps received from elsewhere keep full precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Unique identifier of one event (and of its broker message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Mint a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive a stable id from a namespace and a name.
    ///
    /// Used where a redelivered input must always map to the same output id.
    pub fn derived(namespace: &Uuid, name: &[u8]) -> Self {
        Self(Uuid::new_v5(namespace, name))
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Event kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Updated,
    Removed,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::Created, EventType::Updated, EventType::Removed];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Removed => "removed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventType::Created),
            "updated" => Ok(EventType::Updated),
            "removed" => Ok(EventType::Removed),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown event type: {0}")]
pub struct UnknownEventType(pub String);

fn default_schema_version() -> u16 {
    ITEM_SCHEMA_VERSION
}

/// Public fields of an item, as published to downstream services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPayload {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    pub id: Uuid,
    #[serde(default)]
    pub seller: String,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub mileage: i32,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reserve_price: i32,
    #[serde(default)]
    pub sold_amount: Option<i32>,
    #[serde(default)]
    pub current_high_bid: Option<i32>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub auction_end: Option<DateTime<Utc>>,
}

impl ItemPayload {
    /// Overlay the mutable fields of a patch onto this payload.
    pub fn apply_patch(&mut self, patch: &ItemPatch) {
        self.make = patch.make.clone();
        self.model = patch.model.clone();
        self.color = patch.color.clone();
        self.year = patch.year;
        self.mileage = patch.mileage;
        self.updated_at = patch.updated_at;
    }

    /// Build a payload that only knows what a patch carries.
    pub fn from_patch(patch: &ItemPatch) -> Self {
        let mut payload = Self {
            schema_version: ITEM_SCHEMA_VERSION,
            id: patch.id,
            ..Default::default()
        };
        payload.apply_patch(patch);
        payload
    }
}

/// The fields an item update may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    pub id: Uuid,
    pub make: String,
    pub model: String,
    pub color: String,
    pub year: i32,
    pub mileage: i32,
    pub updated_at: DateTime<Utc>,
}

impl ItemPatch {
    pub fn from_payload(payload: &ItemPayload) -> Self {
        Self {
            id: payload.id,
            make: payload.make.clone(),
            model: payload.model.clone(),
            color: payload.color.clone(),
            year: payload.year,
            mileage: payload.mileage,
            updated_at: payload.updated_at,
        }
    }
}

/// Event content, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum EventBody {
    Created(ItemPayload),
    Updated(ItemPatch),
    Removed { id: Uuid },
}

impl EventBody {
    pub fn event_type(&self) -> EventType {
        match self {
            EventBody::Created(_) => EventType::Created,
            EventBody::Updated(_) => EventType::Updated,
            EventBody::Removed { .. } => EventType::Removed,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            EventBody::Created(item) => item.id,
            EventBody::Updated(patch) => patch.id,
            EventBody::Removed { id } => *id,
        }
    }
}

/// Immutable record of one item change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: EventId,
    pub entity_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub body: EventBody,
}

impl Event {
    pub fn new(body: EventBody) -> Self {
        Self {
            event_id: EventId::new(),
            entity_id: body.entity_id(),
            occurred_at: now(),
            body,
        }
    }

    pub fn created(item: ItemPayload) -> Self {
        Self::new(EventBody::Created(item))
    }

    pub fn updated(patch: ItemPatch) -> Self {
        Self::new(EventBody::Updated(patch))
    }

    pub fn removed(id: Uuid) -> Self {
        Self::new(EventBody::Removed { id })
    }

    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }

    /// A new delivery of a corrected body under a different id.
    ///
    /// The original event is left untouched; the returned event is a distinct
    /// record for the same entity.
    pub fn redelivered_with(&self, event_id: EventId, body: EventBody) -> Self {
        Self {
            event_id,
            entity_id: self.entity_id,
            occurred_at: now(),
            body,
        }
    }
}
