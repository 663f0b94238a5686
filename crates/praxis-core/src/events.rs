//! Change events, stream framing, subscription filtering, and the event bus.
//!
//! A committed row mutation in PostgreSQL surfaces here as a [`ChangeEvent`]:
//! entity kind, action, record id, optional owning project id, and the
//! commit-side timestamp. Events are deliberately minimal. They point at
//! state rather than copying it, so consumers re-fetch the full record by id
//! when they need current data and staleness cannot produce inconsistency.
//!
//! The [`EventBus`] aggregates decoded events into a single broadcast
//! channel. Downstream consumers (WebSocket fan-out, SSE) subscribe
//! independently.
//!
//! ## Wire Format
//!
//! Change notifications and delivered change frames share one JSON shape:
//!
//! ```text
//! {"entity":"tasks","action":"insert","id":"<uuid>","projectId":"<uuid or null>","at":"2025-10-30T21:00:00.000Z"}
//! ```
//!
//! `at` is always ISO-8601 UTC with millisecond precision. Frames delivered
//! to clients add a `type` discriminator ("change" or "system"); see
//! [`StreamMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Entities & actions
// ============================================================================

/// The closed set of tracked domain entities.
///
/// Wire tags are the lowercase plural names (`"tasks"`, `"decisions"`, ...).
/// Each entity is backed by one database table; table names differ from the
/// wire tags (a table named for the decision log concept carries `decisions`
/// events), so [`Entity::from_tag`] accepts both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Projects,
    Contexts,
    Tasks,
    Decisions,
    Naming,
    Sessions,
}

impl Entity {
    /// Every tracked entity, in stable order.
    pub const ALL: [Entity; 6] = [
        Entity::Projects,
        Entity::Contexts,
        Entity::Tasks,
        Entity::Decisions,
        Entity::Naming,
        Entity::Sessions,
    ];

    /// Canonical wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Projects => "projects",
            Entity::Contexts => "contexts",
            Entity::Tasks => "tasks",
            Entity::Decisions => "decisions",
            Entity::Naming => "naming",
            Entity::Sessions => "sessions",
        }
    }

    /// Name of the database table backing this entity.
    pub fn table(&self) -> &'static str {
        match self {
            Entity::Projects => "project",
            Entity::Contexts => "context_entry",
            Entity::Tasks => "work_item",
            Entity::Decisions => "decision_log",
            Entity::Naming => "naming_entry",
            Entity::Sessions => "agent_session",
        }
    }

    /// Resolve a wire tag or raw table name to an entity.
    ///
    /// Accepts both forms so the ingestion path tolerates notifications from
    /// a trigger that fell back to emitting the raw table name.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "projects" | "project" => Some(Entity::Projects),
            "contexts" | "context_entry" => Some(Entity::Contexts),
            "tasks" | "work_item" => Some(Entity::Tasks),
            "decisions" | "decision_log" => Some(Entity::Decisions),
            "naming" | "naming_entry" => Some(Entity::Naming),
            "sessions" | "agent_session" => Some(Entity::Sessions),
            _ => None,
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-level mutation kind, matching the database trigger's TG_OP (lowercased).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    /// Canonical wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Resolve a wire tag to an action.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "insert" => Some(Action::Insert),
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Change events
// ============================================================================

/// Timestamp (de)serialization for the wire format: ISO-8601 UTC with
/// millisecond precision and a trailing `Z` (e.g. `2025-10-30T21:00:00.000Z`).
mod wire_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// The canonical unit propagated through the system: one committed row
/// mutation on a tracked table.
///
/// `projectId` is always present on the wire, `null` for scopeless entities
/// (a session, for example, belongs to no project). `payload` is an optional
/// small hint fragment; it is never the full record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: Entity,
    pub action: Action,
    /// Identifier of the affected record, opaque to this layer.
    pub id: String,
    /// Owning project scope, if the entity has one.
    #[serde(rename = "projectId", default)]
    pub project_id: Option<String>,
    /// When the producing transaction committed, not when the event was
    /// delivered.
    #[serde(with = "wire_time")]
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Untyped shape of a raw channel notification, prior to validation.
#[derive(Deserialize)]
struct RawChange {
    entity: String,
    action: String,
    id: String,
    #[serde(rename = "projectId", default)]
    project_id: Option<String>,
    at: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

impl ChangeEvent {
    /// Decode and validate a raw channel payload.
    ///
    /// This is the normalization step on the listener's ingestion path:
    /// entity tags are resolved through the table-alias mapping, the action
    /// must be one of insert/update/delete, and the record id must be
    /// non-empty. Anything else is a [`Error::Decode`]; callers log and drop
    /// the payload rather than propagate it.
    pub fn from_wire(raw: &str) -> Result<Self> {
        let raw: RawChange =
            serde_json::from_str(raw).map_err(|e| Error::Decode(format!("invalid JSON: {e}")))?;

        let entity = Entity::from_tag(&raw.entity)
            .ok_or_else(|| Error::Decode(format!("unknown entity tag: {:?}", raw.entity)))?;
        let action = Action::from_tag(&raw.action)
            .ok_or_else(|| Error::Decode(format!("unknown action tag: {:?}", raw.action)))?;
        if raw.id.is_empty() {
            return Err(Error::Decode("empty record id".to_string()));
        }
        let at = DateTime::parse_from_rfc3339(&raw.at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Decode(format!("bad timestamp {:?}: {e}", raw.at)))?;

        Ok(ChangeEvent {
            entity,
            action,
            id: raw.id,
            project_id: raw.project_id,
            at,
            payload: raw.payload,
        })
    }
}

// ============================================================================
// Stream framing
// ============================================================================

/// One frame delivered over a streaming transport (WebSocket message body or
/// SSE data line).
///
/// The `type` discriminator separates connection-level notices from domain
/// events, so clients can match exhaustively instead of sniffing fields:
///
/// ```text
/// {"type":"system","event":"connected","connectionId":"...","at":"..."}
/// {"type":"change","entity":"tasks","action":"insert","id":"...","projectId":null,"at":"..."}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    /// Connection-level notice, not a domain event.
    System {
        event: String,
        #[serde(
            rename = "connectionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        connection_id: Option<Uuid>,
        #[serde(with = "wire_time")]
        at: DateTime<Utc>,
    },
    /// A domain change event.
    Change(ChangeEvent),
}

impl StreamMessage {
    /// The handshake acknowledgement sent once per accepted connection.
    pub fn connected(connection_id: Uuid) -> Self {
        StreamMessage::System {
            event: "connected".to_string(),
            connection_id: Some(connection_id),
            at: Utc::now(),
        }
    }

    /// Frame kind, usable as an SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::System { .. } => "system",
            StreamMessage::Change(_) => "change",
        }
    }
}

impl From<ChangeEvent> for StreamMessage {
    fn from(event: ChangeEvent) -> Self {
        StreamMessage::Change(event)
    }
}

// ============================================================================
// Subscription filter
// ============================================================================

/// Per-connection delivery filter.
///
/// Deliver when the event's entity is in the allow-list (an empty list means
/// every entity) AND the scopes are compatible: a filter without a project
/// id matches any event, and an event without a project id matches any
/// filter. The same rule serves global admin views and project-focused views
/// with one mechanism.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Entity allow-list. Empty means all entities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
    /// Owning project scope. None matches any scope.
    #[serde(rename = "projectId", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl SubscriptionFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given entities (still any scope).
    pub fn for_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        Self {
            entities: entities.into_iter().collect(),
            project_id: None,
        }
    }

    /// Restrict to one project scope.
    pub fn scoped(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Decide whether `event` should be delivered through this filter.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let entity_ok = self.entities.is_empty() || self.entities.contains(&event.entity);
        let scope_ok = match (&self.project_id, &event.project_id) {
            (None, _) | (_, None) => true,
            (Some(mine), Some(theirs)) => mine == theirs,
        };
        entity_ok && scope_ok
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus distributing change events to multiple consumers.
///
/// Uses `tokio::sync::broadcast` with a configurable buffer size. Slow
/// receivers that fall behind get a `Lagged` error and miss events; for a
/// real-time stream freshness matters more than completeness, and consumers
/// reconcile by re-fetching state.
pub struct EventBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn emit(&self, event: ChangeEvent) {
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            entity = %event.entity,
            action = %event.action,
            id = %event.id,
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to receive events. Each subscriber gets its own independent
    /// stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ============================================================================
// Tests
// ============================================================================
