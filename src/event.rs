//! Trigger events: what starts a processing job.
//!
//! Events arrive from the catalog (entity updated or deleted, image
//! uploaded) or from background schedulers (rescans). The priority class is
//! decided by whoever emits the event and is carried verbatim; the router
//! never infers it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EntityUpdated,
    AssetUploaded,
    EntityDeleted,
    ScheduledRescan,
}

impl EventKind {
    /// The priority class emitters use for this kind by default.
    #[must_use]
    pub const fn default_priority(self) -> PriorityClass {
        match self {
            Self::EntityUpdated | Self::AssetUploaded | Self::EntityDeleted => PriorityClass::High,
            Self::ScheduledRescan => PriorityClass::Low,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntityUpdated => f.write_str("entity_updated"),
            Self::AssetUploaded => f.write_str("asset_uploaded"),
            Self::EntityDeleted => f.write_str("entity_deleted"),
            Self::ScheduledRescan => f.write_str("scheduled_rescan"),
        }
    }
}

/// Queue priority of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    High,
    Low,
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => f.write_str("high"),
            Self::Low => f.write_str("low"),
        }
    }
}

/// An event about one entity, as received at the ingestion boundary.
///
/// `entity_id` is kept raw: the router validates it and rejects the event
/// if it cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub entity_id: String,
    pub kind: EventKind,
    pub priority: PriorityClass,
    pub timestamp: DateTime<Utc>,

    /// The uploaded image for `AssetUploaded` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

impl TriggerEvent {
    /// Creates an event with the kind's default priority.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            priority: kind.default_priority(),
            timestamp: Utc::now(),
            asset_id: None,
        }
    }

    #[must_use]
    pub fn entity_updated(entity_id: impl Into<String>) -> Self {
        Self::new(entity_id, EventKind::EntityUpdated)
    }

    #[must_use]
    pub fn asset_uploaded(entity_id: impl Into<String>, asset_id: impl Into<String>) -> Self {
        let mut event = Self::new(entity_id, EventKind::AssetUploaded);
        event.asset_id = Some(asset_id.into());
        event
    }

    #[must_use]
    pub fn entity_deleted(entity_id: impl Into<String>) -> Self {
        Self::new(entity_id, EventKind::EntityDeleted)
    }

    #[must_use]
    pub fn scheduled_rescan(entity_id: impl Into<String>) -> Self {
        Self::new(entity_id, EventKind::ScheduledRescan)
    }

    /// Overrides the priority class.
    #[must_use]
    pub const fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = priority;
        self
    }

    /// Parses an event from its JSON wire form.
    ///
    /// `priority` and `timestamp` are optional on the wire; missing values
    /// default to the kind's priority and the receive time.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` for invalid JSON, a missing `entity_id` or
    /// `kind`, or an unknown kind.
    pub fn from_json(payload: &str) -> Result<Self, ValidationError> {
        let wire: WireEvent = serde_json::from_str(payload).map_err(|e| ValidationError::MalformedEvent {
            reason: format!("invalid event payload: {e}"),
        })?;

        let entity_id = wire.entity_id.ok_or_else(|| ValidationError::MalformedEvent {
            reason: "missing entity_id".to_string(),
        })?;
        let kind = wire.kind.ok_or_else(|| ValidationError::MalformedEvent {
            reason: "missing kind".to_string(),
        })?;

        if kind == EventKind::AssetUploaded && wire.asset_id.is_none() {
            return Err(ValidationError::MalformedEvent {
                reason: "asset_uploaded event without asset_id".to_string(),
            });
        }

        Ok(Self {
            entity_id,
            kind,
            priority: wire.priority.unwrap_or_else(|| kind.default_priority()),
            timestamp: wire.timestamp.unwrap_or_else(Utc::now),
            asset_id: wire.asset_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    entity_id: Option<String>,
    kind: Option<EventKind>,
    priority: Option<PriorityClass>,
    timestamp: Option<DateTime<Utc>>,
    asset_id: Option<String>,
}
