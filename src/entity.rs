//! Entity identity and catalog snapshots.
//!
//! An entity is a catalog item (a physical product) identified by a stable
//! id, usually its barcode. Everything in insightflow is keyed by
//! `EntityId`: lane routing, the per-entity critical section, and the
//! `(entity, type)` insight slots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::value::Value;

/// Default accepted shape for entity ids: barcodes and simple slugs.
pub const DEFAULT_ENTITY_ID_PATTERN: &str = r"^[0-9A-Za-z][0-9A-Za-z_.:\-]{0,63}$";

static DEFAULT_VALIDATOR: OnceLock<EntityIdValidator> = OnceLock::new();

/// Stable entity identifier.
///
/// Ids are trimmed on parse so `" 3017620422003"` and `"3017620422003"`
/// name the same entity (and therefore the same lane).
///
/// # Examples
///
/// ```
/// use insightflow::EntityId;
///
/// let id = EntityId::parse(" 3017620422003 ").unwrap();
/// assert_eq!(id.as_str(), "3017620422003");
/// assert!(EntityId::parse("   ").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Parses and validates an entity id with the default pattern.
    ///
    /// # Errors
    ///
    /// Returns `EmptyEntityId` for blank input and `InvalidEntityId` when the
    /// trimmed id does not match [`DEFAULT_ENTITY_ID_PATTERN`].
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        DEFAULT_VALIDATOR
            .get_or_init(EntityIdValidator::default)
            .parse(raw)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the bytes hashed for lane assignment.
    #[must_use]
    pub fn routing_key(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EntityId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validates raw entity ids against a configurable pattern.
#[derive(Debug, Clone)]
pub struct EntityIdValidator {
    pattern: Regex,
}

impl EntityIdValidator {
    /// Compiles a validator for the given pattern.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the pattern is not a valid regex.
    pub fn new(pattern: &str) -> Result<Self, ValidationError> {
        let pattern = Regex::new(pattern).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("invalid entity id pattern '{pattern}': {e}"),
        })?;
        Ok(Self { pattern })
    }

    /// Parses a raw id.
    pub fn parse(&self, raw: &str) -> Result<EntityId, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyEntityId);
        }
        if !self.pattern.is_match(trimmed) {
            return Err(ValidationError::InvalidEntityId {
                id: trimmed.to_string(),
            });
        }
        Ok(EntityId(trimmed.to_string()))
    }
}

impl Default for EntityIdValidator {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_ENTITY_ID_PATTERN)
                .unwrap_or_else(|e| unreachable!("default entity id pattern is valid: {e}")),
        }
    }
}

/// An image attached to a catalog entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Rotation in degrees applied to the image.
    pub rotation: i64,
    /// Roles this image is selected for (e.g. `nutrition`).
    pub roles: BTreeSet<String>,
}

/// Read-only view of a catalog entity.
///
/// This is the narrow slice of the catalog document that insights read and
/// write: scalar fields, tag sets, images and nutrient facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,

    #[serde(default)]
    pub fields: BTreeMap<String, Value>,

    #[serde(default)]
    pub tags: BTreeMap<String, BTreeSet<String>>,

    #[serde(default)]
    pub images: BTreeMap<String, ImageRecord>,

    #[serde(default)]
    pub nutrients: serde_json::Value,
}

impl EntitySnapshot {
    /// Creates an empty snapshot for an entity.
    #[must_use]
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            fields: BTreeMap::new(),
            tags: BTreeMap::new(),
            images: BTreeMap::new(),
            nutrients: serde_json::Value::Null,
        }
    }

    /// Adds an image with no rotation and no roles.
    #[must_use]
    pub fn with_image(mut self, image_id: impl Into<String>) -> Self {
        self.images.insert(image_id.into(), ImageRecord::default());
        self
    }

    /// Returns true if `tag` is present in the tag set `field`.
    #[must_use]
    pub fn has_tag(&self, field: &str, tag: &str) -> bool {
        self.tags.get(field).is_some_and(|set| set.contains(tag))
    }
}
