//! Catalog contracts.
//!
//! The catalog is the system of record the engine writes accepted insights
//! into. It is external: the engine only sees a read contract (preconditions)
//! and a write contract that applies one idempotent `CatalogChange`.

mod memory;

pub use memory::InMemoryCatalog;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{EntityId, EntitySnapshot};
use crate::value::Value;

/// One idempotent catalog mutation.
///
/// Every variant is safe to replay: tags are added to a set, fields and
/// nutrients are overwritten, images are rotated to an absolute angle,
/// selected into a role, or deleted by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CatalogChange {
    /// Add `tag` to the tag set named `field`.
    AddTag { field: String, tag: String },

    /// Overwrite a scalar field.
    SetField { field: String, value: Value },

    /// Overwrite the nutrition facts.
    SetNutrients { nutrients: serde_json::Value },

    /// Set the absolute rotation of an image, in degrees.
    RotateImage { image_id: String, rotation: i64 },

    /// Select an image for a role (e.g. the nutrition table).
    SelectImage { image_id: String, role: String },

    /// Delete an image.
    DeleteImage { image_id: String },
}

impl CatalogChange {
    /// Short operation name for logging.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::AddTag { .. } => "add_tag",
            Self::SetField { .. } => "set_field",
            Self::SetNutrients { .. } => "set_nutrients",
            Self::RotateImage { .. } => "rotate_image",
            Self::SelectImage { .. } => "select_image",
            Self::DeleteImage { .. } => "delete_image",
        }
    }
}

/// Acknowledgement of a catalog write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// False when the catalog already reflected the change.
    pub changed: bool,
}

impl Ack {
    #[must_use]
    pub const fn changed() -> Self {
        Self { changed: true }
    }

    #[must_use]
    pub const fn unchanged() -> Self {
        Self { changed: false }
    }
}

/// Errors reported by a catalog backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The entity does not exist (anymore).
    #[error("Entity not found in catalog: {entity_id}")]
    NotFound { entity_id: String },

    /// The catalog refused the change; replaying it will not help.
    #[error("Catalog rejected change: {reason}")]
    Rejected { reason: String },

    /// The catalog is temporarily unavailable.
    #[error("Catalog unavailable: {reason}")]
    Unavailable { reason: String },

    /// The catalog did not answer in time.
    #[error("Catalog timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

/// Read side of the catalog.
pub trait CatalogReader: Send + Sync {
    /// Returns the current snapshot of an entity, or `None` if it does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable`/`Timeout` for transient backend failures.
    fn get_entity(&self, entity_id: &EntityId) -> Result<Option<EntitySnapshot>, CatalogError>;
}

/// Write side of the catalog.
pub trait CatalogWriter: Send + Sync {
    /// Applies one idempotent change.
    ///
    /// # Errors
    ///
    /// See [`CatalogError`].
    fn apply_change(&self, entity_id: &EntityId, change: &CatalogChange) -> Result<Ack, CatalogError>;
}
