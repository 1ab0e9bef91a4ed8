//! In-memory catalog.
//!
//! Reference implementation of both catalog contracts, with fault injection
//! hooks for exercising the apply gateway's retry and timeout paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{Ack, CatalogChange, CatalogError, CatalogReader, CatalogWriter};
use crate::entity::{EntityId, EntitySnapshot};

fn lock_err(context: &'static str) -> CatalogError {
    CatalogError::Unavailable {
        reason: format!("poisoned lock: {context}"),
    }
}

/// Thread-safe in-memory catalog.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entities: RwLock<HashMap<EntityId, EntitySnapshot>>,
    injected_failures: Mutex<VecDeque<CatalogError>>,
    write_delay: Mutex<Option<Duration>>,
    calls: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity.
    pub fn upsert_entity(&self, snapshot: EntitySnapshot) -> Result<(), CatalogError> {
        let mut entities = self.entities.write().map_err(|_| lock_err("catalog.upsert_entity"))?;
        entities.insert(snapshot.entity_id.clone(), snapshot);
        Ok(())
    }

    /// Remove an entity; returns true if it existed.
    pub fn remove_entity(&self, entity_id: &EntityId) -> Result<bool, CatalogError> {
        let mut entities = self.entities.write().map_err(|_| lock_err("catalog.remove_entity"))?;
        Ok(entities.remove(entity_id).is_some())
    }

    /// Make the next `apply_change` call fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: CatalogError) {
        if let Ok(mut queue) = self.injected_failures.lock() {
            queue.push_back(error);
        }
    }

    /// Delay every subsequent write by `delay` (`None` clears it).
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.write_delay.lock() {
            *slot = delay;
        }
    }

    /// Number of `apply_change` calls, including failed ones.
    #[must_use]
    pub fn apply_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of writes that actually changed the catalog.
    #[must_use]
    pub fn effective_writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn mutate(snapshot: &mut EntitySnapshot, change: &CatalogChange) -> Result<bool, CatalogError> {
        let changed = match change {
            CatalogChange::AddTag { field, tag } => {
                snapshot.tags.entry(field.clone()).or_default().insert(tag.clone())
            }
            CatalogChange::SetField { field, value } => {
                snapshot.fields.insert(field.clone(), value.clone()).as_ref() != Some(value)
            }
            CatalogChange::SetNutrients { nutrients } => {
                let changed = snapshot.nutrients != *nutrients;
                snapshot.nutrients = nutrients.clone();
                changed
            }
            CatalogChange::RotateImage { image_id, rotation } => {
                let image = snapshot.images.get_mut(image_id).ok_or_else(|| CatalogError::Rejected {
                    reason: format!("unknown image {image_id}"),
                })?;
                let changed = image.rotation != *rotation;
                image.rotation = *rotation;
                changed
            }
            CatalogChange::SelectImage { image_id, role } => {
                let image = snapshot.images.get_mut(image_id).ok_or_else(|| CatalogError::Rejected {
                    reason: format!("unknown image {image_id}"),
                })?;
                image.roles.insert(role.clone())
            }
            CatalogChange::DeleteImage { image_id } => snapshot.images.remove(image_id).is_some(),
        };
        Ok(changed)
    }
}

impl CatalogReader for InMemoryCatalog {
    fn get_entity(&self, entity_id: &EntityId) -> Result<Option<EntitySnapshot>, CatalogError> {
        let entities = self.entities.read().map_err(|_| lock_err("catalog.get_entity"))?;
        Ok(entities.get(entity_id).cloned())
    }
}

impl CatalogWriter for InMemoryCatalog {
    fn apply_change(&self, entity_id: &EntityId, change: &CatalogChange) -> Result<Ack, CatalogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.write_delay.lock().map_err(|_| lock_err("catalog.write_delay"))?;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let injected = self
            .injected_failures
            .lock()
            .map_err(|_| lock_err("catalog.injected_failures"))?
            .pop_front();
        if let Some(err) = injected {
            return Err(err);
        }

        let mut entities = self.entities.write().map_err(|_| lock_err("catalog.apply_change"))?;
        let snapshot = entities.get_mut(entity_id).ok_or_else(|| CatalogError::NotFound {
            entity_id: entity_id.to_string(),
        })?;

        let changed = Self::mutate(snapshot, change)?;
        debug!(entity_id = %entity_id, op = change.op(), changed, "catalog change applied");
        if changed {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(Ack::changed())
        } else {
            Ok(Ack::unchanged())
        }
    }
}
