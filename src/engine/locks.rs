//! Per-entity critical sections.
//!
//! Lanes serialize HIGH events per entity, but the sweep, annotations, votes
//! and LOW workers reach the same entities from other threads. Every
//! read-modify-write of an entity's insights runs inside `with_entity`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::entity::EntityId;
use crate::error::{InsightError, InsightResult};

/// Lock table keyed by entity id. Entries exist only while held or awaited.
#[derive(Debug, Default)]
pub(crate) struct EntityLocks {
    table: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `entity_id`.
    pub(crate) fn with_entity<T>(&self, entity_id: &EntityId, f: impl FnOnce() -> T) -> InsightResult<T> {
        let slot = {
            let mut table = self
                .table
                .lock()
                .map_err(|_| InsightError::internal("entity lock table poisoned"))?;
            Arc::clone(table.entry(entity_id.clone()).or_default())
        };

        let result = {
            // The guarded data is `()`: a poisoned slot carries no state.
            let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        self.release(entity_id, slot);
        Ok(result)
    }

    fn release(&self, entity_id: &EntityId, slot: Arc<Mutex<()>>) {
        let Ok(mut table) = self.table.lock() else {
            return;
        };
        // One reference in the table, one held here: nobody else is waiting.
        if Arc::strong_count(&slot) == 2 {
            table.remove(entity_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }
}
