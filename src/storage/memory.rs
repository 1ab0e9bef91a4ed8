//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::entity::EntityId;
use crate::insight::{Insight, InsightId, InsightQuery, InsightStatus};
use crate::prediction::{Prediction, PredictionId, PredictionType};
use crate::storage::traits::{InsightStore, PredictionStore, StorageError, VoteStore};
use crate::vote::Vote;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct PredictionState {
    by_id: HashMap<PredictionId, Prediction>,
    by_entity: HashMap<EntityId, Vec<PredictionId>>,
}

/// Thread-safe in-memory prediction store.
#[derive(Debug, Default)]
pub struct InMemoryPredictionStore {
    state: RwLock<PredictionState>,
}

impl InMemoryPredictionStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PredictionStore for InMemoryPredictionStore {
    fn insert(&self, prediction: Prediction) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("prediction.insert"))?;
        if state.by_id.contains_key(&prediction.id) {
            return Err(StorageError::DuplicateKey(prediction.id.to_string()));
        }
        state
            .by_entity
            .entry(prediction.entity_id.clone())
            .or_default()
            .push(prediction.id);
        state.by_id.insert(prediction.id, prediction);
        Ok(())
    }

    fn get(&self, id: PredictionId) -> Result<Option<Prediction>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("prediction.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn get_many(&self, ids: &[PredictionId]) -> Result<Vec<Prediction>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("prediction.get_many"))?;
        Ok(ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
    }

    fn find_by_entity(&self, entity_id: &EntityId) -> Result<Vec<Prediction>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("prediction.find_by_entity"))?;
        Ok(state
            .by_entity
            .get(entity_id)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn delete_by_entity(&self, entity_id: &EntityId) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("prediction.delete_by_entity"))?;
        let Some(ids) = state.by_entity.remove(entity_id) else {
            return Ok(0);
        };
        let mut removed = 0;
        for id in ids {
            if state.by_id.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Default)]
struct InsightState {
    by_id: HashMap<InsightId, Insight>,
    by_entity: HashMap<EntityId, Vec<InsightId>>,
}

impl InsightState {
    fn entity_insights<'a>(&'a self, entity_id: &EntityId) -> impl Iterator<Item = &'a Insight> + 'a {
        self.by_entity
            .get(entity_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
    }
}

fn oldest_first(mut insights: Vec<Insight>) -> Vec<Insight> {
    insights.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    insights
}

/// Thread-safe in-memory insight store.
#[derive(Debug, Default)]
pub struct InMemoryInsightStore {
    state: RwLock<InsightState>,
}

impl InMemoryInsightStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InsightStore for InMemoryInsightStore {
    fn insert(&self, insight: Insight) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("insight.insert"))?;
        if state.by_id.contains_key(&insight.id) {
            return Err(StorageError::DuplicateKey(insight.id.to_string()));
        }
        state
            .by_entity
            .entry(insight.entity_id.clone())
            .or_default()
            .push(insight.id);
        state.by_id.insert(insight.id, insight);
        Ok(())
    }

    fn get(&self, id: InsightId) -> Result<Option<Insight>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("insight.get"))?;
        Ok(state.by_id.get(&id).cloned())
    }

    fn update(&self, insight: Insight) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("insight.update"))?;
        let Some(slot) = state.by_id.get_mut(&insight.id) else {
            return Err(StorageError::InsightNotFound(insight.id));
        };
        if slot.entity_id != insight.entity_id {
            return Err(StorageError::BackendError(format!(
                "insight {} cannot move between entities",
                insight.id
            )));
        }
        *slot = insight;
        Ok(())
    }

    fn find_by_slot(
        &self,
        entity_id: &EntityId,
        insight_type: PredictionType,
    ) -> Result<Vec<Insight>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("insight.find_by_slot"))?;
        Ok(oldest_first(
            state
                .entity_insights(entity_id)
                .filter(|i| i.insight_type == insight_type)
                .cloned()
                .collect(),
        ))
    }

    fn find_by_entity(&self, entity_id: &EntityId) -> Result<Vec<Insight>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("insight.find_by_entity"))?;
        Ok(oldest_first(state.entity_insights(entity_id).cloned().collect()))
    }

    fn find_auto_processable(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Insight>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("insight.find_auto_processable"))?;
        let mut due = oldest_first(
            state
                .by_id
                .values()
                .filter(|i| {
                    i.status == InsightStatus::Pending
                        && i.automatic_processing_eligible
                        && i.created_at <= created_before
                })
                .cloned()
                .collect(),
        );
        due.truncate(limit);
        Ok(due)
    }

    fn find_due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Insight>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("insight.find_due_retries"))?;
        let mut due: Vec<Insight> = state
            .by_id
            .values()
            .filter(|i| {
                i.status == InsightStatus::ApplyFailed && i.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    fn query(&self, query: &InsightQuery) -> Result<Vec<Insight>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("insight.query"))?;
        let candidates: Vec<Insight> = match &query.entity_id {
            Some(entity_id) => state
                .entity_insights(entity_id)
                .filter(|i| query.matches(i))
                .cloned()
                .collect(),
            None => state.by_id.values().filter(|i| query.matches(i)).cloned().collect(),
        };
        let mut out = oldest_first(candidates);
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

/// Thread-safe in-memory vote store.
#[derive(Debug, Default)]
pub struct InMemoryVoteStore {
    state: RwLock<HashMap<InsightId, HashMap<String, Vote>>>,
}

impl InMemoryVoteStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl VoteStore for InMemoryVoteStore {
    fn upsert(&self, vote: Vote) -> Result<Option<Vote>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("vote.upsert"))?;
        Ok(state
            .entry(vote.insight_id)
            .or_default()
            .insert(vote.voter_fingerprint.clone(), vote))
    }

    fn find_by_insight(&self, insight_id: InsightId) -> Result<Vec<Vote>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("vote.find_by_insight"))?;
        let mut votes: Vec<Vote> = state
            .get(&insight_id)
            .map(|by_fp| by_fp.values().cloned().collect())
            .unwrap_or_default();
        votes.sort_by(|a, b| a.cast_at.cmp(&b.cast_at));
        Ok(votes)
    }
}

/// Convenience bundle of in-memory stores.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Prediction store.
    pub predictions: InMemoryPredictionStore,
    /// Insight store.
    pub insights: InMemoryInsightStore,
    /// Vote store.
    pub votes: InMemoryVoteStore,
}

impl InMemoryStores {
    /// Create a new bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
