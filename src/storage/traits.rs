//! Abstract storage traits for insightflow.
//!
//! These traits define the contract that storage backends must implement.
//! Stores are plain record stores; the engine provides the per-entity
//! critical section around every read-modify-write, so backends only need
//! each individual call to be atomic.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entity::EntityId;
use crate::insight::{Insight, InsightId, InsightQuery};
use crate::prediction::{Prediction, PredictionId, PredictionType};
use crate::vote::{Vote, VoteTally};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Insight not found.
    #[error("Insight not found: {0}")]
    InsightNotFound(InsightId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Append-only prediction log.
pub trait PredictionStore: Send + Sync {
    /// Insert a new prediction. Returns `DuplicateKey` if the ID exists.
    fn insert(&self, prediction: Prediction) -> Result<(), StorageError>;

    /// Get a prediction by ID.
    fn get(&self, id: PredictionId) -> Result<Option<Prediction>, StorageError>;

    /// Get the predictions that exist among `ids` (missing ids are skipped).
    fn get_many(&self, ids: &[PredictionId]) -> Result<Vec<Prediction>, StorageError>;

    /// All predictions for an entity, oldest first.
    fn find_by_entity(&self, entity_id: &EntityId) -> Result<Vec<Prediction>, StorageError>;

    /// Delete every prediction for an entity; returns how many were removed.
    fn delete_by_entity(&self, entity_id: &EntityId) -> Result<usize, StorageError>;
}

/// Insight records.
pub trait InsightStore: Send + Sync {
    /// Insert a new insight. Returns `DuplicateKey` if the ID exists.
    fn insert(&self, insight: Insight) -> Result<(), StorageError>;

    /// Get an insight by ID.
    fn get(&self, id: InsightId) -> Result<Option<Insight>, StorageError>;

    /// Replace an existing insight. Returns `InsightNotFound` if missing.
    fn update(&self, insight: Insight) -> Result<(), StorageError>;

    /// All insights (any status) for one `(entity, type)` slot.
    fn find_by_slot(
        &self,
        entity_id: &EntityId,
        insight_type: PredictionType,
    ) -> Result<Vec<Insight>, StorageError>;

    /// All insights (any status) for an entity.
    fn find_by_entity(&self, entity_id: &EntityId) -> Result<Vec<Insight>, StorageError>;

    /// `PENDING`, eligible insights created at or before `created_before`,
    /// oldest first, at most `limit`.
    fn find_auto_processable(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Insight>, StorageError>;

    /// `APPLY_FAILED` insights whose `next_retry_at` is at or before `now`,
    /// earliest first, at most `limit`.
    fn find_due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Insight>, StorageError>;

    /// Insights matching `query`, oldest first.
    fn query(&self, query: &InsightQuery) -> Result<Vec<Insight>, StorageError>;
}

/// Anonymous votes, one row per `(insight, fingerprint)`.
pub trait VoteStore: Send + Sync {
    /// Insert or replace the vote of `vote.voter_fingerprint`. Returns the
    /// replaced vote, if any.
    fn upsert(&self, vote: Vote) -> Result<Option<Vote>, StorageError>;

    /// All votes for an insight.
    fn find_by_insight(&self, insight_id: InsightId) -> Result<Vec<Vote>, StorageError>;

    /// Aggregated counts for an insight.
    fn tally(&self, insight_id: InsightId) -> Result<VoteTally, StorageError> {
        Ok(VoteTally::from_votes(&self.find_by_insight(insight_id)?))
    }
}
