//! Insight engine.
//!
//! `InsightEngine` owns every insight state transition: reconciliation of
//! fresh predictions, human annotation, anonymous voting, the automatic
//! processing sweep, apply retries and the entity deletion cascade. Every
//! transition runs inside the entity's critical section, so the engine can be
//! shared across lane workers, the sweep scheduler and request handlers.

mod annotation;
mod locks;
mod reconcile;
mod sweep;

/// Lane workers draining trigger events.
pub mod runtime;

pub use reconcile::ReconciliationResult;
pub use runtime::{EventHandle, LaneRuntime};
pub use sweep::{SweepReport, SweepScheduler};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::apply::ApplyGateway;
use crate::catalog::{CatalogReader, CatalogWriter};
use crate::config::EngineConfig;
use crate::entity::{EntityId, EntityIdValidator};
use crate::error::{ExecutionError, InsightError, InsightResult, PredictorError, ValidationError};
use crate::event::{EventKind, TriggerEvent};
use crate::insight::{Insight, InsightId, InsightQuery, InsightStatus};
use crate::policy::{EligibilityPolicy, ThresholdPolicy};
use crate::prediction::{Prediction, PredictionType};
use crate::predictor::{PredictionContext, Predictor, PredictorRegistry};
use crate::storage::{InMemoryStores, InsightStore, PredictionStore, VoteStore};
use crate::vote::Vote;

use locks::EntityLocks;

/// Outcome of processing one trigger event.
#[derive(Debug)]
pub struct EventReport {
    pub entity_id: EntityId,
    pub kind: EventKind,
    /// One entry per prediction type that received predictions.
    pub reconciliations: Vec<ReconciliationResult>,
    /// Predictors that failed; the others still ran.
    pub predictor_failures: Vec<PredictorError>,
    /// Set for `EntityDeleted` events.
    pub deletion: Option<DeletionReport>,
}

impl EventReport {
    fn new(entity_id: EntityId, kind: EventKind) -> Self {
        Self {
            entity_id,
            kind,
            reconciliations: Vec::new(),
            predictor_failures: Vec::new(),
            deletion: None,
        }
    }

    /// Ids of every insight created while processing the event.
    #[must_use]
    pub fn created(&self) -> Vec<InsightId> {
        self.reconciliations.iter().flat_map(|r| r.created.iter().copied()).collect()
    }
}

/// Outcome of the entity deletion cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Open insights moved to `ENTITY_DELETED`.
    pub closed_insights: Vec<InsightId>,
    /// Predictions removed from the log.
    pub predictions_removed: usize,
}

/// The insight lifecycle engine.
pub struct InsightEngine {
    predictions: Arc<dyn PredictionStore>,
    insights: Arc<dyn InsightStore>,
    votes: Arc<dyn VoteStore>,
    catalog: Arc<dyn CatalogReader>,
    gateway: ApplyGateway,
    predictors: PredictorRegistry,
    eligibility: Arc<dyn EligibilityPolicy>,
    validator: EntityIdValidator,
    config: EngineConfig,
    locks: EntityLocks,
}

impl std::fmt::Debug for InsightEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsightEngine")
            .field("predictors", &self.predictors)
            .field("eligibility", &self.eligibility.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InsightEngine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> InsightEngineBuilder {
        InsightEngineBuilder::new()
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The entity id validator built from the configuration.
    #[must_use]
    pub const fn entity_id_validator(&self) -> &EntityIdValidator {
        &self.validator
    }

    /// The apply gateway.
    #[must_use]
    pub const fn gateway(&self) -> &ApplyGateway {
        &self.gateway
    }

    /// Processes one trigger event synchronously.
    ///
    /// Deletion events run the deletion cascade. Other events run the
    /// predictors registered for their kind and reconcile the predictions,
    /// one `(entity, type)` slot at a time. The whole event runs inside the
    /// entity's critical section.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` if the entity id is unresolvable, or the
    /// first reconciliation/storage error encountered.
    pub fn handle_event(&self, event: &TriggerEvent) -> InsightResult<EventReport> {
        let entity_id = self.validator.parse(&event.entity_id).map_err(|e| {
            warn!(entity_id = %event.entity_id, kind = %event.kind, error = %e, "rejected malformed event");
            ValidationError::MalformedEvent {
                reason: format!("unresolvable entity id: {e}"),
            }
        })?;
        self.process_event(&entity_id, event)
    }

    pub(crate) fn process_event(&self, entity_id: &EntityId, event: &TriggerEvent) -> InsightResult<EventReport> {
        self.locks.with_entity(entity_id, || -> InsightResult<EventReport> {
            let mut report = EventReport::new(entity_id.clone(), event.kind);

            if event.kind == EventKind::EntityDeleted {
                report.deletion = Some(self.delete_entity_locked(entity_id)?);
                return Ok(report);
            }

            let snapshot = match self.catalog.get_entity(entity_id) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "catalog read failed; predicting without snapshot");
                    None
                }
            };
            let context = PredictionContext::from_event(event, snapshot);
            let run = self.predictors.run(entity_id, &context);
            report.predictor_failures = run.failures;

            let mut by_type: BTreeMap<PredictionType, Vec<Prediction>> = BTreeMap::new();
            for prediction in run.predictions {
                by_type.entry(prediction.prediction_type).or_default().push(prediction);
            }
            for (insight_type, predictions) in by_type {
                report
                    .reconciliations
                    .push(self.reconcile_locked(entity_id, insight_type, predictions)?);
            }

            Ok(report)
        })?
    }

    /// Runs the deletion cascade for an entity: every open insight moves to
    /// `ENTITY_DELETED` and every prediction is removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the cascade could not be persisted.
    pub fn delete_entity(&self, entity_id: &EntityId) -> InsightResult<DeletionReport> {
        self.locks.with_entity(entity_id, || self.delete_entity_locked(entity_id))?
    }

    fn delete_entity_locked(&self, entity_id: &EntityId) -> InsightResult<DeletionReport> {
        let mut report = DeletionReport::default();
        for mut insight in self.insights.find_by_entity(entity_id)? {
            if !insight.status.is_open() {
                continue;
            }
            if insight.status == InsightStatus::ApplyFailed && self.gateway.forget_write(insight.id) {
                debug!(insight_id = %insight.id, "dropped in-flight write of deleted entity");
            }
            insight.status = InsightStatus::EntityDeleted;
            insight.next_retry_at = None;
            report.closed_insights.push(insight.id);
            self.insights.update(insight)?;
        }
        report.predictions_removed = self.predictions.delete_by_entity(entity_id)?;

        info!(
            entity_id = %entity_id,
            closed = report.closed_insights.len(),
            predictions_removed = report.predictions_removed,
            "entity deleted"
        );
        Ok(report)
    }

    /// Returns an insight by id.
    ///
    /// # Errors
    ///
    /// Returns `InsightNotFound` if it does not exist.
    pub fn get_insight(&self, id: InsightId) -> InsightResult<Insight> {
        self.insights
            .get(id)?
            .ok_or_else(|| InsightError::Execution(ExecutionError::InsightNotFound { id }))
    }

    /// Lists insights matching `query`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn list_insights(&self, query: &InsightQuery) -> InsightResult<Vec<Insight>> {
        Ok(self.insights.query(query)?)
    }

    /// Counted votes for an insight (one per fingerprint).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails.
    pub fn votes_for(&self, id: InsightId) -> InsightResult<Vec<Vote>> {
        Ok(self.votes.find_by_insight(id)?)
    }

    /// The prediction log for an entity.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails.
    pub fn predictions_for(&self, entity_id: &EntityId) -> InsightResult<Vec<Prediction>> {
        Ok(self.predictions.find_by_entity(entity_id)?)
    }
}

/// Builder for [`InsightEngine`].
///
/// Stores default to fresh in-memory backends and the eligibility policy
/// defaults to the configured confidence thresholds. A catalog is required.
#[derive(Default)]
pub struct InsightEngineBuilder {
    config: EngineConfig,
    predictions: Option<Arc<dyn PredictionStore>>,
    insights: Option<Arc<dyn InsightStore>>,
    votes: Option<Arc<dyn VoteStore>>,
    reader: Option<Arc<dyn CatalogReader>>,
    writer: Option<Arc<dyn CatalogWriter>>,
    predictors: PredictorRegistry,
    eligibility: Option<Arc<dyn EligibilityPolicy>>,
}

impl InsightEngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses explicit storage backends.
    #[must_use]
    pub fn stores(
        mut self,
        predictions: Arc<dyn PredictionStore>,
        insights: Arc<dyn InsightStore>,
        votes: Arc<dyn VoteStore>,
    ) -> Self {
        self.predictions = Some(predictions);
        self.insights = Some(insights);
        self.votes = Some(votes);
        self
    }

    /// Uses one backend for both catalog contracts.
    #[must_use]
    pub fn catalog<C>(mut self, catalog: Arc<C>) -> Self
    where
        C: CatalogReader + CatalogWriter + 'static,
    {
        let reader: Arc<dyn CatalogReader> = catalog.clone();
        let writer: Arc<dyn CatalogWriter> = catalog;
        self.reader = Some(reader);
        self.writer = Some(writer);
        self
    }

    /// Uses separate catalog read and write contracts.
    #[must_use]
    pub fn catalog_split(mut self, reader: Arc<dyn CatalogReader>, writer: Arc<dyn CatalogWriter>) -> Self {
        self.reader = Some(reader);
        self.writer = Some(writer);
        self
    }

    #[must_use]
    pub fn predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictors.register(predictor);
        self
    }

    #[must_use]
    pub fn eligibility_policy(mut self, policy: Arc<dyn EligibilityPolicy>) -> Self {
        self.eligibility = Some(policy);
        self
    }

    /// Validates the configuration and builds the engine.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid configuration and
    /// `MissingField` if no catalog was provided.
    pub fn build(self) -> InsightResult<InsightEngine> {
        self.config.validate()?;
        let validator = self.config.entity_id_validator()?;

        let (Some(reader), Some(writer)) = (self.reader, self.writer) else {
            return Err(ValidationError::MissingField {
                field: "catalog".to_string(),
            }
            .into());
        };

        let InMemoryStores {
            predictions,
            insights,
            votes,
        } = InMemoryStores::new();
        let predictions = self.predictions.unwrap_or_else(|| Arc::new(predictions));
        let insights = self.insights.unwrap_or_else(|| Arc::new(insights));
        let votes = self.votes.unwrap_or_else(|| Arc::new(votes));

        let eligibility = self
            .eligibility
            .unwrap_or_else(|| Arc::new(ThresholdPolicy::from_config(&self.config.automatic_processing)));
        let gateway = ApplyGateway::new(Arc::clone(&reader), writer, self.config.apply.timeout());

        Ok(InsightEngine {
            predictions,
            insights,
            votes,
            catalog: reader,
            gateway,
            predictors: self.predictors.with_retry(self.config.predictors.clone()),
            eligibility,
            validator,
            config: self.config,
            locks: EntityLocks::new(),
        })
    }
}
