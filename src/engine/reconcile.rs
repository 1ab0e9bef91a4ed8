//! Reconciliation of fresh predictions against existing insights.
//!
//! For one `(entity, type)` slot, incoming predictions are persisted, grouped
//! by value identity, and each group either attaches to the open insight that
//! already holds its value, is blocked by history (a rejected or applied
//! insight with the same value), or materializes as a new `PENDING` insight,
//! superseding the previous value of a single-valued slot. An insight whose
//! timed-out catalog write is still running is never superseded.

use chrono::Utc;
use tracing::{debug, error, info};

use super::InsightEngine;
use crate::entity::EntityId;
use crate::error::{ExecutionError, InsightResult, ValidationError};
use crate::insight::{Insight, InsightId, InsightStatus};
use crate::policy::automatic_processing_eligible;
use crate::prediction::{Prediction, PredictionType};
use crate::storage::StorageError;
use crate::value::Value;

/// What one reconciliation pass did to a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub entity_id: EntityId,
    pub insight_type: PredictionType,
    /// New `PENDING` insights.
    pub created: Vec<InsightId>,
    /// Open insights that gained fresh supporting predictions.
    pub updated: Vec<InsightId>,
    /// Insights replaced by a newer value.
    pub superseded: Vec<InsightId>,
    /// Insights that blocked or absorbed a value without changing.
    pub untouched: Vec<InsightId>,
    /// Created or updated insights now eligible for automatic processing.
    pub auto_processable: Vec<InsightId>,
}

impl ReconciliationResult {
    fn new(entity_id: &EntityId, insight_type: PredictionType) -> Self {
        Self {
            entity_id: entity_id.clone(),
            insight_type,
            created: Vec::new(),
            updated: Vec::new(),
            superseded: Vec::new(),
            untouched: Vec::new(),
            auto_processable: Vec::new(),
        }
    }

    /// Returns true if the sweep has something new to consider.
    #[must_use]
    pub fn needs_sweep(&self) -> bool {
        !self.auto_processable.is_empty()
    }

    /// Returns true if the slot did not change.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.superseded.is_empty()
    }
}

/// Predictions sharing one value identity.
struct ValueGroup {
    value: Value,
    asset: Option<String>,
    predictions: Vec<Prediction>,
}

impl ValueGroup {
    fn max_confidence(&self) -> Option<f32> {
        max_confidence(&self.predictions)
    }

    fn rank(&self) -> (Option<f32>, chrono::DateTime<Utc>) {
        let latest = self
            .predictions
            .iter()
            .map(|p| p.created_at)
            .max()
            .unwrap_or_else(Utc::now);
        (self.max_confidence(), latest)
    }
}

fn max_confidence(predictions: &[Prediction]) -> Option<f32> {
    predictions
        .iter()
        .filter_map(|p| p.confidence)
        .fold(None, |acc, c| Some(acc.map_or(c, |m: f32| m.max(c))))
}

fn group_by_value(insight_type: PredictionType, predictions: Vec<Prediction>) -> Vec<ValueGroup> {
    let mut groups: Vec<ValueGroup> = Vec::new();
    for prediction in predictions {
        let asset = if insight_type.is_image_scoped() {
            prediction.source_asset_id.clone()
        } else {
            None
        };
        match groups
            .iter_mut()
            .find(|g| g.value == prediction.value && g.asset == asset)
        {
            Some(group) => group.predictions.push(prediction),
            None => groups.push(ValueGroup {
                value: prediction.value.clone(),
                asset,
                predictions: vec![prediction],
            }),
        }
    }
    groups
}

/// The insights already in a slot, with late catalog writes resolved.
struct SlotHistory {
    insights: Vec<Insight>,
    /// `APPLY_FAILED` insights whose timed-out write is still running.
    in_flight: Vec<InsightId>,
}

impl SlotHistory {
    fn applied(&self, value: &Value, asset: Option<&str>) -> Option<&Insight> {
        self.insights
            .iter()
            .find(|i| i.status.is_applied() && i.holds(value, asset))
    }

    fn latest_rejected(&self, value: &Value, asset: Option<&str>) -> Option<&Insight> {
        self.insights
            .iter()
            .filter(|i| i.status.is_rejected() && i.holds(value, asset))
            .max_by_key(|i| i.created_at)
    }

    fn write_in_flight(&self, id: InsightId) -> bool {
        self.in_flight.contains(&id)
    }
}

/// Keeps only the strongest value for a single-valued slot: highest
/// confidence (unknown ranks lowest), ties broken by the latest prediction.
fn strongest(groups: Vec<ValueGroup>) -> Option<ValueGroup> {
    groups.into_iter().reduce(|best, candidate| {
        let (best_conf, best_at) = best.rank();
        let (cand_conf, cand_at) = candidate.rank();
        let stronger = match (cand_conf, best_conf) {
            (Some(c), Some(b)) if c != b => c > b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            _ => cand_at > best_at,
        };
        if stronger {
            candidate
        } else {
            best
        }
    })
}

impl InsightEngine {
    /// Reconciles a batch of predictions for one `(entity, type)` slot.
    ///
    /// # Errors
    ///
    /// - `PredictionSlotMismatch` if a prediction belongs to another slot.
    /// - `InvariantViolation` if a single-valued slot already holds more
    ///   than one open insight.
    /// - Storage errors.
    pub fn reconcile(
        &self,
        entity_id: &EntityId,
        insight_type: PredictionType,
        predictions: Vec<Prediction>,
    ) -> InsightResult<ReconciliationResult> {
        self.locks
            .with_entity(entity_id, || self.reconcile_locked(entity_id, insight_type, predictions))?
    }

    pub(super) fn reconcile_locked(
        &self,
        entity_id: &EntityId,
        insight_type: PredictionType,
        predictions: Vec<Prediction>,
    ) -> InsightResult<ReconciliationResult> {
        for p in &predictions {
            if p.entity_id != *entity_id || p.prediction_type != insight_type {
                return Err(ValidationError::PredictionSlotMismatch {
                    prediction: p.id.to_string(),
                    entity_id: entity_id.to_string(),
                    insight_type,
                }
                .into());
            }
        }

        let now = Utc::now();
        let mut history = SlotHistory {
            insights: Vec::new(),
            in_flight: Vec::new(),
        };
        for insight in self.insights.find_by_slot(entity_id, insight_type)? {
            let (insight, in_flight) = self.settle_late_write(insight, now)?;
            if in_flight {
                history.in_flight.push(insight.id);
            }
            history.insights.push(insight);
        }
        let mut open: Vec<Insight> = history
            .insights
            .iter()
            .filter(|i| i.status.is_open())
            .cloned()
            .collect();
        if !insight_type.allows_multiple() && open.len() > 1 {
            error!(
                entity_id = %entity_id,
                insight_type = %insight_type,
                open = open.len(),
                "slot holds more than one open insight"
            );
            return Err(ExecutionError::InvariantViolation {
                entity_id: entity_id.to_string(),
                insight_type,
                count: open.len(),
            }
            .into());
        }

        for p in &predictions {
            match self.predictions.insert(p.clone()) {
                Ok(()) => {}
                Err(StorageError::DuplicateKey(_)) => {
                    debug!(prediction_id = %p.id, "prediction already stored");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut result = ReconciliationResult::new(entity_id, insight_type);
        let mut groups = group_by_value(insight_type, predictions);
        if !insight_type.allows_multiple() && groups.len() > 1 {
            // History-blocked values never compete for the slot.
            let mut viable = Vec::with_capacity(groups.len());
            for group in groups {
                let held = open.iter().any(|i| i.holds(&group.value, group.asset.as_deref()));
                match self.history_blocker(&history, &group) {
                    Some(blocker) if !held => {
                        debug!(insight_id = %blocker.id, value = %group.value, "value blocked by history");
                        result.untouched.push(blocker.id);
                    }
                    _ => viable.push(group),
                }
            }
            groups = strongest(viable).into_iter().collect();
        }

        for group in groups {
            self.reconcile_value(entity_id, insight_type, group, &history, &mut open, &mut result)?;
        }

        info!(
            entity_id = %entity_id,
            insight_type = %insight_type,
            created = result.created.len(),
            updated = result.updated.len(),
            superseded = result.superseded.len(),
            untouched = result.untouched.len(),
            "reconciled slot"
        );
        Ok(result)
    }

    fn reconcile_value(
        &self,
        entity_id: &EntityId,
        insight_type: PredictionType,
        group: ValueGroup,
        history: &SlotHistory,
        open: &mut Vec<Insight>,
        result: &mut ReconciliationResult,
    ) -> InsightResult<()> {
        let asset = group.asset.as_deref();

        if let Some(current) = open.iter_mut().find(|i| i.holds(&group.value, asset)) {
            if current.status.accepts_votes() {
                self.attach(current, group.predictions, result)?;
            } else {
                result.untouched.push(current.id);
            }
            return Ok(());
        }

        if let Some(blocker) = self.history_blocker(history, &group) {
            debug!(insight_id = %blocker.id, status = %blocker.status, "value blocked by history");
            result.untouched.push(blocker.id);
            return Ok(());
        }
        if let Some(rejected) = history.latest_rejected(&group.value, asset) {
            let policy = self.config.reconciliation.rejected_value_policy;
            info!(insight_id = %rejected.id, policy = policy.name(), "re-opening rejected value");
        }

        let confidence = group.max_confidence();
        // A single-valued slot holds at most one open insight here.
        let displaced = if insight_type.allows_multiple() {
            None
        } else {
            open.first().cloned()
        };
        if let Some(previous) = &displaced {
            if !previous.status.is_supersedable() || history.write_in_flight(previous.id) {
                debug!(insight_id = %previous.id, status = %previous.status, "slot busy; value not materialized");
                result.untouched.push(previous.id);
                return Ok(());
            }
        }

        let mut insight = Insight::pending(entity_id.clone(), insight_type, group.value, Utc::now());
        insight.source_asset_id = group
            .asset
            .or_else(|| group.predictions.iter().find_map(|p| p.source_asset_id.clone()));
        insight.confidence = confidence;
        insight.automatic_processing_eligible =
            automatic_processing_eligible(self.eligibility.as_ref(), &group.predictions);
        insight.source_prediction_ids = group.predictions.iter().map(|p| p.id).collect();
        insight.campaign = self.config.campaigns.get(&insight_type).cloned();

        if let Some(mut previous) = displaced {
            previous.status = InsightStatus::Superseded;
            previous.superseded_by = Some(insight.id);
            previous.next_retry_at = None;
            info!(
                insight_id = %previous.id,
                superseded_by = %insight.id,
                entity_id = %entity_id,
                "insight superseded"
            );
            result.superseded.push(previous.id);
            self.insights.update(previous)?;
            open.clear();
        }

        result.created.push(insight.id);
        if insight.automatic_processing_eligible {
            result.auto_processable.push(insight.id);
        }
        self.insights.insert(insight.clone())?;
        open.push(insight);
        Ok(())
    }

    /// The applied insight holding `group`'s value, or the latest rejected
    /// one when the rejected-value policy does not allow re-opening it.
    fn history_blocker<'h>(&self, history: &'h SlotHistory, group: &ValueGroup) -> Option<&'h Insight> {
        let asset = group.asset.as_deref();
        history.applied(&group.value, asset).or_else(|| {
            history.latest_rejected(&group.value, asset).filter(|rejected| {
                !self
                    .config
                    .reconciliation
                    .rejected_value_policy
                    .allows_reopen(rejected.confidence, group.max_confidence())
            })
        })
    }

    /// Adds fresh supporting predictions to an open insight.
    fn attach(
        &self,
        insight: &mut Insight,
        incoming: Vec<Prediction>,
        result: &mut ReconciliationResult,
    ) -> InsightResult<()> {
        let mut contributing = self.predictions.get_many(&insight.source_prediction_ids)?;
        let fresh: Vec<Prediction> = incoming
            .into_iter()
            .filter(|p| {
                !insight.source_prediction_ids.contains(&p.id)
                    && !contributing.iter().any(|known| known.same_evidence(p))
            })
            .collect();

        if fresh.is_empty() {
            result.untouched.push(insight.id);
            return Ok(());
        }

        insight.source_prediction_ids.extend(fresh.iter().map(|p| p.id));
        contributing.extend(fresh);
        insight.confidence = max_confidence(&contributing);
        insight.automatic_processing_eligible =
            automatic_processing_eligible(self.eligibility.as_ref(), &contributing);

        result.updated.push(insight.id);
        if insight.automatic_processing_eligible && insight.status == InsightStatus::Pending {
            result.auto_processable.push(insight.id);
        }
        self.insights.update(insight.clone())?;
        Ok(())
    }
}
