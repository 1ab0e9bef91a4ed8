//! Delayed automatic processing.
//!
//! Eligible insights are applied without a human once they have been
//! `PENDING` for the grace period. Selection happens outside any lock; each
//! selected insight is then re-fetched and re-checked inside its entity's
//! critical section, so an annotation, vote, supersession or deletion that
//! landed in between always wins. An insight whose contributing predictions
//! no longer qualify loses its eligibility for good, so it stops occupying
//! the batch. The same pass re-applies `APPLY_FAILED` insights whose retry
//! is due.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, error, info};

use super::InsightEngine;
use crate::error::InsightResult;
use crate::insight::{AnnotationValue, Insight, InsightId, InsightStatus};
use crate::policy::automatic_processing_eligible;

/// Result of re-checking a selected insight under its entity lock.
enum Recheck {
    Due,
    /// No longer `PENDING`, or still inside the grace period.
    NotDue,
    /// Its contributing predictions no longer support automatic processing.
    Ineligible,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Insights selected as due.
    pub selected: usize,
    /// Insights moved to `AUTO_APPLIED` and written to the catalog.
    pub auto_applied: Vec<InsightId>,
    /// Selected insights whose re-check failed.
    pub skipped: Vec<InsightId>,
    /// Insights whose apply failed (automatic or retry).
    pub failed: Vec<InsightId>,
    /// `APPLY_FAILED` insights re-applied successfully.
    pub retried: Vec<InsightId>,
    /// Insights that could not be processed because of an engine error.
    pub errors: usize,
}

impl InsightEngine {
    /// Pending, eligible insights whose grace period has elapsed at `now`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the selection fails.
    pub fn select_due(&self, now: DateTime<Utc>) -> InsightResult<Vec<Insight>> {
        let cfg = &self.config.automatic_processing;
        Ok(self
            .insights
            .find_auto_processable(now - cfg.grace_period(), cfg.sweep_batch_size)?)
    }

    /// Automatically applies one selected insight, if it still qualifies.
    ///
    /// Returns `None` when the re-check fails: the insight is no longer
    /// `PENDING`, no longer eligible, or still inside its grace period. An
    /// insight found ineligible is persisted as such and never selected again.
    ///
    /// # Errors
    ///
    /// Returns `InsightNotFound` for an unknown id, or a storage error.
    pub fn auto_apply(&self, insight_id: InsightId, now: DateTime<Utc>) -> InsightResult<Option<Insight>> {
        let entity_id = self.get_insight(insight_id)?.entity_id;
        self.locks.with_entity(&entity_id, || -> InsightResult<Option<Insight>> {
            let mut insight = self.get_insight(insight_id)?;
            match self.recheck(&insight, now)? {
                Recheck::Due => {}
                Recheck::NotDue => {
                    debug!(insight_id = %insight_id, status = %insight.status, "sweep re-check failed");
                    return Ok(None);
                }
                Recheck::Ineligible => {
                    insight.automatic_processing_eligible = false;
                    self.insights.update(insight)?;
                    info!(insight_id = %insight_id, "no longer eligible for automatic processing");
                    return Ok(None);
                }
            }

            insight.status = InsightStatus::AutoApplied;
            insight.annotated_at = Some(now);
            insight.annotation_value = Some(AnnotationValue::Accept);
            self.insights.update(insight.clone())?;
            self.apply_locked(insight, now).map(Some)
        })?
    }

    fn recheck(&self, insight: &Insight, now: DateTime<Utc>) -> InsightResult<Recheck> {
        if insight.status != InsightStatus::Pending
            || !insight.automatic_processing_eligible
            || insight.created_at > now - self.config.automatic_processing.grace_period()
        {
            return Ok(Recheck::NotDue);
        }
        let contributing = self.predictions.get_many(&insight.source_prediction_ids)?;
        if contributing.len() == insight.source_prediction_ids.len()
            && automatic_processing_eligible(self.eligibility.as_ref(), &contributing)
        {
            Ok(Recheck::Due)
        } else {
            Ok(Recheck::Ineligible)
        }
    }

    /// Re-applies `APPLY_FAILED` insights whose retry is due at `now`.
    ///
    /// An insight whose earlier write is still in flight is not written
    /// again; its retry moves back by one backoff step instead. One whose
    /// earlier write has since succeeded is returned `APPLIED`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the selection fails.
    pub fn retry_due(&self, now: DateTime<Utc>) -> InsightResult<Vec<Insight>> {
        let due = self
            .insights
            .find_due_retries(now, self.config.automatic_processing.sweep_batch_size)?;
        let mut out = Vec::with_capacity(due.len());
        for candidate in due {
            let retried = self.locks.with_entity(&candidate.entity_id, || -> InsightResult<Option<Insight>> {
                let insight = self.get_insight(candidate.id)?;
                if insight.status != InsightStatus::ApplyFailed || !insight.next_retry_at.is_some_and(|at| at <= now) {
                    return Ok(None);
                }
                let (mut insight, in_flight) = self.settle_late_write(insight, now)?;
                if in_flight {
                    let retry_at = now + self.config.apply.retry_backoff(insight.apply_attempts);
                    debug!(insight_id = %insight.id, retry_at = %retry_at, "previous write still in flight; retry postponed");
                    insight.next_retry_at = Some(retry_at);
                    self.insights.update(insight)?;
                    return Ok(None);
                }
                if insight.status != InsightStatus::ApplyFailed {
                    return Ok(Some(insight));
                }
                self.apply_locked(insight, now).map(Some)
            })??;
            out.extend(retried);
        }
        Ok(out)
    }

    /// Runs one full pass: automatic processing, then due retries.
    ///
    /// Per-insight failures are logged and counted; they never abort the
    /// pass.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a selection query fails.
    pub fn sweep(&self, now: DateTime<Utc>) -> InsightResult<SweepReport> {
        let mut report = SweepReport::default();

        let due = self.select_due(now)?;
        report.selected = due.len();
        for candidate in due {
            match self.auto_apply(candidate.id, now) {
                Ok(Some(insight)) if insight.status == InsightStatus::AutoApplied => {
                    report.auto_applied.push(insight.id);
                }
                Ok(Some(insight)) => report.failed.push(insight.id),
                Ok(None) => report.skipped.push(candidate.id),
                Err(e) => {
                    error!(insight_id = %candidate.id, error = %e, "automatic processing failed");
                    report.errors += 1;
                }
            }
        }

        for insight in self.retry_due(now)? {
            if insight.status == InsightStatus::ApplyFailed {
                report.failed.push(insight.id);
            } else {
                report.retried.push(insight.id);
            }
        }

        info!(
            selected = report.selected,
            auto_applied = report.auto_applied.len(),
            skipped = report.skipped.len(),
            retried = report.retried.len(),
            failed = report.failed.len(),
            errors = report.errors,
            "sweep finished"
        );
        Ok(report)
    }
}

/// Background thread running [`InsightEngine::sweep`] on a fixed interval.
#[derive(Debug)]
pub struct SweepScheduler {
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SweepScheduler {
    /// Starts sweeping every `automatic_processing.sweep_interval_secs`.
    #[must_use]
    pub fn start(engine: Arc<InsightEngine>) -> Self {
        let interval = Duration::from_secs(engine.config().automatic_processing.sweep_interval_secs.max(1));
        Self::with_interval(engine, interval)
    }

    /// Starts sweeping every `interval`.
    #[must_use]
    pub fn with_interval(engine: Arc<InsightEngine>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let join = thread::Builder::new()
            .name("insightflow-sweep".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "sweep scheduler started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Err(e) = engine.sweep(Utc::now()) {
                                error!(error = %e, "sweep pass failed");
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                info!("sweep scheduler stopped");
            })
            .expect("failed to spawn insightflow sweep scheduler");

        Self {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Stops the scheduler and waits for an in-flight pass to finish.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // Dropping the sender wakes the thread with a disconnect.
        drop(self.shutdown.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SweepScheduler {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration as ChronoDuration;

    use crate::catalog::CatalogError;
    use crate::engine::test_support::*;
    use crate::entity::{EntityId, EntitySnapshot};
    use crate::prediction::PredictionType;

    fn eligible_category(engine: &InsightEngine) -> Insight {
        let result = engine
            .reconcile(
                &entity(),
                PredictionType::Category,
                vec![
                    prediction(PredictionType::Category, "matcher", "en:yogurts", Some(0.97), true),
                    prediction(PredictionType::Category, "classifier", "en:yogurts", Some(0.98), true),
                ],
            )
            .unwrap();
        engine.get_insight(result.created[0]).unwrap()
    }

    fn after_grace() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::minutes(11)
    }

    #[test]
    fn grace_period_is_respected() {
        let (catalog, engine) = engine();
        let insight = eligible_category(&engine);

        let early = engine.sweep(Utc::now()).unwrap();
        assert_eq!(early.selected, 0);

        let report = engine.sweep(after_grace()).unwrap();
        assert_eq!(report.auto_applied, vec![insight.id]);
        let done = engine.get_insight(insight.id).unwrap();
        assert_eq!(done.status, InsightStatus::AutoApplied);
        assert!(done.annotator_id.is_none());
        assert_eq!(catalog.apply_calls(), 1);

        let again = engine.sweep(after_grace()).unwrap();
        assert_eq!(again.selected, 0);
        assert_eq!(catalog.apply_calls(), 1);
    }

    #[test]
    fn annotation_between_selection_and_execution_wins() {
        let (catalog, engine) = engine();
        let insight = eligible_category(&engine);
        let now = after_grace();

        let due = engine.select_due(now).unwrap();
        assert_eq!(due.len(), 1);
        engine
            .record_annotation(insight.id, "moderator", AnnotationValue::Reject)
            .unwrap();

        assert!(engine.auto_apply(insight.id, now).unwrap().is_none());
        assert_eq!(
            engine.get_insight(insight.id).unwrap().status,
            InsightStatus::AnnotatedRejected
        );
        assert_eq!(catalog.apply_calls(), 0);
    }

    #[test]
    fn ineligible_insights_are_never_selected() {
        let (_, engine) = engine();
        pending_category(&engine, "en:yogurts");
        assert!(engine.select_due(after_grace()).unwrap().is_empty());
    }

    #[test]
    fn eligibility_is_rechecked_against_the_prediction_log() {
        let (_, engine) = engine();
        let insight = eligible_category(&engine);
        engine.predictions.delete_by_entity(&entity()).unwrap();
        assert!(engine.auto_apply(insight.id, after_grace()).unwrap().is_none());

        let stale = engine.get_insight(insight.id).unwrap();
        assert_eq!(stale.status, InsightStatus::Pending);
        assert!(!stale.automatic_processing_eligible);
        assert!(engine.select_due(after_grace()).unwrap().is_empty());
    }

    #[test]
    fn stale_insight_does_not_hold_the_batch() {
        let mut config = crate::config::EngineConfig::default();
        config.automatic_processing.sweep_batch_size = 1;
        let (catalog, engine) = engine_with(config);
        let stale = eligible_category(&engine);

        let other = EntityId::parse("5449000000996").unwrap();
        catalog.upsert_entity(EntitySnapshot::new(other.clone())).unwrap();
        let mut fresh = Vec::new();
        for predictor in ["matcher", "classifier"] {
            let mut p = prediction(PredictionType::Category, predictor, "en:sodas", Some(0.97), true);
            p.entity_id = other.clone();
            fresh.push(p);
        }
        let result = engine.reconcile(&other, PredictionType::Category, fresh).unwrap();
        let due = result.created[0];

        engine.predictions.delete_by_entity(&entity()).unwrap();

        let first = engine.sweep(after_grace()).unwrap();
        assert_eq!(first.skipped, vec![stale.id]);
        let second = engine.sweep(after_grace()).unwrap();
        assert_eq!(second.auto_applied, vec![due]);
        assert_eq!(engine.get_insight(due).unwrap().status, InsightStatus::AutoApplied);
        assert_eq!(catalog.apply_calls(), 1);
    }

    #[test]
    fn retry_waits_for_a_write_still_in_flight() {
        let mut config = crate::config::EngineConfig::default();
        config.apply.timeout_ms = 20;
        let (catalog, engine) = engine_with(config);
        let insight = eligible_category(&engine);
        catalog.set_write_delay(Some(Duration::from_millis(300)));

        let now = after_grace();
        let report = engine.sweep(now).unwrap();
        assert_eq!(report.failed, vec![insight.id]);
        let retry_at = engine.get_insight(insight.id).unwrap().next_retry_at.unwrap();

        let postponed = engine.sweep(retry_at).unwrap();
        assert!(postponed.retried.is_empty() && postponed.failed.is_empty());
        let waiting = engine.get_insight(insight.id).unwrap();
        assert_eq!(waiting.apply_attempts, 1);
        assert!(waiting.next_retry_at.unwrap() > retry_at);
        assert_eq!(catalog.apply_calls(), 1);

        thread::sleep(Duration::from_millis(500));
        let report = engine.sweep(waiting.next_retry_at.unwrap()).unwrap();
        assert_eq!(report.retried, vec![insight.id]);
        assert_eq!(engine.get_insight(insight.id).unwrap().status, InsightStatus::Applied);
        assert_eq!(catalog.apply_calls(), 1);
    }

    #[test]
    fn failed_auto_apply_is_retried_after_backoff() {
        let (catalog, engine) = engine();
        let insight = eligible_category(&engine);
        catalog.fail_next(CatalogError::Unavailable {
            reason: "503".to_string(),
        });

        let now = after_grace();
        let report = engine.sweep(now).unwrap();
        assert_eq!(report.failed, vec![insight.id]);
        let failed = engine.get_insight(insight.id).unwrap();
        assert_eq!(failed.status, InsightStatus::ApplyFailed);
        let retry_at = failed.next_retry_at.unwrap();

        let too_early = engine.sweep(retry_at - ChronoDuration::seconds(1)).unwrap();
        assert!(too_early.retried.is_empty());

        let report = engine.sweep(retry_at).unwrap();
        assert_eq!(report.retried, vec![insight.id]);
        assert_eq!(engine.get_insight(insight.id).unwrap().status, InsightStatus::Applied);
        assert_eq!(catalog.effective_writes(), 1);
    }

    #[test]
    fn scheduler_sweeps_in_background() {
        let mut config = crate::config::EngineConfig::default();
        config.automatic_processing.grace_period_secs = 0;
        let (catalog, engine) = engine_with(config);
        let engine = Arc::new(engine);
        let insight = eligible_category(&engine);

        let scheduler = SweepScheduler::with_interval(Arc::clone(&engine), Duration::from_millis(10));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while engine.get_insight(insight.id).unwrap().status == InsightStatus::Pending {
            assert!(std::time::Instant::now() < deadline, "sweep never ran");
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();

        assert_eq!(engine.get_insight(insight.id).unwrap().status, InsightStatus::AutoApplied);
        assert_eq!(catalog.apply_calls(), 1);
    }
}
