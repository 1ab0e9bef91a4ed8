//! Annotation state machine.
//!
//! Human annotations and anonymous votes move a `PENDING` insight towards a
//! decision. Accepted insights are applied synchronously, inside the entity's
//! critical section; a failed apply leaves the insight `APPLY_FAILED` with a
//! retry scheduled when the failure is transient. A write that timed out may
//! still land later; `settle_late_write` folds its outcome back in.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::InsightEngine;
use crate::apply::WriteState;
use crate::catalog::Ack;
use crate::error::{ApplyError, ExecutionError, InsightResult, ValidationError};
use crate::insight::{AnnotationValue, Insight, InsightId, InsightStatus};
use crate::vote::Vote;

impl InsightEngine {
    /// Records a decision from an authenticated actor.
    ///
    /// `Accept` applies the insight to the catalog and returns it as
    /// `APPLIED` (or `APPLY_FAILED`). `Reject` closes it. `Unknown` is a skip
    /// and leaves the insight unchanged.
    ///
    /// # Errors
    ///
    /// - `EmptyActorId` for a blank actor.
    /// - `InsightNotFound` for an unknown id.
    /// - `AlreadyAnnotated` unless the insight is `PENDING`.
    pub fn record_annotation(
        &self,
        insight_id: InsightId,
        actor_id: &str,
        value: AnnotationValue,
    ) -> InsightResult<Insight> {
        let actor_id = actor_id.trim();
        if actor_id.is_empty() {
            return Err(ValidationError::EmptyActorId.into());
        }

        let entity_id = self.get_insight(insight_id)?.entity_id;
        self.locks.with_entity(&entity_id, || -> InsightResult<Insight> {
            let mut insight = self.get_insight(insight_id)?;
            if insight.status != InsightStatus::Pending {
                return Err(ExecutionError::AlreadyAnnotated {
                    id: insight_id,
                    status: insight.status,
                }
                .into());
            }

            let status = match value {
                AnnotationValue::Unknown => {
                    debug!(insight_id = %insight_id, actor = actor_id, "annotation skipped");
                    return Ok(insight);
                }
                AnnotationValue::Accept => InsightStatus::AnnotatedAccepted,
                AnnotationValue::Reject => InsightStatus::AnnotatedRejected,
            };

            insight.status = status;
            insight.annotated_at = Some(Utc::now());
            insight.annotator_id = Some(actor_id.to_string());
            insight.annotation_value = Some(value);
            self.insights.update(insight.clone())?;
            info!(insight_id = %insight_id, actor = actor_id, status = %status, "insight annotated");

            if value == AnnotationValue::Accept {
                self.apply_locked(insight, Utc::now())
            } else {
                Ok(insight)
            }
        })?
    }

    /// Records an anonymous vote.
    ///
    /// Votes are keyed by fingerprint; a second vote from the same
    /// fingerprint replaces the first. The first vote moves the insight to
    /// `VOTE_ACCUMULATING`; once `Accept` or `Reject` reaches the configured
    /// threshold the insight resolves, and an accepted one is applied.
    ///
    /// # Errors
    ///
    /// - `EmptyVoterFingerprint` for a blank fingerprint.
    /// - `InsightNotFound` for an unknown id.
    /// - `AlreadyAnnotated` if the insight no longer takes votes.
    pub fn cast_vote(
        &self,
        insight_id: InsightId,
        voter_fingerprint: &str,
        value: AnnotationValue,
    ) -> InsightResult<Insight> {
        let fingerprint = voter_fingerprint.trim();
        if fingerprint.is_empty() {
            return Err(ValidationError::EmptyVoterFingerprint.into());
        }

        let entity_id = self.get_insight(insight_id)?.entity_id;
        self.locks.with_entity(&entity_id, || -> InsightResult<Insight> {
            let mut insight = self.get_insight(insight_id)?;
            if !insight.status.accepts_votes() {
                return Err(ExecutionError::AlreadyAnnotated {
                    id: insight_id,
                    status: insight.status,
                }
                .into());
            }

            self.votes.upsert(Vote::new(insight_id, fingerprint, value))?;
            insight.vote_tally = self.votes.tally(insight_id)?;
            insight.status = InsightStatus::VoteAccumulating;

            let threshold = self.config.automatic_processing.vote_threshold;
            let Some(decision) = insight.vote_tally.consensus(threshold) else {
                debug!(insight_id = %insight_id, total = insight.vote_tally.total(), "vote recorded");
                self.insights.update(insight.clone())?;
                return Ok(insight);
            };

            insight.status = match decision {
                AnnotationValue::Accept => InsightStatus::VoteAccepted,
                _ => InsightStatus::VoteRejected,
            };
            insight.annotated_at = Some(Utc::now());
            insight.annotation_value = Some(decision);
            self.insights.update(insight.clone())?;
            info!(
                insight_id = %insight_id,
                status = %insight.status,
                votes = insight.vote_tally.total(),
                "vote consensus reached"
            );

            if decision == AnnotationValue::Accept {
                self.apply_locked(insight, Utc::now())
            } else {
                Ok(insight)
            }
        })?
    }

    /// Re-applies an `APPLY_FAILED` insight now, whatever its failure kind.
    ///
    /// If the timed-out write of an earlier attempt has since succeeded, the
    /// insight is returned `APPLIED` without a new write.
    ///
    /// # Errors
    ///
    /// - `InsightNotFound` for an unknown id.
    /// - `NotRetryable` unless the insight is `APPLY_FAILED`.
    /// - A retryable apply error while an earlier write is still in flight.
    pub fn retry_apply(&self, insight_id: InsightId) -> InsightResult<Insight> {
        let entity_id = self.get_insight(insight_id)?.entity_id;
        self.locks.with_entity(&entity_id, || -> InsightResult<Insight> {
            let insight = self.get_insight(insight_id)?;
            if insight.status != InsightStatus::ApplyFailed {
                return Err(ExecutionError::NotRetryable {
                    id: insight_id,
                    status: insight.status,
                }
                .into());
            }
            let now = Utc::now();
            let (insight, in_flight) = self.settle_late_write(insight, now)?;
            if in_flight {
                return Err(ApplyError::Retryable {
                    reason: "previous write still in flight".to_string(),
                }
                .into());
            }
            if insight.status != InsightStatus::ApplyFailed {
                return Ok(insight);
            }
            self.apply_locked(insight, now)
        })?
    }

    /// Resolves the timed-out write of an `APPLY_FAILED` insight, if any.
    ///
    /// Returns the insight, persisted as `APPLIED` when the write succeeded
    /// after all, and whether the write is still in flight. Must run inside
    /// the entity's critical section.
    pub(super) fn settle_late_write(&self, mut insight: Insight, now: DateTime<Utc>) -> InsightResult<(Insight, bool)> {
        if insight.status != InsightStatus::ApplyFailed {
            return Ok((insight, false));
        }
        match self.gateway.poll_write(insight.id) {
            WriteState::Idle => Ok((insight, false)),
            WriteState::InFlight => Ok((insight, true)),
            WriteState::Landed(outcome) => {
                self.record_apply_outcome(&mut insight, outcome, now);
                self.insights.update(insight.clone())?;
                Ok((insight, false))
            }
        }
    }

    /// Writes an accepted insight to the catalog and records the outcome.
    /// Must run inside the entity's critical section.
    pub(super) fn apply_locked(&self, mut insight: Insight, now: DateTime<Utc>) -> InsightResult<Insight> {
        insight.apply_attempts = insight.apply_attempts.saturating_add(1);
        let outcome = self.gateway.apply(&insight);
        self.record_apply_outcome(&mut insight, outcome, now);
        self.insights.update(insight.clone())?;
        Ok(insight)
    }

    fn record_apply_outcome(&self, insight: &mut Insight, outcome: Result<Ack, ApplyError>, now: DateTime<Utc>) {
        match outcome {
            Ok(ack) => {
                if insight.status != InsightStatus::AutoApplied {
                    insight.status = InsightStatus::Applied;
                }
                insight.applied_at = Some(now);
                insight.last_apply_error = None;
                insight.next_retry_at = None;
                info!(
                    insight_id = %insight.id,
                    entity_id = %insight.entity_id,
                    status = %insight.status,
                    changed = ack.changed,
                    "insight applied"
                );
            }
            Err(err) => {
                insight.status = InsightStatus::ApplyFailed;
                insight.last_apply_error = Some(err.to_string());
                let max_attempts = self.config.apply.max_attempts;
                if err.is_retryable() && insight.apply_attempts < max_attempts {
                    let retry_at = now + self.config.apply.retry_backoff(insight.apply_attempts);
                    insight.next_retry_at = Some(retry_at);
                    warn!(
                        insight_id = %insight.id,
                        attempts = insight.apply_attempts,
                        retry_at = %retry_at,
                        error = %err,
                        "apply failed; retry scheduled"
                    );
                } else {
                    insight.next_retry_at = None;
                    error!(
                        insight_id = %insight.id,
                        entity_id = %insight.entity_id,
                        attempts = insight.apply_attempts,
                        error = %err,
                        "apply failed permanently; manual intervention required"
                    );
                }
            }
        }
    }
}
