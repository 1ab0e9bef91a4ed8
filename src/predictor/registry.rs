//! Predictor registry.
//!
//! Runs every predictor registered for an event kind and isolates their
//! failures: an error, a panic, or a prediction for the wrong entity from one
//! predictor is recorded and logged but never stops the others. A predictor
//! reporting itself `Unavailable` is run again after a short backoff, up to
//! the configured number of attempts.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use super::{PredictionContext, Predictor};
use crate::config::PredictorConfig;
use crate::entity::EntityId;
use crate::error::PredictorError;
use crate::prediction::Prediction;

/// Outcome of running the registry for one event.
#[derive(Debug, Default)]
pub struct PredictionRun {
    /// Predictions from every predictor that succeeded.
    pub predictions: Vec<Prediction>,
    /// One entry per predictor that failed.
    pub failures: Vec<PredictorError>,
}

/// Ordered set of predictors.
#[derive(Default)]
pub struct PredictorRegistry {
    predictors: Vec<Arc<dyn Predictor>>,
    retry: PredictorConfig,
}

impl std::fmt::Debug for PredictorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.predictors.iter().map(|p| p.id().to_string()))
            .finish()
    }
}

impl PredictorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predictor.
    pub fn register(&mut self, predictor: Arc<dyn Predictor>) {
        self.predictors.push(predictor);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.register(predictor);
        self
    }

    /// Replaces the retry settings for `Unavailable` predictors.
    #[must_use]
    pub fn with_retry(mut self, retry: PredictorConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.predictors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predictors.is_empty()
    }

    /// Runs every predictor that handles `context.event_kind`.
    pub fn run(&self, entity_id: &EntityId, context: &PredictionContext) -> PredictionRun {
        let mut run = PredictionRun::default();

        for predictor in self.predictors.iter().filter(|p| p.handles(context.event_kind)) {
            match self.run_with_retry(predictor.as_ref(), entity_id, context) {
                Ok(predictions) => {
                    debug!(
                        predictor = predictor.id(),
                        entity_id = %entity_id,
                        count = predictions.len(),
                        "predictor finished"
                    );
                    run.predictions.extend(predictions);
                }
                Err(err) => {
                    warn!(
                        predictor = err.predictor_id(),
                        entity_id = %entity_id,
                        error = %err,
                        "predictor failed"
                    );
                    run.failures.push(err);
                }
            }
        }

        run
    }

    fn run_with_retry(
        &self,
        predictor: &dyn Predictor,
        entity_id: &EntityId,
        context: &PredictionContext,
    ) -> Result<Vec<Prediction>, PredictorError> {
        let mut attempt = 1;
        loop {
            match Self::run_one(predictor, entity_id, context) {
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.retry_backoff(attempt);
                    debug!(
                        predictor = predictor.id(),
                        entity_id = %entity_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "predictor unavailable; retrying"
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    fn run_one(
        predictor: &dyn Predictor,
        entity_id: &EntityId,
        context: &PredictionContext,
    ) -> Result<Vec<Prediction>, PredictorError> {
        let predictions = panic::catch_unwind(AssertUnwindSafe(|| predictor.predict(entity_id, context)))
            .map_err(|_| PredictorError::Panicked {
                predictor_id: predictor.id().to_string(),
            })??;

        if let Some(foreign) = predictions.iter().find(|p| p.entity_id != *entity_id) {
            return Err(PredictorError::ForeignEntity {
                predictor_id: predictor.id().to_string(),
                entity_id: foreign.entity_id.to_string(),
            });
        }

        Ok(predictions)
    }
}
