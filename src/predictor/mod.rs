//! Predictor adapters.
//!
//! A predictor turns one trigger event for one entity into zero or more
//! predictions. Predictors are leaf components: they never touch storage and
//! their output is only persisted through reconciliation.

mod registry;

pub use registry::{PredictionRun, PredictorRegistry};

use std::fmt;

use chrono::{DateTime, Utc};

use crate::entity::{EntityId, EntitySnapshot};
use crate::error::PredictorError;
use crate::event::{EventKind, TriggerEvent};
use crate::prediction::Prediction;

/// What a predictor gets to look at.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionContext {
    /// The event that triggered this run.
    pub event_kind: EventKind,
    /// The uploaded image, for `AssetUploaded` events.
    pub asset_id: Option<String>,
    /// When the event was received.
    pub received_at: DateTime<Utc>,
    /// Current catalog state of the entity, if it could be read.
    pub snapshot: Option<EntitySnapshot>,
}

impl PredictionContext {
    /// Builds the context for an event.
    #[must_use]
    pub fn from_event(event: &TriggerEvent, snapshot: Option<EntitySnapshot>) -> Self {
        Self {
            event_kind: event.kind,
            asset_id: event.asset_id.clone(),
            received_at: event.timestamp,
            snapshot,
        }
    }
}

/// A source of predictions.
pub trait Predictor: Send + Sync {
    /// Stable identifier recorded on every prediction this predictor makes.
    fn id(&self) -> &str;

    /// Returns true if this predictor runs for `kind`.
    fn handles(&self, kind: EventKind) -> bool;

    /// Produces predictions for `entity_id`.
    ///
    /// # Errors
    ///
    /// Returns `PredictorError` if the predictor cannot produce a result.
    /// `Unavailable` marks a transient condition; the registry runs the
    /// predictor again after a backoff.
    fn predict(
        &self,
        entity_id: &EntityId,
        context: &PredictionContext,
    ) -> Result<Vec<Prediction>, PredictorError>;
}

type PredictFn =
    dyn Fn(&EntityId, &PredictionContext) -> Result<Vec<Prediction>, PredictorError> + Send + Sync;

/// Adapts a closure into a [`Predictor`].
///
/// # Examples
///
/// ```
/// use insightflow::{EventKind, FnPredictor, Prediction, PredictionType, Predictor, PredictorError};
///
/// let predictor = FnPredictor::new("category-matcher", |entity_id, _ctx| {
///     Ok(vec![Prediction::builder()
///         .entity(entity_id.clone())
///         .prediction_type(PredictionType::Category)
///         .predictor("category-matcher")
///         .value("en:yogurts")
///         .build()
///         .map_err(|e| PredictorError::failed("category-matcher", e.to_string()))?])
/// })
/// .on(&[EventKind::EntityUpdated]);
///
/// assert!(predictor.handles(EventKind::EntityUpdated));
/// assert!(!predictor.handles(EventKind::AssetUploaded));
/// ```
pub struct FnPredictor {
    id: String,
    kinds: Vec<EventKind>,
    f: Box<PredictFn>,
}

impl FnPredictor {
    /// Wraps `f`. By default the predictor runs for every non-deletion event.
    pub fn new<F>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(&EntityId, &PredictionContext) -> Result<Vec<Prediction>, PredictorError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            kinds: vec![
                EventKind::EntityUpdated,
                EventKind::AssetUploaded,
                EventKind::ScheduledRescan,
            ],
            f: Box::new(f),
        }
    }

    /// Restricts the predictor to `kinds`.
    #[must_use]
    pub fn on(mut self, kinds: &[EventKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }
}

impl fmt::Debug for FnPredictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPredictor")
            .field("id", &self.id)
            .field("kinds", &self.kinds)
            .finish_non_exhaustive()
    }
}

impl Predictor for FnPredictor {
    fn id(&self) -> &str {
        &self.id
    }

    fn handles(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn predict(
        &self,
        entity_id: &EntityId,
        context: &PredictionContext,
    ) -> Result<Vec<Prediction>, PredictorError> {
        (self.f)(entity_id, context)
    }
}
