//! Error types for insightflow.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific conditions (an `AlreadyAnnotated` is an answer, a retryable
//! `ApplyError` is a schedule, an `InvariantViolation` is a bug).

use thiserror::Error;

use crate::insight::{InsightId, InsightStatus};
use crate::prediction::PredictionType;
use crate::storage::StorageError;

/// Validation errors raised at the boundary, before any state changes.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Malformed event: {reason}")]
    MalformedEvent {
        reason: String,
    },

    #[error("Entity id cannot be empty")]
    EmptyEntityId,

    #[error("Invalid entity id '{id}'")]
    InvalidEntityId {
        id: String,
    },

    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f32,
    },

    #[error("Prediction value {value} is not a finite number")]
    NonFiniteValue {
        value: f64,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Prediction {prediction} does not belong to slot ({entity_id}, {insight_type})")]
    PredictionSlotMismatch {
        prediction: String,
        entity_id: String,
        insight_type: PredictionType,
    },

    #[error("Unknown prediction type '{name}'")]
    UnknownPredictionType {
        name: String,
    },

    #[error("Annotator id cannot be empty")]
    EmptyActorId,

    #[error("Voter fingerprint cannot be empty")]
    EmptyVoterFingerprint,

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors raised while running an operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Insight not found: {id}")]
    InsightNotFound {
        id: InsightId,
    },

    #[error("Insight {id} is already annotated (status: {status})")]
    AlreadyAnnotated {
        id: InsightId,
        status: InsightStatus,
    },

    #[error("Insight {id} is not awaiting an apply retry (status: {status})")]
    NotRetryable {
        id: InsightId,
        status: InsightStatus,
    },

    #[error("Lane queue full: {lane} (capacity: {capacity})")]
    QueueFull {
        lane: String,
        capacity: usize,
    },

    #[error("Lane disconnected: {lane}")]
    Disconnected {
        lane: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error(
        "Invariant violated: {count} open insights for single-valued slot ({entity_id}, {insight_type})"
    )]
    InvariantViolation {
        entity_id: String,
        insight_type: PredictionType,
        count: usize,
    },
}

/// Errors produced by the catalog apply gateway.
///
/// The split drives the lifecycle: retryable failures are scheduled for
/// another attempt, permanent ones wait for manual intervention.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("Retryable apply failure: {reason}")]
    Retryable {
        reason: String,
    },

    #[error("Apply timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Permanent apply failure: {reason}")]
    Permanent {
        reason: String,
    },

    #[error("Entity no longer exists in the catalog: {entity_id}")]
    EntityGone {
        entity_id: String,
    },
}

impl ApplyError {
    /// Returns true if a later attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. } | Self::Timeout { .. })
    }
}

/// A single predictor failed; other predictors are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredictorError {
    #[error("Predictor '{predictor_id}' failed: {reason}")]
    Failed {
        predictor_id: String,
        reason: String,
    },

    /// A transient condition (model server down, rate limit); worth retrying.
    #[error("Predictor '{predictor_id}' unavailable: {reason}")]
    Unavailable {
        predictor_id: String,
        reason: String,
    },

    #[error("Predictor '{predictor_id}' panicked")]
    Panicked {
        predictor_id: String,
    },

    #[error("Predictor '{predictor_id}' returned a prediction for foreign entity {entity_id}")]
    ForeignEntity {
        predictor_id: String,
        entity_id: String,
    },
}

impl PredictorError {
    /// Creates a generic failure for the given predictor.
    #[must_use]
    pub fn failed(predictor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            predictor_id: predictor_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a transient failure for the given predictor.
    #[must_use]
    pub fn unavailable(predictor_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            predictor_id: predictor_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if running the predictor again may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns the id of the predictor that failed.
    #[must_use]
    pub fn predictor_id(&self) -> &str {
        match self {
            Self::Failed { predictor_id, .. }
            | Self::Unavailable { predictor_id, .. }
            | Self::Panicked { predictor_id }
            | Self::ForeignEntity { predictor_id, .. } => predictor_id,
        }
    }
}

/// Top-level error type for insightflow.
#[derive(Debug, Error)]
pub enum InsightError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Predictor error: {0}")]
    Predictor(#[from] PredictorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl InsightError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the insight was already annotated.
    #[must_use]
    pub const fn is_already_annotated(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::AlreadyAnnotated { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Predictor(e) => e.is_retryable(),
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }
            ),
            Self::Apply(e) => e.is_retryable(),
            Self::Storage(e) => matches!(e, StorageError::ConnectionError(_)),
        }
    }
}

/// Result type alias for insightflow operations.
pub type InsightResult<T> = Result<T, InsightError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_malformed_event() {
        let err = ValidationError::MalformedEvent {
            reason: "missing entity_id".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("Malformed event"));
        assert!(msg.contains("missing entity_id"));
    }

    #[test]
    fn test_execution_error_already_annotated() {
        let err = ExecutionError::AlreadyAnnotated {
            id: InsightId::new(),
            status: InsightStatus::AnnotatedRejected,
        };
        let msg = format!("{err}");
        assert!(msg.contains("already annotated"));
        assert!(msg.contains("annotated_rejected"));
    }

    #[test]
    fn test_execution_error_invariant() {
        let err = ExecutionError::InvariantViolation {
            entity_id: "3017620422003".to_string(),
            insight_type: PredictionType::Category,
            count: 2,
        };
        let msg = format!("{err}");
        assert!(msg.contains("3017620422003"));
        assert!(msg.contains("category"));
    }

    #[test]
    fn test_apply_error_retryable_split() {
        assert!(ApplyError::Retryable { reason: "503".into() }.is_retryable());
        assert!(ApplyError::Timeout { duration_ms: 10 }.is_retryable());
        assert!(!ApplyError::Permanent { reason: "bad".into() }.is_retryable());
        assert!(!ApplyError::EntityGone { entity_id: "x".into() }.is_retryable());
    }

    #[test]
    fn test_predictor_error_id() {
        let err = PredictorError::failed("ocr-brand", "no text");
        assert_eq!(err.predictor_id(), "ocr-brand");
        assert!(err.to_string().contains("no text"));
        assert!(!err.is_retryable());

        let err = PredictorError::unavailable("ocr-brand", "503");
        assert_eq!(err.predictor_id(), "ocr-brand");
        assert!(err.is_retryable());
        assert!(InsightError::from(err).is_retryable());
    }

    #[test]
    fn test_insight_error_retryable() {
        let err: InsightError = ValidationError::EmptyEntityId.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());

        let err: InsightError = ExecutionError::Timeout { duration_ms: 100 }.into();
        assert!(err.is_execution());
        assert!(err.is_retryable());

        let err: InsightError = ApplyError::Timeout { duration_ms: 100 }.into();
        assert!(err.is_retryable());

        let err = InsightError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unexpected state"));
    }
}
