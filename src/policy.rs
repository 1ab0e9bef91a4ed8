//! Reconciliation policies.
//!
//! Policies are pure (no I/O) so a reconciliation pass can be reproduced
//! deterministically from the same predictions and insights.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AutomaticProcessingConfig;
use crate::prediction::{Prediction, PredictionType};

/// Decides whether a single prediction is trustworthy enough for automatic
/// processing. Evaluated per contributing prediction.
pub trait EligibilityPolicy: Send + Sync {
    /// Returns true if `prediction` passes the type-specific bar.
    fn allows(&self, prediction: &Prediction) -> bool;

    /// Returns a short stable identifier suitable for logging.
    fn name(&self) -> &'static str;
}

/// Confidence ≥ per-type calibrated threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPolicy {
    default_threshold: f32,
    thresholds: BTreeMap<PredictionType, f32>,
}

impl ThresholdPolicy {
    /// Creates a policy with one threshold for every type.
    #[must_use]
    pub fn uniform(threshold: f32) -> Self {
        Self {
            default_threshold: threshold,
            thresholds: BTreeMap::new(),
        }
    }

    /// Creates a policy from the automatic processing configuration.
    #[must_use]
    pub fn from_config(config: &AutomaticProcessingConfig) -> Self {
        Self {
            default_threshold: config.default_threshold,
            thresholds: config.thresholds.clone(),
        }
    }

    /// Overrides the threshold for one type.
    #[must_use]
    pub fn with_threshold(mut self, insight_type: PredictionType, threshold: f32) -> Self {
        self.thresholds.insert(insight_type, threshold);
        self
    }

    /// Threshold applied to `insight_type`.
    #[must_use]
    pub fn threshold_for(&self, insight_type: PredictionType) -> f32 {
        self.thresholds
            .get(&insight_type)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::from_config(&AutomaticProcessingConfig::default())
    }
}

impl EligibilityPolicy for ThresholdPolicy {
    fn allows(&self, prediction: &Prediction) -> bool {
        prediction
            .confidence
            .is_some_and(|c| c >= self.threshold_for(prediction.prediction_type))
    }

    fn name(&self) -> &'static str {
        "confidence_threshold"
    }
}

/// Returns true if every contributing prediction is hinted, carries a
/// confidence, and passes `policy`. An empty set is never eligible.
pub fn automatic_processing_eligible<'a>(
    policy: &dyn EligibilityPolicy,
    contributing: impl IntoIterator<Item = &'a Prediction>,
) -> bool {
    let mut any = false;
    for prediction in contributing {
        any = true;
        if !prediction.automatic_processing_hint
            || prediction.confidence.is_none()
            || !policy.allows(prediction)
        {
            return false;
        }
    }
    any
}

/// What reconciliation does when a previously rejected value is predicted
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectedValuePolicy {
    /// Rejection is final for that value.
    #[default]
    Sticky,

    /// Re-open when the new evidence is strictly more confident than the
    /// rejected insight was. Unknown confidence on either side never
    /// re-opens.
    ReopenOnHigherConfidence,
}

impl RejectedValuePolicy {
    /// Returns true if a new insight may be created for a rejected value.
    #[must_use]
    pub fn allows_reopen(self, rejected_confidence: Option<f32>, new_confidence: Option<f32>) -> bool {
        match self {
            Self::Sticky => false,
            Self::ReopenOnHigherConfidence => match (rejected_confidence, new_confidence) {
                (Some(old), Some(new)) => new > old,
                _ => false,
            },
        }
    }

    /// Returns a short stable identifier suitable for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sticky => "sticky",
            Self::ReopenOnHigherConfidence => "reopen_on_higher_confidence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::entity::EntityId;

    fn prediction(t: PredictionType, confidence: Option<f32>, hint: bool) -> Prediction {
        let mut builder = Prediction::builder()
            .entity(EntityId::parse("X").unwrap())
            .prediction_type(t)
            .predictor("p")
            .value("v")
            .automatic_processing(hint);
        if let Some(c) = confidence {
            builder = builder.confidence(c);
        }
        builder.build().unwrap()
    }

    #[test]
    fn threshold_policy_uses_per_type_thresholds() {
        let policy = ThresholdPolicy::default();
        assert!(policy.allows(&prediction(PredictionType::Label, Some(0.61), true)));
        assert!(!policy.allows(&prediction(PredictionType::Category, Some(0.9), true)));
        assert!(policy.allows(&prediction(PredictionType::Category, Some(0.95), true)));
        assert!(!policy.allows(&prediction(PredictionType::Category, None, true)));
    }

    #[test]
    fn eligibility_requires_every_prediction() {
        let policy = ThresholdPolicy::uniform(0.5);
        let good = prediction(PredictionType::Category, Some(0.9), true);
        let unhinted = prediction(PredictionType::Category, Some(0.9), false);
        let uncertain = prediction(PredictionType::Category, None, true);

        assert!(automatic_processing_eligible(&policy, [&good]));
        assert!(!automatic_processing_eligible(&policy, [&good, &unhinted]));
        assert!(!automatic_processing_eligible(&policy, [&good, &uncertain]));
        assert!(!automatic_processing_eligible(&policy, std::iter::empty()));
    }

    #[test]
    fn null_confidence_is_never_eligible_even_with_permissive_policy() {
        let policy = ThresholdPolicy::uniform(0.0);
        let uncertain = prediction(PredictionType::Label, None, true);
        assert!(!automatic_processing_eligible(&policy, [&uncertain]));
    }

    #[test]
    fn rejected_value_policy() {
        assert!(!RejectedValuePolicy::Sticky.allows_reopen(Some(0.1), Some(0.99)));
        let reopen = RejectedValuePolicy::ReopenOnHigherConfidence;
        assert!(reopen.allows_reopen(Some(0.6), Some(0.9)));
        assert!(!reopen.allows_reopen(Some(0.9), Some(0.9)));
        assert!(!reopen.allows_reopen(None, Some(0.9)));
        assert!(!reopen.allows_reopen(Some(0.6), None));
        assert_eq!(reopen.name(), "reopen_on_higher_confidence");
    }
}
