//! Engine configuration.
//!
//! Every tuned policy constant (grace period, vote threshold, confidence
//! thresholds, retry backoff) lives here rather than in code. Configuration
//! is plain data with defaults and can be loaded from TOML:
//!
//! ```toml
//! [routing]
//! high_lanes = 8
//!
//! [automatic_processing]
//! grace_period_secs = 600
//! vote_threshold = 3
//!
//! [automatic_processing.thresholds]
//! category = 0.95
//! label = 0.6
//!
//! [reconciliation]
//! rejected_value_policy = "sticky"
//!
//! [predictors]
//! max_attempts = 3
//! retry_backoff_ms = 50
//!
//! [campaigns]
//! category = "agribalyse-category"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::entity::{EntityIdValidator, DEFAULT_ENTITY_ID_PATTERN};
use crate::error::ValidationError;
use crate::policy::RejectedValuePolicy;
use crate::prediction::PredictionType;

/// Lane and worker provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Number of HIGH lanes; one worker thread drains each.
    pub high_lanes: usize,
    /// Number of workers bound only to the shared LOW lane.
    pub low_workers: usize,
    /// Maximum queued jobs per lane.
    pub queue_capacity: usize,
    /// HIGH lane workers pull LOW work once their own lane is empty.
    pub high_workers_take_low: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            high_lanes: 4,
            low_workers: 1,
            queue_capacity: 1024,
            high_workers_take_low: true,
        }
    }
}

/// Automatic processing and voting policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomaticProcessingConfig {
    /// Delay between insight creation and automatic application.
    pub grace_period_secs: u64,
    /// Votes for one value needed to resolve an insight.
    pub vote_threshold: u32,
    /// Confidence threshold for types without an explicit entry.
    pub default_threshold: f32,
    /// Per-type confidence thresholds.
    pub thresholds: BTreeMap<PredictionType, f32>,
    /// Interval between sweep passes.
    pub sweep_interval_secs: u64,
    /// Maximum insights handled per sweep pass.
    pub sweep_batch_size: usize,
}

impl Default for AutomaticProcessingConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 600,
            vote_threshold: 3,
            default_threshold: 0.95,
            thresholds: BTreeMap::from([
                (PredictionType::Category, 0.95),
                (PredictionType::Label, 0.6),
            ]),
            sweep_interval_secs: 60,
            sweep_batch_size: 500,
        }
    }
}

impl AutomaticProcessingConfig {
    /// The grace period as a chrono duration.
    #[must_use]
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX))
    }

    /// Confidence threshold for `insight_type`.
    #[must_use]
    pub fn threshold_for(&self, insight_type: PredictionType) -> f32 {
        self.thresholds
            .get(&insight_type)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

/// Catalog apply behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Upper bound on a single catalog write.
    pub timeout_ms: u64,
    /// Attempts (including the first) before automatic retries stop.
    pub max_attempts: u32,
    /// Backoff after the first failure; doubles per attempt.
    pub retry_backoff_secs: u64,
    /// Backoff ceiling.
    pub retry_backoff_max_secs: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_attempts: 5,
            retry_backoff_secs: 60,
            retry_backoff_max_secs: 3_600,
        }
    }
}

impl ApplyConfig {
    /// The write timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before the retry following attempt number `attempts`.
    #[must_use]
    pub fn retry_backoff(&self, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let secs = self
            .retry_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.retry_backoff_max_secs);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}

/// Retry of transiently unavailable predictors within one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Runs (including the first) of a predictor reporting `Unavailable`.
    pub max_attempts: u32,
    /// Pause before the second run; doubles per run.
    pub retry_backoff_ms: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl PredictorConfig {
    /// Pause after run number `attempt` failed.
    #[must_use]
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << exponent))
    }
}

/// Reconciliation behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// What to do when a rejected value is predicted again.
    pub rejected_value_policy: RejectedValuePolicy,
    /// Accepted shape for entity ids.
    pub entity_id_pattern: String,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            rejected_value_policy: RejectedValuePolicy::default(),
            entity_id_pattern: DEFAULT_ENTITY_ID_PATTERN.to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub routing: RoutingConfig,
    pub automatic_processing: AutomaticProcessingConfig,
    pub apply: ApplyConfig,
    pub reconciliation: ReconciliationConfig,
    pub predictors: PredictorConfig,
    /// Campaign tag stamped on new insights, per type.
    pub campaigns: BTreeMap<PredictionType, String>,
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unparsable TOML or invalid values.
    pub fn from_toml_str(content: &str) -> Result<Self, ValidationError> {
        let config: Self = toml::from_str(content).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("parse TOML failed: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("read {} failed: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), high_lanes = config.routing.high_lanes, "loaded engine configuration");
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first invalid value.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| Err(ValidationError::InvalidConfig { reason });

        if self.routing.high_lanes == 0 {
            return invalid("routing.high_lanes must be at least 1".to_string());
        }
        if self.routing.queue_capacity == 0 {
            return invalid("routing.queue_capacity must be at least 1".to_string());
        }
        if self.routing.low_workers == 0 && !self.routing.high_workers_take_low {
            return invalid("no worker drains the LOW lane".to_string());
        }

        let auto = &self.automatic_processing;
        if auto.vote_threshold == 0 {
            return invalid("automatic_processing.vote_threshold must be at least 1".to_string());
        }
        if auto.sweep_batch_size == 0 {
            return invalid("automatic_processing.sweep_batch_size must be at least 1".to_string());
        }
        let thresholds = std::iter::once(("default".to_string(), auto.default_threshold))
            .chain(auto.thresholds.iter().map(|(t, v)| (t.to_string(), *v)));
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("threshold for {name} is out of range [0.0, 1.0]: {value}"));
            }
        }

        if self.apply.timeout_ms == 0 {
            return invalid("apply.timeout_ms must be positive".to_string());
        }
        if self.apply.max_attempts == 0 {
            return invalid("apply.max_attempts must be at least 1".to_string());
        }
        if self.predictors.max_attempts == 0 {
            return invalid("predictors.max_attempts must be at least 1".to_string());
        }

        EntityIdValidator::new(&self.reconciliation.entity_id_pattern)?;
        Ok(())
    }

    /// Builds the entity id validator for the configured pattern.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the pattern does not compile.
    pub fn entity_id_validator(&self) -> Result<EntityIdValidator, ValidationError> {
        EntityIdValidator::new(&self.reconciliation.entity_id_pattern)
    }
}
