//! # insightflow - Prediction reconciliation and insight lifecycle
//!
//! insightflow turns the raw output of predictors (classifiers, OCR, logo
//! detectors) about catalog entities into user-actionable insights, and
//! drives each insight through annotation, anonymous voting or delayed
//! automatic processing until it is written back to the catalog.
//!
//! ## Core Concepts
//!
//! - **Prediction**: an immutable signal from one predictor about one entity
//! - **Insight**: the mutable, actionable record for one `(entity, type)` slot
//! - **Lane**: a deterministic routing bucket giving each entity a single writer
//! - **Sweep**: the periodic pass that applies eligible insights after a grace period
//! - **Apply**: the idempotent catalog write that materializes an accepted insight
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use insightflow::{
//!     AnnotationValue, EntityId, EntitySnapshot, InMemoryCatalog, InsightEngine, InsightStatus,
//!     Prediction, PredictionType,
//! };
//!
//! let catalog = Arc::new(InMemoryCatalog::new());
//! let entity = EntityId::parse("3017620422003")?;
//! catalog.upsert_entity(EntitySnapshot::new(entity.clone()))?;
//!
//! let engine = InsightEngine::builder().catalog(Arc::clone(&catalog)).build()?;
//!
//! let prediction = Prediction::builder()
//!     .entity(entity.clone())
//!     .prediction_type(PredictionType::Category)
//!     .predictor("category-matcher")
//!     .value("en:yogurts")
//!     .confidence(0.8)
//!     .build()?;
//!
//! let result = engine.reconcile(&entity, PredictionType::Category, vec![prediction])?;
//! let insight = engine.record_annotation(result.created[0], "moderator", AnnotationValue::Accept)?;
//! assert_eq!(insight.status, InsightStatus::Applied);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod entity;
pub mod error;
pub mod event;
pub mod insight;
pub mod prediction;
pub mod value;
pub mod vote;

// Policy and configuration
pub mod config;
pub mod policy;
pub mod routing;

// Subsystems
pub mod apply;
pub mod catalog;
pub mod engine;
pub mod predictor;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use entity::{EntityId, EntityIdValidator, EntitySnapshot, ImageRecord};
pub use error::{ApplyError, ExecutionError, InsightError, InsightResult, PredictorError, ValidationError};
pub use event::{EventKind, PriorityClass, TriggerEvent};
pub use insight::{AnnotationValue, Insight, InsightId, InsightQuery, InsightStatus};
pub use prediction::{Prediction, PredictionBuilder, PredictionId, PredictionType};
pub use value::Value;
pub use vote::{Vote, VoteTally};

pub use config::{
    ApplyConfig, AutomaticProcessingConfig, EngineConfig, PredictorConfig, ReconciliationConfig,
    RoutingConfig,
};
pub use policy::{EligibilityPolicy, RejectedValuePolicy, ThresholdPolicy};
pub use routing::{EntityRouter, HashRouter, LaneAssignment};

pub use apply::{ApplyGateway, WriteState};
pub use catalog::{Ack, CatalogChange, CatalogError, CatalogReader, CatalogWriter, InMemoryCatalog};
pub use engine::{
    DeletionReport, EventHandle, EventReport, InsightEngine, InsightEngineBuilder, LaneRuntime,
    ReconciliationResult, SweepReport, SweepScheduler,
};
pub use predictor::{FnPredictor, PredictionContext, PredictionRun, Predictor, PredictorRegistry};
pub use storage::{
    InMemoryInsightStore, InMemoryPredictionStore, InMemoryStores, InMemoryVoteStore, InsightStore,
    PredictionStore, StorageError, VoteStore,
};
