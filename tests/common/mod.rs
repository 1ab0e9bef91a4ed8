#![allow(dead_code)]

use std::sync::{Arc, Once};

use insightflow::{
    EngineConfig, EntityId, EntitySnapshot, InMemoryCatalog, InsightEngine, InsightEngineBuilder, Prediction,
    PredictionType,
};

pub const ENTITY: &str = "3017620422003";

static TRACING: Once = Once::new();

/// Routes engine logs to the test writer; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn entity() -> EntityId {
    EntityId::parse(ENTITY).unwrap()
}

pub fn catalog() -> Arc<InMemoryCatalog> {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog
        .upsert_entity(EntitySnapshot::new(entity()).with_image("1").with_image("2"))
        .unwrap();
    catalog
}

pub fn builder(config: EngineConfig) -> (Arc<InMemoryCatalog>, InsightEngineBuilder) {
    init_tracing();
    let catalog = catalog();
    let builder = InsightEngine::builder().config(config).catalog(Arc::clone(&catalog));
    (catalog, builder)
}

pub fn engine_with(config: EngineConfig) -> (Arc<InMemoryCatalog>, InsightEngine) {
    let (catalog, builder) = builder(config);
    (catalog, builder.build().unwrap())
}

pub fn engine() -> (Arc<InMemoryCatalog>, InsightEngine) {
    engine_with(EngineConfig::default())
}

pub fn prediction(
    entity_id: &EntityId,
    t: PredictionType,
    predictor: &str,
    value: &str,
    confidence: f32,
    hint: bool,
) -> Prediction {
    Prediction::builder()
        .entity(entity_id.clone())
        .prediction_type(t)
        .predictor(predictor)
        .value(value)
        .confidence(confidence)
        .automatic_processing(hint)
        .build()
        .unwrap()
}
