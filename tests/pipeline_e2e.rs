mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use common::{engine, entity, prediction, ENTITY};
use insightflow::{
    AnnotationValue, CatalogReader, EngineConfig, EventKind, FnPredictor, InsightQuery, InsightStatus,
    LaneRuntime, PredictionType, PredictorError, TriggerEvent,
};

fn yogurt_predictor(id: &'static str, confidence: f32) -> Arc<FnPredictor> {
    Arc::new(FnPredictor::new(id, move |entity_id, _ctx| {
        Ok(vec![prediction(
            entity_id,
            PredictionType::Category,
            id,
            "en:yogurts",
            confidence,
            true,
        )])
    }))
}

#[test]
fn agreeing_predictors_are_auto_applied_after_grace() {
    let (catalog, builder) = common::builder(EngineConfig::default());
    let engine = builder
        .predictor(yogurt_predictor("category-matcher", 0.97))
        .predictor(yogurt_predictor("category-classifier", 0.98))
        .build()
        .unwrap();

    let report = engine.handle_event(&TriggerEvent::entity_updated(ENTITY)).unwrap();
    let created = report.created();
    assert_eq!(created.len(), 1);
    assert!(report.predictor_failures.is_empty());

    let insight = engine.get_insight(created[0]).unwrap();
    assert_eq!(insight.status, InsightStatus::Pending);
    assert!(insight.automatic_processing_eligible);
    assert_eq!(insight.source_prediction_ids.len(), 2);
    assert_eq!(insight.confidence, Some(0.98));

    // Still inside the grace period.
    assert!(engine.sweep(Utc::now()).unwrap().auto_applied.is_empty());

    let sweep = engine.sweep(Utc::now() + ChronoDuration::minutes(11)).unwrap();
    assert_eq!(sweep.auto_applied, vec![insight.id]);
    assert_eq!(catalog.apply_calls(), 1);

    let applied = engine.get_insight(insight.id).unwrap();
    assert_eq!(applied.status, InsightStatus::AutoApplied);
    assert!(applied.applied_at.is_some());
    let snapshot = catalog.get_entity(&entity()).unwrap().unwrap();
    assert!(snapshot.has_tag("categories_tags", "en:yogurts"));

    // Re-running the predictors never re-creates an applied value.
    let again = engine.handle_event(&TriggerEvent::scheduled_rescan(ENTITY)).unwrap();
    assert!(again.created().is_empty());
    assert_eq!(engine.list_insights(&InsightQuery::new().entity(entity())).unwrap().len(), 1);
}

#[test]
fn disagreeing_eligibility_keeps_insight_for_humans() {
    let (catalog, builder) = common::builder(EngineConfig::default());
    let engine = builder
        .predictor(yogurt_predictor("category-matcher", 0.97))
        .predictor(yogurt_predictor("category-classifier", 0.7))
        .build()
        .unwrap();

    let report = engine.handle_event(&TriggerEvent::entity_updated(ENTITY)).unwrap();
    let insight = engine.get_insight(report.created()[0]).unwrap();
    assert!(!insight.automatic_processing_eligible);

    let sweep = engine.sweep(Utc::now() + ChronoDuration::hours(1)).unwrap();
    assert_eq!(sweep.selected, 0);
    assert_eq!(catalog.apply_calls(), 0);
    assert_eq!(engine.get_insight(insight.id).unwrap().status, InsightStatus::Pending);
}

#[test]
fn failing_predictor_does_not_block_others() {
    let (_, builder) = common::builder(EngineConfig::default());
    let engine = builder
        .predictor(Arc::new(FnPredictor::new("ocr", |_, _| {
            Err(PredictorError::failed("ocr", "model offline"))
        })))
        .predictor(yogurt_predictor("category-matcher", 0.8))
        .build()
        .unwrap();

    let report = engine.handle_event(&TriggerEvent::entity_updated(ENTITY)).unwrap();
    assert_eq!(report.created().len(), 1);
    assert_eq!(report.predictor_failures.len(), 1);
    assert_eq!(report.predictor_failures[0].predictor_id(), "ocr");
}

#[test]
fn asset_events_reach_image_predictors() {
    let (catalog, builder) = common::builder(EngineConfig::default());
    let engine = builder
        .predictor(Arc::new(
            FnPredictor::new("orientation", |entity_id, ctx| {
                let asset = ctx
                    .asset_id
                    .clone()
                    .ok_or_else(|| PredictorError::failed("orientation", "no asset"))?;
                let p = insightflow::Prediction::builder()
                    .entity(entity_id.clone())
                    .prediction_type(PredictionType::ImageOrientation)
                    .predictor("orientation")
                    .value(90_i64)
                    .confidence(0.9)
                    .source_asset(asset)
                    .build()
                    .map_err(|e| PredictorError::failed("orientation", e.to_string()))?;
                Ok(vec![p])
            })
            .on(&[EventKind::AssetUploaded]),
        ))
        .build()
        .unwrap();

    assert!(engine
        .handle_event(&TriggerEvent::entity_updated(ENTITY))
        .unwrap()
        .created()
        .is_empty());

    let report = engine.handle_event(&TriggerEvent::asset_uploaded(ENTITY, "2")).unwrap();
    let created = report.created();
    assert_eq!(created.len(), 1);
    let insight = engine
        .record_annotation(created[0], "moderator", AnnotationValue::Accept)
        .unwrap();
    assert_eq!(insight.status, InsightStatus::Applied);
    let snapshot = catalog.get_entity(&entity()).unwrap().unwrap();
    assert_eq!(snapshot.images["2"].rotation, 90);
    assert_eq!(snapshot.images["1"].rotation, 0);
}

#[test]
fn deletion_event_closes_open_insights_and_purges_predictions() {
    let (_, engine) = engine();
    let entity_id = entity();
    let labels = engine
        .reconcile(
            &entity_id,
            PredictionType::Label,
            vec![
                prediction(&entity_id, PredictionType::Label, "logo", "en:organic", 0.7, false),
                prediction(&entity_id, PredictionType::Label, "logo", "en:fair-trade", 0.6, false),
            ],
        )
        .unwrap();
    assert_eq!(labels.created.len(), 2);
    let applied = engine
        .record_annotation(labels.created[0], "moderator", AnnotationValue::Accept)
        .unwrap();
    assert_eq!(applied.status, InsightStatus::Applied);

    let report = engine.handle_event(&TriggerEvent::entity_deleted(ENTITY)).unwrap();
    let deletion = report.deletion.unwrap();
    assert_eq!(deletion.closed_insights, vec![labels.created[1]]);
    assert_eq!(deletion.predictions_removed, 2);

    assert_eq!(engine.get_insight(labels.created[0]).unwrap().status, InsightStatus::Applied);
    assert_eq!(
        engine.get_insight(labels.created[1]).unwrap().status,
        InsightStatus::EntityDeleted
    );
    assert!(engine.predictions_for(&entity_id).unwrap().is_empty());

    let err = engine
        .cast_vote(labels.created[1], "voter-1", AnnotationValue::Accept)
        .unwrap_err();
    assert!(err.is_already_annotated());
}

#[test]
fn malformed_events_are_rejected_before_processing() {
    let (_, engine) = engine();
    let err = engine.handle_event(&TriggerEvent::entity_updated("")).unwrap_err();
    assert!(err.is_validation());

    let runtime = LaneRuntime::new(Arc::new(engine));
    for payload in [
        "not json",
        r#"{"kind":"entity_updated"}"#,
        r#"{"entity_id":"3017620422003","kind":"teleported"}"#,
        r#"{"entity_id":"   ","kind":"entity_updated"}"#,
    ] {
        let err = runtime.submit_json(payload).unwrap_err();
        assert!(err.is_validation(), "{payload}");
    }

    let report = runtime
        .submit_json(r#"{"entity_id":"3017620422003","kind":"entity_updated"}"#)
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(report.kind, EventKind::EntityUpdated);
}

#[test]
fn apply_is_idempotent_against_the_catalog() {
    let (catalog, engine) = engine();
    let entity_id = entity();
    let result = engine
        .reconcile(
            &entity_id,
            PredictionType::Category,
            vec![prediction(&entity_id, PredictionType::Category, "matcher", "en:yogurts", 0.8, false)],
        )
        .unwrap();
    let insight = engine
        .record_annotation(result.created[0], "moderator", AnnotationValue::Accept)
        .unwrap();
    assert_eq!(insight.status, InsightStatus::Applied);
    assert_eq!(catalog.effective_writes(), 1);

    let ack = engine.gateway().apply(&insight).unwrap();
    assert!(!ack.changed);
    assert_eq!(catalog.apply_calls(), 2);
    assert_eq!(catalog.effective_writes(), 1);
}

#[test]
fn config_file_drives_engine_behavior() {
    let config = EngineConfig::from_toml_str(
        r#"
        [automatic_processing]
        grace_period_secs = 0

        [automatic_processing.thresholds]
        category = 0.5

        [campaigns]
        category = "spring-cleanup"
        "#,
    )
    .unwrap();
    let (catalog, builder) = common::builder(config);
    let engine = builder
        .predictor(yogurt_predictor("category-matcher", 0.6))
        .build()
        .unwrap();

    let report = engine.handle_event(&TriggerEvent::entity_updated(ENTITY)).unwrap();
    let insight = engine.get_insight(report.created()[0]).unwrap();
    assert_eq!(insight.campaign.as_deref(), Some("spring-cleanup"));
    assert!(insight.automatic_processing_eligible);

    let sweep = engine.sweep(Utc::now() + ChronoDuration::seconds(1)).unwrap();
    assert_eq!(sweep.auto_applied, vec![insight.id]);
    assert_eq!(catalog.effective_writes(), 1);
}
