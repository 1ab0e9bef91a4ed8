use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use insightflow::{
    EntityId, EntityRouter, EntitySnapshot, HashRouter, InMemoryCatalog, InsightEngine, Prediction, PredictionType,
    TriggerEvent,
};

fn bench_route(c: &mut Criterion) {
    let router = HashRouter::new(16);
    let events: Vec<TriggerEvent> = (0..1024u64)
        .map(|i| TriggerEvent::entity_updated(format!("{:013}", 3_017_620_000_000 + i)))
        .collect();

    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(events.len() as u64));
    group.bench_function("hash_route_1024", |b| {
        b.iter(|| {
            for event in &events {
                black_box(router.route(black_box(event)).ok());
            }
        });
    });
    group.finish();
}

fn category(entity_id: &EntityId, predictor: &str, value: &str, confidence: f32) -> Prediction {
    Prediction::builder()
        .entity(entity_id.clone())
        .prediction_type(PredictionType::Category)
        .predictor(predictor)
        .value(value)
        .confidence(confidence)
        .automatic_processing(true)
        .build()
        .unwrap()
}

fn bench_reconcile(c: &mut Criterion) {
    let entity_id = EntityId::parse("3017620422003").unwrap();

    c.bench_function("reconcile/create_then_supersede", |b| {
        b.iter_batched(
            || {
                let catalog = Arc::new(InMemoryCatalog::new());
                catalog.upsert_entity(EntitySnapshot::new(entity_id.clone())).unwrap();
                InsightEngine::builder().catalog(catalog).build().unwrap()
            },
            |engine| {
                for (i, value) in ["en:yogurts", "en:desserts", "en:cheeses"].iter().enumerate() {
                    let batch = vec![
                        category(&entity_id, "matcher", value, 0.9 + i as f32 * 0.01),
                        category(&entity_id, "classifier", value, 0.97),
                    ];
                    black_box(engine.reconcile(&entity_id, PredictionType::Category, batch).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_route, bench_reconcile);
criterion_main!(benches);
