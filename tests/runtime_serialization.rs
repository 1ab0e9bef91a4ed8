mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;

use common::{prediction, ENTITY};
use insightflow::{
    EngineConfig, EventKind, ExecutionError, FnPredictor, InsightError, LaneRuntime, PredictionType, PriorityClass,
    TriggerEvent,
};

#[derive(Default)]
struct Observed {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<(EventKind, Option<String>, String)>>,
}

fn observed_runtime(config: EngineConfig) -> (Arc<Observed>, LaneRuntime) {
    let observed = Arc::new(Observed::default());
    let recorder = Arc::clone(&observed);
    let (_, builder) = common::builder(config);
    let engine = builder
        .predictor(Arc::new(FnPredictor::new("slow", move |entity_id, ctx| {
            let now = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            let worker = thread::current().name().unwrap_or_default().to_string();
            recorder
                .seen
                .lock()
                .unwrap()
                .push((ctx.event_kind, ctx.asset_id.clone(), worker));
            recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![prediction(
                entity_id,
                PredictionType::Label,
                "slow",
                "en:organic",
                0.7,
                false,
            )])
        })))
        .build()
        .unwrap();
    (observed, LaneRuntime::new(Arc::new(engine)))
}

#[test]
fn one_entity_is_never_processed_concurrently() {
    let mut config = EngineConfig::default();
    config.routing.high_lanes = 4;
    config.routing.low_workers = 2;
    let (observed, runtime) = observed_runtime(config);

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let event = if i % 3 == 0 {
                TriggerEvent::scheduled_rescan(ENTITY)
            } else {
                TriggerEvent::entity_updated(ENTITY)
            };
            runtime.submit(event).unwrap()
        })
        .collect();
    for handle in handles {
        handle.join_timeout(Duration::from_secs(10)).unwrap();
    }

    assert_eq!(observed.max_in_flight.load(Ordering::SeqCst), 1);
    let seen = observed.seen.lock().unwrap();
    assert_eq!(seen.len(), 40);
    for (kind, _, worker) in seen.iter() {
        if kind.default_priority() == PriorityClass::High {
            assert!(worker.starts_with("insightflow-high-"), "{kind} ran on {worker}");
        } else {
            assert!(worker.starts_with("insightflow-"), "{kind} ran on {worker}");
        }
    }

    // Every run attached to the same open insight.
    let insights = runtime
        .engine()
        .list_insights(&insightflow::InsightQuery::new().entity(common::entity()))
        .unwrap();
    assert_eq!(insights.len(), 1);
}

#[test]
fn high_events_for_one_entity_keep_arrival_order() {
    let (observed, runtime) = observed_runtime(EngineConfig::default());

    let handles: Vec<_> = (0..20)
        .map(|i| {
            runtime
                .submit(TriggerEvent::asset_uploaded(ENTITY, i.to_string()))
                .unwrap()
        })
        .collect();
    let lane = handles[0].lane().clone();
    for handle in handles {
        assert_eq!(handle.lane(), &lane);
        handle.join().unwrap();
    }

    let seen = observed.seen.lock().unwrap();
    let order: Vec<String> = seen.iter().filter_map(|(_, asset, _)| asset.clone()).collect();
    let expected: Vec<String> = (0..20).map(|i: i32| i.to_string()).collect();
    assert_eq!(order, expected);
}

#[test]
fn low_only_workers_never_take_high_work() {
    let mut config = EngineConfig::default();
    config.routing.high_lanes = 1;
    config.routing.low_workers = 1;
    config.routing.high_workers_take_low = false;
    let (observed, runtime) = observed_runtime(config);

    let handles: Vec<_> = (0..10)
        .flat_map(|_| {
            [
                runtime.submit(TriggerEvent::scheduled_rescan(ENTITY)).unwrap(),
                runtime.submit(TriggerEvent::entity_updated(ENTITY)).unwrap(),
            ]
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for (kind, _, worker) in observed.seen.lock().unwrap().iter() {
        match kind {
            EventKind::ScheduledRescan => assert!(worker.starts_with("insightflow-low-"), "{worker}"),
            _ => assert!(worker.starts_with("insightflow-high-"), "{worker}"),
        }
    }
}

#[test]
fn full_lane_reports_backpressure() {
    let mut config = EngineConfig::default();
    config.routing.high_lanes = 1;
    config.routing.queue_capacity = 1;

    let (started_tx, started_rx) = bounded::<()>(16);
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (_, builder) = common::builder(config);
    let engine = builder
        .predictor(Arc::new(FnPredictor::new("blocking", move |_, _| {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
            Ok(Vec::new())
        })))
        .build()
        .unwrap();
    let runtime = LaneRuntime::new(Arc::new(engine));

    let running = runtime.submit(TriggerEvent::entity_updated(ENTITY)).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let queued = runtime.submit(TriggerEvent::entity_updated(ENTITY)).unwrap();

    let err = runtime.submit(TriggerEvent::entity_updated(ENTITY)).unwrap_err();
    assert!(matches!(
        err,
        InsightError::Execution(ExecutionError::QueueFull { capacity: 1, .. })
    ));

    // Closing the gate lets every blocked run finish.
    drop(gate_tx);
    running.join().unwrap();
    queued.join().unwrap();
}

#[test]
fn join_timeout_reports_slow_events() {
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let (_, builder) = common::builder(EngineConfig::default());
    let engine = builder
        .predictor(Arc::new(FnPredictor::new("blocking", move |_, _| {
            let _ = gate_rx.recv();
            Ok(Vec::new())
        })))
        .build()
        .unwrap();
    let runtime = LaneRuntime::new(Arc::new(engine));

    let handle = runtime.submit(TriggerEvent::entity_updated(ENTITY)).unwrap();
    let err = handle.join_timeout(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, InsightError::Execution(ExecutionError::Timeout { .. })));
    drop(gate_tx);
}
