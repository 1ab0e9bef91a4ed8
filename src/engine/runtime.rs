//! Lane runtime.
//!
//! A fixed set of worker threads drains trigger events from bounded lanes.
//! Each HIGH lane has exactly one worker, so HIGH events for one entity are
//! processed in arrival order and never concurrently. LOW events share one
//! lane drained by LOW-only workers and, when enabled, by HIGH workers whose
//! own lane is empty. A LOW-only worker never touches a HIGH lane.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::{debug, info, warn};

use super::{EventReport, InsightEngine};
use crate::config::RoutingConfig;
use crate::error::{ExecutionError, InsightError, InsightResult};
use crate::event::{PriorityClass, TriggerEvent};
use crate::routing::{EntityRouter, HashRouter, LaneAssignment};

struct Job {
    event: TriggerEvent,
    lane: LaneAssignment,
    reply: Sender<InsightResult<EventReport>>,
}

fn run_job(engine: &InsightEngine, job: Job) {
    let Job { event, lane, reply } = job;
    debug!(entity_id = %lane.entity_id, lane = %lane, kind = %event.kind, "processing event");
    let result = engine.process_event(&lane.entity_id, &event);
    let _ = reply.send(result);
}

fn high_worker(engine: &InsightEngine, own: &Receiver<Job>, low: &Receiver<Job>, mut take_low: bool) {
    loop {
        // Drain the own lane before looking at LOW.
        match own.try_recv() {
            Ok(job) => {
                run_job(engine, job);
                continue;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        if take_low {
            select! {
                recv(own) -> msg => match msg {
                    Ok(job) => run_job(engine, job),
                    Err(_) => break,
                },
                recv(low) -> msg => match msg {
                    Ok(job) => run_job(engine, job),
                    Err(_) => take_low = false,
                },
            }
        } else {
            match own.recv() {
                Ok(job) => run_job(engine, job),
                Err(_) => break,
            }
        }
    }
}

fn low_worker(engine: &InsightEngine, low: &Receiver<Job>) {
    while let Ok(job) = low.recv() {
        run_job(engine, job);
    }
}

struct Lanes {
    high: Vec<Sender<Job>>,
    low: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl Lanes {
    fn start(engine: &Arc<InsightEngine>, high_lanes: usize, config: &RoutingConfig) -> Self {
        let queue_capacity = config.queue_capacity.max(1);
        let (low_tx, low_rx) = bounded::<Job>(queue_capacity);
        let low_workers = if config.high_workers_take_low {
            config.low_workers
        } else {
            config.low_workers.max(1)
        };

        let mut high = Vec::with_capacity(high_lanes);
        let mut workers = Vec::with_capacity(high_lanes + low_workers);
        for idx in 0..high_lanes {
            let (tx, rx) = bounded::<Job>(queue_capacity);
            high.push(tx);
            let engine = Arc::clone(engine);
            let low_rx = low_rx.clone();
            let take_low = config.high_workers_take_low;
            let handle = thread::Builder::new()
                .name(format!("insightflow-high-{idx}"))
                .spawn(move || high_worker(&engine, &rx, &low_rx, take_low))
                .expect("failed to spawn insightflow lane worker");
            workers.push(handle);
        }
        for idx in 0..low_workers {
            let engine = Arc::clone(engine);
            let low_rx = low_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("insightflow-low-{idx}"))
                .spawn(move || low_worker(&engine, &low_rx))
                .expect("failed to spawn insightflow lane worker");
            workers.push(handle);
        }

        info!(high_lanes, low_workers, queue_capacity, "lane runtime started");
        Self {
            high,
            low: low_tx,
            workers,
            queue_capacity,
        }
    }

    fn closed() -> Self {
        Self {
            high: Vec::new(),
            low: bounded::<Job>(1).0,
            workers: Vec::new(),
            queue_capacity: 1,
        }
    }

    fn sender(&self, lane: &LaneAssignment) -> InsightResult<&Sender<Job>> {
        match lane.priority {
            PriorityClass::Low => Ok(&self.low),
            PriorityClass::High => self
                .high
                .get(lane.lane_index)
                .ok_or_else(|| InsightError::internal(format!("router produced unknown lane {lane}"))),
        }
    }

    fn shutdown(self) {
        // Close every lane: workers drain queued events then exit.
        drop(self.high);
        drop(self.low);
        for handle in self.workers {
            let _ = handle.join();
        }
        info!("lane runtime stopped");
    }
}

/// Handle returned by [`LaneRuntime::submit`].
#[derive(Debug)]
pub struct EventHandle {
    lane: LaneAssignment,
    rx: Receiver<InsightResult<EventReport>>,
}

impl EventHandle {
    /// The lane the event was routed to.
    #[must_use]
    pub const fn lane(&self) -> &LaneAssignment {
        &self.lane
    }

    /// Waits for the event to be processed.
    ///
    /// # Errors
    ///
    /// Returns the processing error, or `Disconnected` if the worker died.
    pub fn join(self) -> InsightResult<EventReport> {
        let lane = self.lane.to_string();
        self.rx
            .recv()
            .map_err(|_| InsightError::Execution(ExecutionError::Disconnected { lane }))?
    }

    /// Waits for the event to be processed, at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the event is still queued or running.
    pub fn join_timeout(self, timeout: Duration) -> InsightResult<EventReport> {
        let lane = self.lane.to_string();
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => InsightError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => InsightError::Execution(ExecutionError::Disconnected { lane }),
        })?
    }
}

/// Routed worker pool in front of an [`InsightEngine`].
pub struct LaneRuntime<R: EntityRouter = HashRouter> {
    router: R,
    engine: Arc<InsightEngine>,
    lanes: Lanes,
}

impl LaneRuntime<HashRouter> {
    /// Starts a runtime with the hash router and the engine's routing
    /// configuration.
    #[must_use]
    pub fn new(engine: Arc<InsightEngine>) -> Self {
        let config = engine.config().routing.clone();
        let router = HashRouter::with_validator(config.high_lanes, engine.entity_id_validator().clone());
        Self::with_router(engine, router, &config)
    }
}

impl<R: EntityRouter> LaneRuntime<R> {
    /// Starts a runtime with a custom router. One worker is spawned per
    /// lane the router maps onto.
    #[must_use]
    pub fn with_router(engine: Arc<InsightEngine>, router: R, config: &RoutingConfig) -> Self {
        let lanes = Lanes::start(&engine, router.high_lanes().max(1), config);
        Self { router, engine, lanes }
    }

    /// Routes and enqueues an event without blocking.
    ///
    /// # Errors
    ///
    /// - `MalformedEvent` if the entity id is unresolvable.
    /// - `QueueFull` if the target lane is at capacity.
    pub fn submit(&self, event: TriggerEvent) -> InsightResult<EventHandle> {
        let lane = self.router.route(&event).map_err(|e| {
            warn!(entity_id = %event.entity_id, kind = %event.kind, error = %e, "rejected malformed event");
            e
        })?;

        let sender = self.lanes.sender(&lane)?;
        let (reply, rx) = bounded::<InsightResult<EventReport>>(1);
        let job = Job {
            event,
            lane: lane.clone(),
            reply,
        };
        match sender.try_send(job) {
            Ok(()) => Ok(EventHandle { lane, rx }),
            Err(TrySendError::Full(_)) => Err(InsightError::Execution(ExecutionError::QueueFull {
                lane: lane.to_string(),
                capacity: self.lanes.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(InsightError::Execution(ExecutionError::Disconnected {
                lane: lane.to_string(),
            })),
        }
    }

    /// Parses a JSON trigger payload and enqueues it.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` for an invalid payload, otherwise as
    /// [`submit`](Self::submit).
    pub fn submit_json(&self, payload: &str) -> InsightResult<EventHandle> {
        let event = TriggerEvent::from_json(payload).map_err(|e| {
            warn!(error = %e, "rejected malformed event payload");
            e
        })?;
        self.submit(event)
    }

    /// Routes an event and waits for it to be processed.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit) and [`EventHandle::join`].
    pub fn process(&self, event: TriggerEvent) -> InsightResult<EventReport> {
        self.submit(event)?.join()
    }

    /// The engine behind the lanes.
    #[must_use]
    pub fn engine(&self) -> &Arc<InsightEngine> {
        &self.engine
    }

    /// The router in use.
    #[must_use]
    pub const fn router(&self) -> &R {
        &self.router
    }
}

impl<R: EntityRouter> Drop for LaneRuntime<R> {
    fn drop(&mut self) {
        let lanes = std::mem::replace(&mut self.lanes, Lanes::closed());
        lanes.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::EngineConfig;
    use crate::engine::test_support::{engine_with, ENTITY};

    fn runtime_with(config: EngineConfig) -> LaneRuntime {
        let (_, engine) = engine_with(config);
        LaneRuntime::new(Arc::new(engine))
    }

    #[test]
    fn submit_routes_deterministically() {
        let runtime = runtime_with(EngineConfig::default());
        let a = runtime.submit(TriggerEvent::entity_updated(ENTITY)).unwrap();
        let b = runtime.submit(TriggerEvent::asset_uploaded(ENTITY, "3")).unwrap();
        assert_eq!(a.lane(), b.lane());
        assert_eq!(a.lane().priority, PriorityClass::High);
        a.join().unwrap();
        b.join().unwrap();
    }

    #[test]
    fn malformed_events_are_never_enqueued() {
        let runtime = runtime_with(EngineConfig::default());
        let err = runtime.submit(TriggerEvent::entity_updated("  ")).unwrap_err();
        assert!(err.is_validation());
        let err = runtime.submit_json(r#"{"kind":"entity_updated"}"#).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn low_events_are_processed_by_high_workers_when_enabled() {
        let mut config = EngineConfig::default();
        config.routing.low_workers = 0;
        config.routing.high_lanes = 2;
        let runtime = runtime_with(config);
        let report = runtime
            .submit(TriggerEvent::scheduled_rescan(ENTITY))
            .unwrap()
            .join_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(report.kind, crate::event::EventKind::ScheduledRescan);
    }

    #[test]
    fn drop_drains_queued_events() {
        let runtime = runtime_with(EngineConfig::default());
        let handles: Vec<_> = (0..16)
            .map(|_| runtime.submit(TriggerEvent::entity_updated(ENTITY)).unwrap())
            .collect();
        drop(runtime);
        for handle in handles {
            assert!(handle.join().is_ok());
        }
    }
}
