//! [`DispatchBridge`] – routes bus traffic into the pipeline and queries to
//! the knowledge base.
//!
//! Two independent loops:
//!
//! * **Notifications** – one dispatcher reads [`Topic::Perception`] and hands
//!   each event to a per-source worker.  A worker runs
//!   [`PerceptionPipeline::ingest`] to completion before taking the next
//!   event from its source, so one robot's observations are processed in
//!   order while different robots proceed concurrently.  A worker that sees
//!   nothing for the idle timeout exits; the next notification from its
//!   source starts a fresh worker that first waits for the old one to drain.
//!   At most `max_workers` sources are served at once.
//! * **Queries** – every request from the [`QueryInbox`] gets its own task:
//!   parse → [`Gateway::query`] → render → reply.  Queries never take the
//!   pipeline's class locks and so never wait behind a write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use robocm_memory::Gateway;
use robocm_middleware::{EventBus, QueryInbox, QueryRequest, Topic};
use robocm_perception::{parse_query, render_result};
use robocm_types::{CmError, EventPayload};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pipeline::PerceptionPipeline;

/// Per-source backlog before new notifications from that source are dropped.
pub const DEFAULT_WORKER_BACKLOG: usize = 64;

/// A worker with no traffic for this long exits.
pub const DEFAULT_WORKER_IDLE: Duration = Duration::from_secs(30);

/// Concurrent per-source workers before new sources are refused.
pub const DEFAULT_MAX_WORKERS: usize = 256;

/// Parse, answer and render one context query.
///
/// # Errors
///
/// [`CmError::Parse`] for malformed query text, [`CmError::GatewayQuery`] when
/// the knowledge base fails.
pub async fn answer_query(gateway: &Gateway, text: &str) -> Result<String, CmError> {
    let pattern = parse_query(text)?;
    let solutions = gateway.query(&pattern).await?;
    Ok(render_result(&pattern.variables(), &solutions))
}

/// Wires the bus and the query channel to the pipeline.
pub struct DispatchBridge {
    pipeline: Arc<PerceptionPipeline>,
    limits: WorkerLimits,
    overflowed: Arc<AtomicU64>,
    refused_sources: Arc<AtomicU64>,
    active_workers: Arc<AtomicUsize>,
}

#[derive(Debug, Clone, Copy)]
struct WorkerLimits {
    backlog: usize,
    idle: Duration,
    max_workers: usize,
}

impl DispatchBridge {
    pub fn new(pipeline: Arc<PerceptionPipeline>) -> Self {
        Self {
            pipeline,
            limits: WorkerLimits {
                backlog: DEFAULT_WORKER_BACKLOG,
                idle: DEFAULT_WORKER_IDLE,
                max_workers: DEFAULT_MAX_WORKERS,
            },
            overflowed: Arc::new(AtomicU64::new(0)),
            refused_sources: Arc::new(AtomicU64::new(0)),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_worker_backlog(mut self, backlog: usize) -> Self {
        self.limits.backlog = backlog.max(1);
        self
    }

    pub fn with_worker_idle(mut self, idle: Duration) -> Self {
        self.limits.idle = idle;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.limits.max_workers = max_workers.max(1);
        self
    }

    pub fn pipeline(&self) -> &Arc<PerceptionPipeline> {
        &self.pipeline
    }

    /// Notifications dropped because their source's worker was backlogged.
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Notifications dropped because `max_workers` sources were already served.
    pub fn refused_sources(&self) -> u64 {
        self.refused_sources.load(Ordering::Relaxed)
    }

    /// Per-source worker tasks currently running.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Start both loops.
    pub fn spawn(&self, bus: &EventBus, inbox: QueryInbox) -> (JoinHandle<()>, JoinHandle<()>) {
        (self.spawn_notifications(bus), self.spawn_queries(inbox))
    }

    /// Start the notification dispatcher.  It subscribes before returning,
    /// so notifications published afterwards are not missed.
    pub fn spawn_notifications(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe_to(Topic::Perception);
        let mut workers = WorkerSet {
            pipeline: Arc::clone(&self.pipeline),
            limits: self.limits,
            overflowed: Arc::clone(&self.overflowed),
            refused_sources: Arc::clone(&self.refused_sources),
            active: Arc::clone(&self.active_workers),
            workers: HashMap::new(),
        };

        tokio::spawn(async move {
            while let Some(event) = rx.next().await {
                let EventPayload::Notification(text) = event.payload else {
                    continue;
                };
                workers.dispatch(event.source, text);
            }
            info!(workers = workers.workers.len(), "perception topic closed, dispatcher stopping");
        })
    }

    /// Start the query loop.
    pub fn spawn_queries(&self, mut inbox: QueryInbox) -> JoinHandle<()> {
        let gateway = self.pipeline.gateway().clone();
        tokio::spawn(async move {
            while let Some(request) = inbox.recv().await {
                let gateway = gateway.clone();
                tokio::spawn(async move { serve_query(&gateway, request).await });
            }
            debug!("query inbox closed");
        })
    }
}

struct Worker {
    tx: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

/// Dispatcher-owned map from source to its worker.
struct WorkerSet {
    pipeline: Arc<PerceptionPipeline>,
    limits: WorkerLimits,
    overflowed: Arc<AtomicU64>,
    refused_sources: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
    workers: HashMap<String, Worker>,
}

impl WorkerSet {
    fn dispatch(&mut self, source: String, text: String) {
        let text = match self.workers.get(&source) {
            Some(worker) => match worker.tx.try_send(text) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.overflowed.fetch_add(1, Ordering::Relaxed);
                    warn!(source = %source, "worker backlogged, dropping notification");
                    return;
                }
                // Went idle; hand over to a successor below.
                Err(mpsc::error::TrySendError::Closed(text)) => text,
            },
            None => text,
        };

        let previous = match self.workers.remove(&source) {
            Some(old) => Some(old.task),
            None => {
                self.workers.retain(|_, w| !w.task.is_finished());
                if self.workers.len() >= self.limits.max_workers {
                    self.refused_sources.fetch_add(1, Ordering::Relaxed);
                    warn!(source = %source, workers = self.workers.len(), "worker limit reached, dropping notification");
                    return;
                }
                None
            }
        };

        let worker = self.spawn_worker(source.clone(), previous);
        if worker.tx.try_send(text).is_err() {
            self.overflowed.fetch_add(1, Ordering::Relaxed);
        }
        self.workers.insert(source, worker);
    }

    fn spawn_worker(&self, source: String, previous: Option<JoinHandle<()>>) -> Worker {
        let (tx, mut rx) = mpsc::channel::<String>(self.limits.backlog);
        let pipeline = Arc::clone(&self.pipeline);
        let active = Arc::clone(&self.active);
        let idle = self.limits.idle;
        debug!(source = %source, "starting perception worker");

        active.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            // Keep per-source order across an idle handover.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            loop {
                match tokio::time::timeout(idle, rx.recv()).await {
                    Ok(Some(text)) => {
                        pipeline.ingest(&source, &text).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        rx.close();
                        while let Some(text) = rx.recv().await {
                            pipeline.ingest(&source, &text).await;
                        }
                        break;
                    }
                }
            }
            debug!(source = %source, "perception worker exiting");
            active.fetch_sub(1, Ordering::Relaxed);
        });
        Worker { tx, task }
    }
}

async fn serve_query(gateway: &Gateway, request: QueryRequest) {
    let result = answer_query(gateway, &request.pattern).await;
    if let Err(e) = &result {
        warn!(sender = %request.sender, error = %e, "query failed");
    }
    request.respond(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use robocm_memory::{KnowledgeBase, RetentionSettings, RetentionWindowIndex, SqliteTripleStore};
    use robocm_middleware::query;
    use robocm_perception::Normalizer;
    use std::time::Duration;

    fn bridge() -> (DispatchBridge, SqliteTripleStore, Arc<EventBus>) {
        let store = SqliteTripleStore::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::default());
        let pipeline = PerceptionPipeline::new(
            Normalizer::default(),
            RetentionWindowIndex::new(RetentionSettings::default()).unwrap(),
            Gateway::new(Arc::new(store.clone()), Duration::from_secs(2)),
            Arc::clone(&bus),
        );
        (DispatchBridge::new(Arc::new(pipeline)), store, bus)
    }

    async fn wait_for_stored(bridge: &DispatchBridge, n: u64) {
        for _ in 0..200 {
            if bridge.pipeline().stats().snapshot().stored >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pipeline never stored {n} notifications");
    }

    #[tokio::test]
    async fn notifications_flow_into_the_store() {
        let (bridge, store, bus) = bridge();
        bridge.spawn_notifications(&bus);

        bus.notify("AMR_LIFT1", "(robotPosition \"AMR_LIFT1\" \"3.5\" \"-2.1\")").unwrap();
        bus.notify("AMR_LIFT2", "(robotDegree \"AMR_LIFT2\" \"90\")").unwrap();
        wait_for_stored(&bridge, 2).await;

        // Eight triples for a position, seven for a heading.
        assert_eq!(store.len().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn per_source_order_is_preserved() {
        let (bridge, _store, bus) = bridge();
        bridge.spawn_notifications(&bus);
        for i in 0..5 {
            bus.notify("AMR_LIFT1", format!("(robotSpeed \"AMR_LIFT1\" {i})")).unwrap();
        }
        wait_for_stored(&bridge, 5).await;
        let w = bridge
            .pipeline()
            .retention()
            .window(robocm_types::EntityClass::RobotBody, "AMR_Lift01")
            .unwrap();
        assert_eq!(w.hi, 5);
    }

    async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        for _ in 0..300 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn idle_workers_exit_and_restart_on_demand() {
        let (bridge, store, bus) = bridge();
        let bridge = bridge.with_worker_idle(Duration::from_millis(50));
        bridge.spawn_notifications(&bus);

        for i in 0..20 {
            bus.notify(format!("camera-{i}"), format!("(objectPosition \"cup{i}\" 1 2)")).unwrap();
        }
        wait_for_stored(&bridge, 20).await;
        wait_until("idle workers to exit", || bridge.active_workers() == 0).await;

        // A returning source gets a new worker and is still served.
        bus.notify("camera-0", "(objectPosition \"cup0\" 3 4)").unwrap();
        wait_for_stored(&bridge, 21).await;
        assert_eq!(store.len().await.unwrap(), 21 * 8);
        wait_until("worker to exit again", || bridge.active_workers() == 0).await;
    }

    #[tokio::test]
    async fn new_sources_beyond_the_limit_are_refused() {
        let (bridge, _store, bus) = bridge();
        let bridge = bridge.with_max_workers(2);
        bridge.spawn_notifications(&bus);

        for source in ["camera-a", "camera-b", "camera-c"] {
            bus.notify(source, "(objectPosition \"cup\" 1 2)").unwrap();
        }
        wait_until("third source refused", || bridge.refused_sources() == 1).await;
        wait_for_stored(&bridge, 2).await;
        assert_eq!(bridge.active_workers(), 2);

        // Served sources keep flowing.
        bus.notify("camera-a", "(objectPosition \"cup\" 5 6)").unwrap();
        wait_for_stored(&bridge, 3).await;
        assert_eq!(bridge.refused_sources(), 1);
    }

    #[tokio::test]
    async fn queries_are_answered_with_rendered_bindings() {
        let (bridge, _store, bus) = bridge();
        let (client, inbox) = query::channel(4);
        bridge.spawn(&bus, inbox);

        bus.notify("AMR_LIFT1", "(robotDegree \"AMR_LIFT1\" \"45\")").unwrap();
        wait_for_stored(&bridge, 1).await;

        let answer = client
            .ask(
                "TaskManager",
                "(context (triple $P \"knowrob:objectActedOn\" \"arbi:AMR_Lift01\") \
                          (triple $P \"knowrob:eventOccursAt\" $M) \
                          (triple $M \"knowrob:m12\" $H))",
            )
            .await
            .unwrap();
        assert!(answer.starts_with("(result (binding (\"P\" \"http://www.arbi.com/ontologies/arbi.owl#visualRobotBodyPerception1\")"));
        assert!(answer.contains("(\"H\" (literal \"45\" \"http://www.w3.org/2001/XMLSchema#double\"))"));
    }

    #[tokio::test]
    async fn malformed_query_is_an_explicit_error() {
        let (bridge, _store, bus) = bridge();
        let (client, inbox) = query::channel(4);
        bridge.spawn(&bus, inbox);

        let err = client.ask("TaskManager", "(context (triple $S $P))").await.unwrap_err();
        assert!(matches!(err, CmError::Parse(_)));
        assert_eq!(client.ask("TaskManager", "(context (triple $S \"rdf:type\" \"knowrob:Nothing\"))").await.unwrap(), "(result)");
    }

    #[tokio::test]
    async fn answer_query_reports_engine_failure() {
        struct Broken;

        #[async_trait::async_trait]
        impl KnowledgeBase for Broken {
            async fn assert_triple(&self, _: &robocm_types::Triple) -> Result<(), robocm_memory::KbError> {
                Ok(())
            }
            async fn retract(&self, _: &robocm_types::TriplePattern) -> Result<usize, robocm_memory::KbError> {
                Ok(0)
            }
            async fn query(&self, _: &robocm_types::QueryPattern) -> Result<Vec<robocm_types::Bindings>, robocm_memory::KbError> {
                Err(robocm_memory::KbError::Unavailable("offline".into()))
            }
        }

        let gateway = Gateway::new(Arc::new(Broken), Duration::from_millis(100));
        let err = answer_query(&gateway, "(context (triple $S $P $O))").await.unwrap_err();
        assert!(matches!(err, CmError::GatewayQuery(_)));
    }
}
