//! [`PerceptionPipeline`] – Normalize → Encode → Assert → Evict.
//!
//! One call to [`PerceptionPipeline::ingest`] takes a raw notification all
//! the way into the knowledge base:
//!
//! 1. **Parse** the generalized-list text.
//! 2. **Normalize** it into a typed record (unknown events are ignored).
//! 3. **Reserve** a retention slot for the entity (new entities may be
//!    refused when the class is full).
//! 4. **Allocate** the next per-class sequence number.
//! 5. **Encode** the record into a triple batch.
//! 6. **Assert** the batch through the [`Gateway`].
//! 7. **Commit** the write to the retention window.
//! 8. **Evict** and retract retired entries when the window asks for it.
//!
//! Steps 3–8 run under a per-class async lock, so writes within one class
//! happen in strict arrival order while other classes proceed in parallel.
//! The commit in step 7 happens only once the assert has been attempted
//! (including its retry), never speculatively.
//!
//! Allocator saturation and capacity refusals are published on
//! [`Topic::SystemAlerts`][robocm_middleware::Topic::SystemAlerts].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use robocm_memory::{Gateway, RetentionWindowIndex, RetiredRange};
use robocm_middleware::EventBus;
use robocm_perception::{Normalized, Normalizer, SequenceAllocator, TripleEncoder, gl};
use robocm_types::{CmError, EntityClass, PerceptionRecord, alert};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

/// Component name used on alerts raised by the pipeline.
pub const COMPONENT: &str = "robocm-runtime::pipeline";

// ─────────────────────────────────────────────────────────────────────────────
// Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Details of a write that reached the retention window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredWrite {
    pub class: EntityClass,
    pub entity_id: String,
    pub sequence: u64,
    pub sub_sequence: u64,
    /// Triples accepted by the knowledge base.
    pub asserted: usize,
    /// Whether the assert gave up part-way; the observation is then lost
    /// but still occupies its window position.
    pub assert_failed: bool,
    /// Triples removed by an eviction this write triggered.
    pub retracted: usize,
}

/// What became of one notification.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Stored(StoredWrite),
    /// The event is not one the context manager tracks.
    Ignored { event: String },
    /// Refused before anything was asserted.
    Rejected(CmError),
}

impl IngestOutcome {
    pub fn stored(&self) -> Option<&StoredWrite> {
        match self {
            IngestOutcome::Stored(w) => Some(w),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Running pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    stored: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    evictions: AtomicU64,
    retracted_triples: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub received: u64,
    pub stored: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub evictions: u64,
    pub retracted_triples: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            retracted_triples: self.retracted_triples.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// The write path from notification text to knowledge-base triples.
pub struct PerceptionPipeline {
    normalizer: Normalizer,
    allocator: SequenceAllocator,
    encoder: TripleEncoder,
    retention: RetentionWindowIndex,
    gateway: Gateway,
    bus: Arc<EventBus>,
    class_locks: HashMap<EntityClass, tokio::sync::Mutex<()>>,
    /// Classes already reported as saturated.
    halted: Mutex<HashSet<EntityClass>>,
    stats: PipelineStats,
}

impl PerceptionPipeline {
    pub fn new(
        normalizer: Normalizer,
        retention: RetentionWindowIndex,
        gateway: Gateway,
        bus: Arc<EventBus>,
    ) -> Self {
        Self::with_allocator(normalizer, SequenceAllocator::new(), retention, gateway, bus)
    }

    /// Pipeline using a caller-supplied allocator (e.g. one with a low
    /// limit for saturation drills).
    pub fn with_allocator(
        normalizer: Normalizer,
        allocator: SequenceAllocator,
        retention: RetentionWindowIndex,
        gateway: Gateway,
        bus: Arc<EventBus>,
    ) -> Self {
        let class_locks = EntityClass::all()
            .into_iter()
            .map(|class| (class, tokio::sync::Mutex::new(())))
            .collect();
        Self {
            normalizer,
            allocator,
            encoder: TripleEncoder::new(),
            retention,
            gateway,
            bus,
            class_locks,
            halted: Mutex::new(HashSet::new()),
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn retention(&self) -> &RetentionWindowIndex {
        &self.retention
    }

    pub fn allocator(&self) -> &SequenceAllocator {
        &self.allocator
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Process one notification from `source`.
    #[instrument(skip(self, text))]
    pub async fn ingest(&self, source: &str, text: &str) -> IngestOutcome {
        PipelineStats::bump(&self.stats.received, 1);

        let list = match gl::parse(text) {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "dropping unparsable notification");
                return self.reject(e.into());
            }
        };

        let record = match self.normalizer.normalize_list(&list, Utc::now().timestamp()) {
            Normalized::Record(record) => record,
            Normalized::Ignored => {
                PipelineStats::bump(&self.stats.ignored, 1);
                return IngestOutcome::Ignored { event: list.name };
            }
            Normalized::Rejected(e) => return self.reject(e),
        };

        match self.write(&record).await {
            Ok(stored) => {
                PipelineStats::bump(&self.stats.stored, 1);
                if stored.assert_failed {
                    PipelineStats::bump(&self.stats.dropped, 1);
                }
                IngestOutcome::Stored(stored)
            }
            Err(e) => self.reject(e),
        }
    }

    async fn write(&self, record: &PerceptionRecord) -> Result<StoredWrite, CmError> {
        let class = record.class;
        let key = record.entity_id.as_str();
        let lock = self
            .class_locks
            .get(&class)
            .ok_or_else(|| CmError::Config(format!("no write lock for class {class}")))?;
        let _guard = lock.lock().await;

        let sub_sequence = self.retention.reserve(class, key).inspect_err(|e| {
            if let CmError::CapacityExceeded { .. } = e {
                self.bus.alert(COMPONENT, alert::CAPACITY_EXCEEDED, e.to_string());
            }
        })?;
        let sequence = self.allocator.next_sequence(class).inspect_err(|e| {
            self.retention.release(class, key);
            self.halt(class, e);
        })?;

        let batch = self.encoder.encode(record, sequence, sub_sequence);
        let mut asserted = 0;
        let mut assert_failed = false;
        for triple in &batch.triples {
            if self.gateway.assert_triple(triple).await.is_err() {
                assert_failed = true;
                break;
            }
            asserted += 1;
        }
        if assert_failed {
            warn!(class = %class, entity = key, sequence, asserted, "observation dropped");
        }

        let committed = self.retention.record_write(class, key, sequence)?;
        debug_assert_eq!(committed, sub_sequence);

        let mut retracted = 0;
        for range in self.retention.maybe_evict(class, key)? {
            retracted += self.retract_range(&range).await;
        }

        debug!(class = %class, entity = key, sequence, sub_sequence, asserted, retracted, "perception stored");
        Ok(StoredWrite {
            class,
            entity_id: record.entity_id.clone(),
            sequence,
            sub_sequence,
            asserted,
            assert_failed,
            retracted,
        })
    }

    /// Retract every entry of a retired range; failures are already logged
    /// by the gateway and leave those triples behind.
    async fn retract_range(&self, range: &RetiredRange) -> usize {
        PipelineStats::bump(&self.stats.evictions, 1);
        info!(
            class = %range.class,
            entity = %range.entity_key,
            from = range.sub_sequences.start,
            to = range.sub_sequences.end,
            "evicting retired perceptions"
        );
        let mut removed = 0;
        for (sequence, sub_sequence) in range.entries() {
            for pattern in self
                .encoder
                .retraction_patterns(range.class, &range.entity_key, sequence, sub_sequence)
            {
                if let Ok(n) = self.gateway.retract(&pattern).await {
                    removed += n;
                }
            }
        }
        PipelineStats::bump(&self.stats.retracted_triples, removed as u64);
        removed
    }

    fn halt(&self, class: EntityClass, e: &CmError) {
        let Ok(mut halted) = self.halted.lock() else {
            return;
        };
        if halted.insert(class) {
            error!(class = %class, "class halted: no further writes will be accepted");
            self.bus.alert(COMPONENT, alert::ALLOCATOR_SATURATION, e.to_string());
        }
    }

    fn reject(&self, e: CmError) -> IngestOutcome {
        PipelineStats::bump(&self.stats.rejected, 1);
        IngestOutcome::Rejected(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robocm_memory::{KnowledgeBase, RetentionSettings, SqliteTripleStore};
    use robocm_middleware::Topic;
    use robocm_perception::ontology;
    use robocm_types::{EventPayload, QueryAtom, QueryPattern, QueryTerm, Term};
    use std::time::Duration;

    struct Harness {
        pipeline: PerceptionPipeline,
        store: SqliteTripleStore,
        bus: Arc<EventBus>,
    }

    fn harness(settings: RetentionSettings, allocator: SequenceAllocator) -> Harness {
        let store = SqliteTripleStore::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::default());
        let gateway = Gateway::new(Arc::new(store.clone()), Duration::from_secs(2));
        let pipeline = PerceptionPipeline::with_allocator(
            Normalizer::default(),
            allocator,
            RetentionWindowIndex::new(settings).unwrap(),
            gateway,
            Arc::clone(&bus),
        );
        Harness { pipeline, store, bus }
    }

    fn default_harness() -> Harness {
        harness(RetentionSettings::default(), SequenceAllocator::new())
    }

    fn position(robot: &str, x: f64, y: f64) -> String {
        format!("(robotPosition \"{robot}\" \"{x}\" \"{y}\")")
    }

    #[tokio::test]
    async fn position_is_stored_as_eight_triples() {
        let h = default_harness();
        let outcome = h.pipeline.ingest("AMR_LIFT1", &position("AMR_LIFT1", 3.5, -2.1)).await;
        let stored = outcome.stored().unwrap();
        assert_eq!(stored.entity_id, "AMR_Lift01");
        assert_eq!((stored.sequence, stored.sub_sequence), (1, 0));
        assert_eq!(stored.asserted, 8);
        assert!(!stored.assert_failed);
        assert_eq!(h.store.len().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn stored_triples_answer_queries() {
        let h = default_harness();
        h.pipeline.ingest("AMR_LIFT1", &position("AMR_LIFT1", 3.5, -2.1)).await;
        let q = QueryPattern {
            atoms: vec![
                QueryAtom {
                    subject: QueryTerm::Var("P".into()),
                    predicate: QueryTerm::Const(Term::iri(ontology::knowrob("objectActedOn"))),
                    object: QueryTerm::Const(Term::iri(ontology::arbi("AMR_Lift01"))),
                },
                QueryAtom {
                    subject: QueryTerm::Var("P".into()),
                    predicate: QueryTerm::Const(Term::iri(ontology::knowrob("eventOccursAt"))),
                    object: QueryTerm::Var("M".into()),
                },
                QueryAtom {
                    subject: QueryTerm::Var("M".into()),
                    predicate: QueryTerm::Const(Term::iri(ontology::knowrob("m03"))),
                    object: QueryTerm::Var("X".into()),
                },
            ],
        };
        let rows = h.store.query(&q).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["X"], Term::literal("3.5", ontology::XSD_DOUBLE));
    }

    #[tokio::test]
    async fn malformed_and_unknown_events_do_not_touch_the_store() {
        let h = default_harness();
        assert!(matches!(
            h.pipeline.ingest("x", "(robotPosition \"AMR_LIFT1\"").await,
            IngestOutcome::Rejected(CmError::Parse(_))
        ));
        assert!(matches!(
            h.pipeline.ingest("x", "(robotPosition \"AMR_LIFT1\" \"1\")").await,
            IngestOutcome::Rejected(CmError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            h.pipeline.ingest("x", "(robotPosition \"AMR_LIFT1\" \"east\" \"2\")").await,
            IngestOutcome::Rejected(CmError::ShapeMismatch { .. })
        ));
        assert_eq!(
            h.pipeline.ingest("x", "(doorOpened \"door1\")").await,
            IngestOutcome::Ignored {
                event: "doorOpened".into()
            }
        );
        assert!(h.store.is_empty().await.unwrap());
        assert_eq!(h.pipeline.allocator().current(EntityClass::RobotBody), 0);
        assert!(h.pipeline.retention().window(EntityClass::RobotBody, "AMR_Lift01").is_none());
        assert_eq!(h.pipeline.retention().tracked(EntityClass::RobotBody), 0);
        let s = h.pipeline.stats().snapshot();
        assert_eq!((s.received, s.rejected, s.ignored, s.stored), (4, 3, 1, 0));
    }

    #[tokio::test]
    async fn rejected_events_leave_an_existing_window_unchanged() {
        let h = default_harness();
        assert!(h.pipeline.ingest("x", &position("AMR_LIFT1", 1.0, 2.0)).await.stored().is_some());

        for bad in [
            "(robotPosition \"AMR_LIFT1\"",
            "(robotPosition \"AMR_LIFT1\" \"1\")",
            "(robotDegree \"AMR_LIFT1\" \"north\")",
        ] {
            assert!(matches!(h.pipeline.ingest("x", bad).await, IngestOutcome::Rejected(_)));
        }
        let w = h.pipeline.retention().window(EntityClass::RobotBody, "AMR_Lift01").unwrap();
        assert_eq!((w.lo, w.hi), (0, 1));
        assert_eq!(h.pipeline.allocator().current(EntityClass::RobotBody), 1);
        assert_eq!(h.store.len().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn eviction_retracts_retired_perceptions_and_matrices() {
        let h = default_harness();
        for i in 0..20 {
            h.pipeline.ingest("AMR_LIFT1", &position("AMR_LIFT1", f64::from(i), 0.0)).await;
        }
        // Twenty writes of eight triples, minus the ten retired entries.
        assert_eq!(h.store.len().await.unwrap(), 80);
        let first = h.store.describe(&ontology::perception_subject(EntityClass::RobotBody, 1)).await.unwrap();
        assert!(first.is_empty());
        let first_matrix = h.store.describe(&ontology::matrix_subject("AMR_Lift01", 0)).await.unwrap();
        assert!(first_matrix.is_empty());
        let live = h.store.describe(&ontology::perception_subject(EntityClass::RobotBody, 11)).await.unwrap();
        assert_eq!(live.len(), 4);
        let w = h.pipeline.retention().window(EntityClass::RobotBody, "AMR_Lift01").unwrap();
        assert_eq!((w.lo, w.hi), (10, 20));
        assert_eq!(h.pipeline.stats().snapshot().evictions, 1);
    }

    #[tokio::test]
    async fn tenth_write_keeps_everything() {
        let h = default_harness();
        let mut last = None;
        for i in 0..10 {
            last = h.pipeline.ingest("AMR_LIFT1", &position("AMR_LIFT1", f64::from(i), 1.0)).await.stored().cloned();
        }
        assert_eq!(last.unwrap().retracted, 0);
        assert_eq!(h.store.len().await.unwrap(), 80);
    }

    #[tokio::test]
    async fn capacity_refusal_raises_alert() {
        let settings = RetentionSettings {
            max_entities: 1,
            ..Default::default()
        };
        let h = harness(settings, SequenceAllocator::new());
        let mut alerts = h.bus.subscribe_to(Topic::SystemAlerts);

        assert!(h.pipeline.ingest("a", &position("AMR_LIFT1", 0.0, 0.0)).await.stored().is_some());
        let refused = h.pipeline.ingest("b", &position("AMR_LIFT2", 0.0, 0.0)).await;
        assert_eq!(
            refused,
            IngestOutcome::Rejected(CmError::CapacityExceeded {
                class: EntityClass::RobotBody,
                capacity: 1
            })
        );
        // Refused writes consume no sequence number.
        assert_eq!(h.pipeline.allocator().current(EntityClass::RobotBody), 1);
        let event = alerts.next().await.unwrap();
        assert!(matches!(event.payload, EventPayload::SystemAlert { code: alert::CAPACITY_EXCEEDED, .. }));
    }

    #[tokio::test]
    async fn saturation_halts_the_class_and_alerts_once() {
        let h = harness(RetentionSettings::default(), SequenceAllocator::with_limit(2));
        let mut alerts = h.bus.subscribe_to(Topic::SystemAlerts);

        for _ in 0..2 {
            assert!(h.pipeline.ingest("a", &position("AMR_LIFT1", 0.0, 0.0)).await.stored().is_some());
        }
        for _ in 0..3 {
            assert_eq!(
                h.pipeline.ingest("a", &position("AMR_LIFT1", 0.0, 0.0)).await,
                IngestOutcome::Rejected(CmError::AllocatorSaturation(EntityClass::RobotBody))
            );
        }
        let event = alerts.next().await.unwrap();
        assert!(matches!(event.payload, EventPayload::SystemAlert { code: alert::ALLOCATOR_SATURATION, .. }));
        assert!(tokio::time::timeout(Duration::from_millis(50), alerts.recv()).await.is_err());

        // A new entity in the halted class does not keep a capacity slot.
        assert!(h.pipeline.ingest("b", &position("AMR_LIFT2", 0.0, 0.0)).await.stored().is_none());
        assert_eq!(h.pipeline.retention().tracked(EntityClass::RobotBody), 1);
        assert!(h.pipeline.retention().window(EntityClass::RobotBody, "AMR_Lift02").is_none());
        assert_eq!(
            h.pipeline.retention().window(EntityClass::RobotBody, "AMR_Lift01").map(|w| (w.lo, w.hi)),
            Some((0, 2))
        );

        // Other classes keep working.
        let other = h.pipeline.ingest("box", "(objectPosition \"crate7\" 1 2)").await;
        assert_eq!(other.stored().map(|w| w.sequence), Some(1));
    }

    #[tokio::test]
    async fn entity_id_reused_by_another_class_is_refused() {
        let h = default_harness();
        assert!(h.pipeline.ingest("a", &position("AMR_LIFT1", 1.0, 2.0)).await.stored().is_some());

        let outcome = h.pipeline.ingest("camera", "(objectPosition \"AMR_Lift01\" 5 6)").await;
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected(CmError::EntityClassConflict {
                owner: EntityClass::RobotBody,
                class: EntityClass::Object,
                ..
            })
        ));
        assert_eq!(h.pipeline.allocator().current(EntityClass::Object), 0);
        assert_eq!(h.store.len().await.unwrap(), 8);
        let matrix = h.store.describe(&ontology::matrix_subject("AMR_Lift01", 0)).await.unwrap();
        assert_eq!(matrix.len(), 4);
    }

    #[tokio::test]
    async fn non_spatial_records_share_the_window() {
        let h = default_harness();
        h.pipeline.ingest("a", &position("AMR_LIFT1", 1.0, 2.0)).await;
        let status = h.pipeline.ingest("a", "(robotStatus \"AMR_LIFT1\" \"charging\")").await;
        let stored = status.stored().unwrap();
        assert_eq!((stored.sequence, stored.sub_sequence, stored.asserted), (2, 1, 4));
    }
}
