//! Retention Window Index.
//!
//! Tracks, per entity class and per tracked entity, the live range of
//! writes kept in the knowledge base and decides when the oldest entries
//! are retired.
//!
//! Each tracked entity owns a window `[lo, hi)` over its own write counter.
//! `hi` advances by one on every committed write; `lo` advances only by
//! eviction.  After a write that lands `hi` on a multiple of
//! `remove_threshold`, every entry older than the newest `remove_span`
//! writes is retired in one batch.
//!
//! | write # | `hi` | evicts (threshold 10, span 10) | live after |
//! |---------|------|--------------------------------|------------|
//! | 1..=9   | 1..9 | –                              | `[0, hi)`  |
//! | 10      | 10   | nothing (`[0, 0)` is empty)    | `[0, 10)`  |
//! | 20      | 20   | `[0, 10)`                      | `[10, 20)` |
//! | 30      | 30   | `[10, 20)`                     | `[20, 30)` |
//!
//! Every window also remembers which per-class perception sequence number
//! each live entry was written under, so a retired range can be turned into
//! exact retraction patterns.
//!
//! Each class has its own lock; writers in different classes never contend.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Mutex;

use robocm_types::{CmError, EntityClass};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Eviction policy for one entity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Write-count multiple that triggers an eviction.
    pub remove_threshold: u64,
    /// Number of newest entries kept when an eviction runs.
    pub remove_span: u64,
    /// Maximum number of entities tracked at once.
    pub max_entities: usize,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            remove_threshold: 10,
            remove_span: 10,
            max_entities: 50,
        }
    }
}

impl RetentionSettings {
    /// Reject settings that would make eviction meaningless.
    pub fn validate(&self) -> Result<(), CmError> {
        if self.remove_threshold == 0 {
            return Err(CmError::Config("remove_threshold must be at least 1".into()));
        }
        if self.remove_span == 0 {
            return Err(CmError::Config("remove_span must be at least 1".into()));
        }
        if self.max_entities == 0 {
            return Err(CmError::Config("max_entities must be at least 1".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Window state
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of one entity's watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetentionWindow {
    /// Oldest live sub-sequence.
    pub lo: u64,
    /// Number of committed writes; one past the newest live sub-sequence.
    pub hi: u64,
}

impl RetentionWindow {
    pub fn live(&self) -> u64 {
        self.hi - self.lo
    }
}

/// Entries retired by one eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredRange {
    pub class: EntityClass,
    pub entity_key: String,
    /// Retired window positions, never empty.
    pub sub_sequences: Range<u64>,
    /// Perception sequence numbers written at those positions, in order.
    pub sequences: Vec<u64>,
}

impl RetiredRange {
    /// `(sequence, sub_sequence)` pairs in write order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.sequences.iter().copied().zip(self.sub_sequences.clone())
    }
}

#[derive(Debug, Default)]
struct Slot {
    window: RetentionWindow,
    /// Perception sequences for sub-sequences `lo..hi`.
    live: VecDeque<u64>,
}

#[derive(Debug)]
struct ClassWindows {
    settings: RetentionSettings,
    slots: HashMap<String, Slot>,
}

impl ClassWindows {
    fn slot_mut(&mut self, class: EntityClass, key: &str) -> Result<&mut Slot, CmError> {
        self.slots
            .get_mut(key)
            .ok_or_else(|| CmError::Storage(format!("entity {key} of class {class} was never reserved")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RetentionWindowIndex
// ─────────────────────────────────────────────────────────────────────────────

/// Per-class, per-entity retention bookkeeping.
///
/// An entity id belongs to one class only: matrix subjects are named after
/// the entity, so sharing an id across classes would let one class's
/// eviction retract the other's matrices.
#[derive(Debug)]
pub struct RetentionWindowIndex {
    classes: HashMap<EntityClass, Mutex<ClassWindows>>,
    /// Entity id to the class that admitted it.  Taken after a class lock.
    owners: Mutex<HashMap<String, EntityClass>>,
}

impl RetentionWindowIndex {
    /// Index applying `defaults` to every class.
    pub fn new(defaults: RetentionSettings) -> Result<Self, CmError> {
        Self::with_overrides(defaults, &HashMap::new())
    }

    /// Index applying `overrides` where present and `defaults` elsewhere.
    ///
    /// # Errors
    ///
    /// [`CmError::Config`] if any effective settings fail validation.
    pub fn with_overrides(
        defaults: RetentionSettings,
        overrides: &HashMap<EntityClass, RetentionSettings>,
    ) -> Result<Self, CmError> {
        let mut classes = HashMap::new();
        for class in EntityClass::all() {
            let settings = overrides.get(&class).copied().unwrap_or(defaults);
            settings
                .validate()
                .map_err(|e| CmError::Config(format!("retention for {class}: {e}")))?;
            classes.insert(
                class,
                Mutex::new(ClassWindows {
                    settings,
                    slots: HashMap::new(),
                }),
            );
        }
        Ok(Self {
            classes,
            owners: Mutex::new(HashMap::new()),
        })
    }

    /// Admit `key` into the class (if new) and return the sub-sequence its
    /// next write will occupy.  Does not advance any watermark.
    ///
    /// # Errors
    ///
    /// [`CmError::CapacityExceeded`] when `key` is new and the class already
    /// tracks `max_entities` entities; [`CmError::EntityClassConflict`] when
    /// another class already tracks `key`.
    pub fn reserve(&self, class: EntityClass, key: &str) -> Result<u64, CmError> {
        self.with_class(class, |windows| {
            if let Some(slot) = windows.slots.get(key) {
                return Ok(slot.window.hi);
            }
            let capacity = windows.settings.max_entities;
            if windows.slots.len() >= capacity {
                warn!(class = %class, entity = key, capacity, "retention capacity exceeded");
                return Err(CmError::CapacityExceeded { class, capacity });
            }
            let mut owners = self.owners()?;
            if let Some(&owner) = owners.get(key) {
                warn!(class = %class, entity = key, owner = %owner, "entity id already used by another class");
                return Err(CmError::EntityClassConflict {
                    entity: key.to_string(),
                    owner,
                    class,
                });
            }
            owners.insert(key.to_string(), class);
            debug!(class = %class, entity = key, "tracking new entity");
            windows.slots.insert(key.to_string(), Slot::default());
            Ok(0)
        })
    }

    /// Give back a slot admitted by [`reserve`](Self::reserve) that never
    /// committed a write.  Returns whether a slot was freed.
    pub fn release(&self, class: EntityClass, key: &str) -> bool {
        self.with_class(class, |windows| {
            let unused = windows.slots.get(key).is_some_and(|slot| slot.window.hi == 0);
            if unused {
                windows.slots.remove(key);
                self.owners()?.remove(key);
                debug!(class = %class, entity = key, "released unused entity slot");
            }
            Ok(unused)
        })
        .unwrap_or(false)
    }

    /// Commit one write made under perception `sequence` and return its
    /// sub-sequence (the pre-increment `hi`).
    pub fn record_write(&self, class: EntityClass, key: &str, sequence: u64) -> Result<u64, CmError> {
        self.with_class(class, |windows| {
            let slot = windows.slot_mut(class, key)?;
            let sub = slot.window.hi;
            slot.window.hi += 1;
            slot.live.push_back(sequence);
            Ok(sub)
        })
    }

    /// Retire old entries if the last write landed on the threshold.
    ///
    /// Returns at most one range; an empty vector when nothing is due.
    pub fn maybe_evict(&self, class: EntityClass, key: &str) -> Result<Vec<RetiredRange>, CmError> {
        self.with_class(class, |windows| {
            let RetentionSettings {
                remove_threshold,
                remove_span,
                ..
            } = windows.settings;
            let slot = windows.slot_mut(class, key)?;
            let RetentionWindow { lo, hi } = slot.window;
            if hi == 0 || hi % remove_threshold != 0 || hi.saturating_sub(remove_span) <= lo {
                return Ok(Vec::new());
            }
            let new_lo = hi - remove_span;
            let count = usize::try_from(new_lo - lo)
                .map_err(|_| CmError::Storage("retired range exceeds address space".into()))?;
            let sequences: Vec<u64> = slot.live.drain(..count).collect();
            slot.window.lo = new_lo;
            debug!(class = %class, entity = key, lo, new_lo, hi, "evicting retention range");
            Ok(vec![RetiredRange {
                class,
                entity_key: key.to_string(),
                sub_sequences: lo..new_lo,
                sequences,
            }])
        })
    }

    /// Current watermarks for `key`, if tracked.
    pub fn window(&self, class: EntityClass, key: &str) -> Option<RetentionWindow> {
        self.with_class(class, |windows| Ok(windows.slots.get(key).map(|s| s.window)))
            .ok()
            .flatten()
    }

    /// Number of entities tracked for `class`.
    pub fn tracked(&self, class: EntityClass) -> usize {
        self.with_class(class, |windows| Ok(windows.slots.len())).unwrap_or(0)
    }

    pub fn settings(&self, class: EntityClass) -> Option<RetentionSettings> {
        self.with_class(class, |windows| Ok(windows.settings)).ok()
    }

    fn owners(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, EntityClass>>, CmError> {
        self.owners
            .lock()
            .map_err(|_| CmError::Storage("entity owner lock poisoned".into()))
    }

    fn with_class<T>(
        &self,
        class: EntityClass,
        f: impl FnOnce(&mut ClassWindows) -> Result<T, CmError>,
    ) -> Result<T, CmError> {
        let lock = self
            .classes
            .get(&class)
            .ok_or_else(|| CmError::Config(format!("no retention window for class {class}")))?;
        let mut windows = lock
            .lock()
            .map_err(|_| CmError::Storage(format!("retention lock for {class} poisoned")))?;
        f(&mut windows)
    }
}

impl Default for RetentionWindowIndex {
    fn default() -> Self {
        let classes = EntityClass::all()
            .into_iter()
            .map(|class| {
                (
                    class,
                    Mutex::new(ClassWindows {
                        settings: RetentionSettings::default(),
                        slots: HashMap::new(),
                    }),
                )
            })
            .collect();
        Self {
            classes,
            owners: Mutex::new(HashMap::new()),
        }
    }
}
