//! [`SequenceAllocator`] – per-class perception identity.
//!
//! Every perception subject carries a sequence number that is unique within
//! its [`EntityClass`] for the lifetime of the process.  Numbers start at 1,
//! strictly increase, and are never reused, even after the triples they
//! name have been evicted.
//!
//! Each class has its own atomic counter, so allocation in one class never
//! waits on another.  Reaching the configured limit is fatal for that class:
//! the counter refuses to wrap, because a wrapped number would alias a
//! retired subject.
//!
//! # Example
//!
//! ```
//! use robocm_perception::identity::SequenceAllocator;
//! use robocm_types::EntityClass;
//!
//! let alloc = SequenceAllocator::new();
//! assert_eq!(alloc.next_sequence(EntityClass::RobotBody).unwrap(), 1);
//! assert_eq!(alloc.next_sequence(EntityClass::RobotBody).unwrap(), 2);
//! assert_eq!(alloc.next_sequence(EntityClass::Object).unwrap(), 1);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use robocm_types::{CmError, EntityClass};
use tracing::error;

/// Hands out monotonically increasing sequence numbers per entity class.
pub struct SequenceAllocator {
    counters: HashMap<EntityClass, AtomicU64>,
    /// Highest sequence number that may be handed out.
    limit: u64,
}

impl SequenceAllocator {
    /// Allocator bounded only by the `u64` range.
    pub fn new() -> Self {
        Self::with_limit(u64::MAX)
    }

    /// Allocator whose counters saturate at `limit`.
    pub fn with_limit(limit: u64) -> Self {
        let counters = EntityClass::all()
            .into_iter()
            .map(|class| (class, AtomicU64::new(0)))
            .collect();
        Self { counters, limit }
    }

    /// Allocate the next sequence number for `class`.
    ///
    /// # Errors
    ///
    /// [`CmError::AllocatorSaturation`] once the class has handed out its
    /// last number.  Every later call for that class fails the same way.
    pub fn next_sequence(&self, class: EntityClass) -> Result<u64, CmError> {
        let counter = self.counter(class)?;
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.limit).then(|| current + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| {
                error!(class = %class, limit = self.limit, "sequence allocator saturated");
                CmError::AllocatorSaturation(class)
            })
    }

    /// The last sequence number handed out for `class` (0 when none yet).
    pub fn current(&self, class: EntityClass) -> u64 {
        self.counters
            .get(&class)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Whether `class` can no longer allocate.
    pub fn is_saturated(&self, class: EntityClass) -> bool {
        self.current(class) >= self.limit
    }

    fn counter(&self, class: EntityClass) -> Result<&AtomicU64, CmError> {
        self.counters
            .get(&class)
            .ok_or_else(|| CmError::Config(format!("no sequence counter for class {class}")))
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}
