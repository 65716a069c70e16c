//! `robocm-perception` – from wire events to semantic triples.
//!
//! Turns positional notifications published by robots into batches of
//! ontology triples that the knowledge base can store and agents can query.
//!
//! # Modules
//!
//! - [`gl`] – parser and printer for the generalized-list wire format
//!   (`(robotPosition "AMR_LIFT1" 3.5 -2.1)`).
//! - [`normalizer`] – [`Normalizer`][normalizer::Normalizer]: validates event
//!   shapes, resolves entity aliases and produces typed
//!   [`PerceptionRecord`][robocm_types::PerceptionRecord]s.
//! - [`identity`] – [`SequenceAllocator`][identity::SequenceAllocator]:
//!   gap-free per-class sequence numbers for perception subjects.
//! - [`encoder`] – [`TripleEncoder`][encoder::TripleEncoder]: deterministic
//!   record → triple-batch mapping, plus the retraction patterns for evicted
//!   entries.
//! - [`ontology`] – namespaces and IRI builders.
//! - [`context_query`] – `(context (triple …))` query parsing and
//!   `(result …)` rendering.
//!
//! | Stage      | Input                | Output                |
//! |------------|----------------------|-----------------------|
//! | parse      | `&str`               | `GeneralizedList`     |
//! | normalize  | `GeneralizedList`    | `PerceptionRecord`    |
//! | identify   | `EntityClass`        | sequence `u64`        |
//! | encode     | record + sequence    | `TripleBatch`         |

pub mod context_query;
pub mod encoder;
pub mod gl;
pub mod identity;
pub mod normalizer;
pub mod ontology;

pub use context_query::{parse_query, render_result};
pub use encoder::TripleEncoder;
pub use gl::{GeneralizedList, GlError};
pub use identity::SequenceAllocator;
pub use normalizer::{AliasTable, EventShape, Normalized, Normalizer};
