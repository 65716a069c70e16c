//! `robocm-memory` – The Knowledge Base.
//!
//! Owns everything the context manager remembers: which perception entries
//! are live, and the triples that describe them.
//!
//! # Modules
//!
//! - [`retention`] – [`RetentionWindowIndex`][retention::RetentionWindowIndex]:
//!   per-class, per-entity sliding windows that decide when old perception
//!   entries are retired.
//! - [`gateway`] – the [`KnowledgeBase`][gateway::KnowledgeBase] engine trait
//!   and the [`Gateway`][gateway::Gateway] that applies timeouts, the
//!   retry-once policy, and outcome counters to every call.
//! - [`triple_store`] – [`SqliteTripleStore`][triple_store::SqliteTripleStore]:
//!   a local SQLite engine with set semantics and conjunctive queries.

pub mod gateway;
pub mod retention;
pub mod triple_store;

pub use gateway::{Gateway, GatewaySnapshot, GatewayStats, KbError, KnowledgeBase};
pub use retention::{RetentionSettings, RetentionWindow, RetentionWindowIndex, RetiredRange};
pub use triple_store::SqliteTripleStore;
