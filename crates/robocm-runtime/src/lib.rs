//! `robocm-runtime` – The Context Manager engine.
//!
//! Ties the perception, memory and middleware crates together into the
//! running system.
//!
//! # Modules
//!
//! - [`pipeline`] – [`PerceptionPipeline`][pipeline::PerceptionPipeline]:
//!   Normalize → Encode → Assert → Evict for every inbound notification,
//!   serialized per entity class, with counters and alerts.
//! - [`dispatch`] – [`DispatchBridge`][dispatch::DispatchBridge]: per-source
//!   notification workers fed from the event bus, and one task per context
//!   query.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional OTLP span export.

pub mod dispatch;
pub mod pipeline;
pub mod telemetry;

pub use dispatch::{DispatchBridge, answer_query};
pub use pipeline::{IngestOutcome, PerceptionPipeline, PipelineSnapshot, PipelineStats, StoredWrite};
pub use telemetry::{TracerProviderGuard, init_tracing};
