//! `robocm-middleware` – The Nervous System
//!
//! Moves perception notifications and context queries between robots,
//! agents and the context manager without caring what they mean.
//!
//! # Modules
//!
//! - [`bus`] – topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`query`] – request/reply channel for synchronous context queries.
//! - [`ws_bridge`] – WebSocket broker bridge that lets external robots
//!   publish notifications and external agents ask queries as JSON frames.

pub mod bus;
pub mod query;
pub mod ws_bridge;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use query::{QueryClient, QueryInbox, QueryRequest};
pub use ws_bridge::WsBridge;
