//! EDTwin event bus.
//!
//! Topic-scoped publish/subscribe over an in-process append-only log:
//! - SchemaRegistry: the process-wide topic → schema mapping; validation
//!   narrows enumerations and rejects unknown fields.
//! - MemoryBroker: per-topic record logs with consumer-group cursors.
//! - BusClient: validated produce with bounded retry and a bounded
//!   in-memory outbox; subscriptions with per-topic ordering.
//! - Consumer loop helper with drain-on-shutdown semantics.

use std::time::Duration;
use thiserror::Error;

pub mod broker;
pub mod client;
pub mod consumer;
pub mod registry;

pub use broker::{BusMessage, MemoryBroker};
pub use client::{BusClient, BusClientConfig, Subscription};
pub use consumer::{decode_payload, spawn_consumer_loop};
pub use registry::SchemaRegistry;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Invalid payload for topic {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },

    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bus is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, BusError>;
