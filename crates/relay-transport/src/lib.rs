//! Transport port for the relay mesh.
//!
//! The broker talks to a durable, subject-based pub/sub service through the
//! [`Transport`] trait: one named stream covers the whole agent subject
//! tree, publishes are acknowledged appends, and per-subject subscriptions
//! deliver in arrival order. Two implementations ship here:
//!
//! - [`NatsTransport`] — the production client over NATS JetStream.
//! - [`MemoryTransport`] — an in-process stand-in with the same contract,
//!   used by tests and offline runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;

mod memory;
mod nats;

pub use memory::MemoryTransport;
pub use nats::NatsTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("stream {name}: {reason}")]
    Stream { name: String, reason: String },
    #[error("no stream has been ensured on this transport")]
    StreamNotEnsured,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Configuration for the single durable stream. Retention is by limits,
/// discard policy drops the oldest entries, storage is file-backed.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
}

/// Counters describing the durable stream's current window.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamInfo {
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub messages: u64,
}

/// Callback invoked with each raw payload delivered on a subject.
pub type DeliveryFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handle for one active subject subscription. Dropping the handle (or
/// calling [`Subscription::unsubscribe`]) stops delivery.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn unsubscribe(&self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Idempotently create the named stream, or update its configuration
    /// when it already exists.
    async fn ensure_stream(&self, config: StreamConfig) -> TransportResult<()>;

    /// Durably append `payload` on `subject`. Returns only after the
    /// stream has acknowledged the append.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()>;

    /// Deliver every message landing on `subject` to `deliver`, in order
    /// within the subject.
    async fn subscribe(&self, subject: &str, deliver: DeliveryFn) -> TransportResult<Subscription>;

    async fn stream_info(&self) -> TransportResult<StreamInfo>;

    /// Stored payload at `sequence`, or `None` when that sequence is
    /// absent or already aged out.
    async fn message_by_sequence(&self, sequence: u64) -> TransportResult<Option<Vec<u8>>>;

    /// Flush pending work before the connection is dropped.
    async fn close(&self);
}
