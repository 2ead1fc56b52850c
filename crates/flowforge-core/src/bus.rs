//! Message bus port: pub/sub fan-out plus a durable stream mirror for
//! replay. Concrete adapters live in `flowforge-bus`.

use std::pin::Pin;

use async_trait::async_trait;
use flowforge_schemas::Envelope;
use futures::Stream;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Also append to the durable stream for this topic (spec.md §4.2);
    /// pub/sub-only publishes (e.g. progress pings) can skip this.
    pub durable: bool,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Consumer group name; required for durable (at-least-once) delivery.
    pub group: Option<String>,
    /// Unique consumer name within `group`.
    pub consumer: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            group: None,
            consumer: None,
        }
    }
}

pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<Envelope>> + Send>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `envelope` to `topic`.
    async fn publish(&self, topic: &str, envelope: Envelope, options: PublishOptions) -> Result<()>;

    /// Subscribe to `topic`, returning a stream of envelopes.
    async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<EnvelopeStream>;

    /// Acknowledge a durably-delivered envelope so it is not redelivered.
    async fn ack(&self, topic: &str, group: &str, envelope_id: uuid::Uuid) -> Result<()>;

    async fn health(&self) -> Result<()>;
}
