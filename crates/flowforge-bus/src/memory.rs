//! In-memory [`MessageBus`] built on `tokio::sync::broadcast`, used for
//! tests and single-process local development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use flowforge_core::bus::{EnvelopeStream, MessageBus, PublishOptions, SubscribeOptions};
use flowforge_core::error::Result;
use flowforge_schemas::Envelope;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
pub struct InMemoryMessageBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, envelope: Envelope, _options: PublishOptions) -> Result<()> {
        // No subscribers yet is not an error: broadcast::send only fails when
        // the receiver count is zero, which is a normal startup race here.
        let _ = self.sender_for(topic).send(envelope);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _options: SubscribeOptions) -> Result<EnvelopeStream> {
        let receiver = self.sender_for(topic).subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
            Ok(envelope) => Some(Ok(envelope)),
            Err(_lagged) => None,
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, _topic: &str, _group: &str, _envelope_id: uuid::Uuid) -> Result<()> {
        // Fire-and-forget fan-out has no redelivery to acknowledge.
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_schemas::create_envelope;
    use serde_json::json;

    #[tokio::test]
    async fn published_envelope_reaches_subscriber() {
        let bus = InMemoryMessageBus::new();
        let mut stream = bus
            .subscribe("task.scaffold", SubscribeOptions::default())
            .await
            .unwrap();

        let env = create_envelope("task.request", json!({"task_id": "1"}), None, None, None);
        bus.publish("task.scaffold", env.clone(), PublishOptions::default())
            .await
            .unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.id, env.id);
    }

    #[tokio::test]
    async fn topics_do_not_cross_talk() {
        let bus = InMemoryMessageBus::new();
        let mut a = bus.subscribe("topic.a", SubscribeOptions::default()).await.unwrap();
        let mut b = bus.subscribe("topic.b", SubscribeOptions::default()).await.unwrap();

        let env = create_envelope("task.request", json!({}), None, None, None);
        bus.publish("topic.a", env, PublishOptions::default()).await.unwrap();

        assert!(a.next().await.is_some());
        let timeout = tokio::time::timeout(std::time::Duration::from_millis(20), b.next()).await;
        assert!(timeout.is_err(), "topic.b should not have received topic.a's envelope");
    }
}
