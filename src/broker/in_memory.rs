//! A channel-based broker test double with no network dependency, grounded
//! on the retrieval pack's `EventTransport` trait pattern (an in-memory
//! implementation alongside a real one, selected behind `Arc<dyn Broker>`).

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::traits::{Broker, Delivery, Result};

#[derive(Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, mpsc::Sender<Delivery>>,
    /// Every publish is recorded here regardless of queue, for assertions.
    published: Arc<tokio::sync::Mutex<Vec<(String, String, Vec<u8>, HashMap<String, String>)>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published_messages(&self) -> Vec<(String, String, Vec<u8>, HashMap<String, String>)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: HashMap<String, String>,
    ) -> Result<()> {
        self.published.lock().await.push((
            exchange.to_string(),
            routing_key.to_string(),
            body.to_vec(),
            headers,
        ));
        if let Some(sender) = self.queues.get(routing_key) {
            let _ = sender
                .send(Delivery {
                    body: body.to_vec(),
                    routing_key: routing_key.to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(128);
        self.queues.insert(queue.to_string(), tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_a_consumer_does_not_error() {
        let broker = InMemoryBroker::new();
        broker
            .publish("ex", "rk", b"body", HashMap::new())
            .await
            .unwrap();
        assert_eq!(broker.published_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn consumer_receives_published_message() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.consume("orders.INST1").await.unwrap();
        broker
            .publish("ex", "orders.INST1", b"hello", HashMap::new())
            .await
            .unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body, b"hello");
    }
}
