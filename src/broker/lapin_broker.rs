//! AMQP 0.9.1 broker backed by `lapin`, run on the gateway's shared tokio
//! runtime via `tokio-executor-trait`/`tokio-reactor-trait`. Grounded on the
//! retrieval pack's `lapin`-based order/result bus usage (the spec's
//! exchange/routing_key/queue vocabulary in §6 is literally AMQP's).

use async_trait::async_trait;
use futures_lite::stream::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString},
    BasicProperties, Connection, ConnectionProperties,
};
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::traits::{Broker, BrokerError, Delivery, Result};

pub struct LapinBroker {
    connection: Connection,
}

impl LapinBroker {
    pub async fn connect(amqp_url: &str) -> Result<Self> {
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(amqp_url, options)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(classify)?;

        let mut amqp_headers = FieldTable::default();
        for (k, v) in headers {
            amqp_headers.insert(k.into(), AMQPValue::LongString(LongString::from(v)));
        }

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_headers(amqp_headers),
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(classify)?;
        channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(classify)?;

        let mut consumer = channel
            .basic_consume(
                queue,
                "astm-lis-gateway",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;

        let (tx, rx) = mpsc::channel(128);
        let routing_key = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let Ok(delivery) = delivery else { continue };
                let body = delivery.data.clone();
                if delivery.ack(BasicAckOptions::default()).await.is_err() {
                    log::warn!("failed to ack AMQP delivery on {routing_key}");
                }
                if tx
                    .send(Delivery {
                        body,
                        routing_key: routing_key.clone(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

fn classify(e: lapin::Error) -> BrokerError {
    use lapin::Error;
    match e {
        Error::IOError(_) => BrokerError::Connection(e.to_string()),
        _ => BrokerError::Unavailable(e.to_string()),
    }
}
