//! The broker interface: §6.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timeout")]
    Timeout,
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("authentication/authorization error: {0}")]
    Auth(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Classify per §4.7/§7: connection/timeout/unavailable ⇒ transient
    /// (retryable); auth/serialization ⇒ permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Timeout | BrokerError::Unavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// A message arriving from the LIS bus (consumed by `OrderIntake`, §2).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
}

/// Publish/consume abstraction over the LIS message bus (§6).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: HashMap<String, String>,
    ) -> Result<()>;

    /// Register a consumer for `queue`; returns a channel receiver so the
    /// caller can `.recv().await` deliveries without borrowing the broker.
    async fn consume(&self, queue: &str) -> Result<tokio::sync::mpsc::Receiver<Delivery>>;
}
