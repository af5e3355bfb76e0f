//! Persisted entities: §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessageStatus {
    Received,
    Processed,
    Published,
    PublishRetry,
    Error,
}

impl ServerMessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMessageStatus::Received => "RECEIVED",
            ServerMessageStatus::Processed => "PROCESSED",
            ServerMessageStatus::Published => "PUBLISHED",
            ServerMessageStatus::PublishRetry => "PUBLISH_RETRY",
            ServerMessageStatus::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RECEIVED" => Some(Self::Received),
            "PROCESSED" => Some(Self::Processed),
            "PUBLISHED" => Some(Self::Published),
            "PUBLISH_RETRY" => Some(Self::PublishRetry),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Result,
    Order,
    Query,
    KeepAlive,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Result => "RESULT",
            MessageKind::Order => "ORDER",
            MessageKind::Query => "QUERY",
            MessageKind::KeepAlive => "KEEP_ALIVE",
            MessageKind::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RESULT" => Some(Self::Result),
            "ORDER" => Some(Self::Order),
            "QUERY" => Some(Self::Query),
            "KEEP_ALIVE" => Some(Self::KeepAlive),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl From<crate::protocol::MessageType> for MessageKind {
    fn from(t: crate::protocol::MessageType) -> Self {
        match t {
            crate::protocol::MessageType::Result => MessageKind::Result,
            crate::protocol::MessageType::Order => MessageKind::Order,
            crate::protocol::MessageType::Query => MessageKind::Query,
            crate::protocol::MessageType::KeepAlive => MessageKind::KeepAlive,
            crate::protocol::MessageType::Unknown => MessageKind::Unknown,
        }
    }
}

/// Inbound audit record: every raw message survives here before any lossy
/// parsing or downstream publish (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: i64,
    pub message_id: Uuid,
    pub instrument: String,
    pub raw_text: String,
    pub message_type: MessageKind,
    pub status: ServerMessageStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub remote_addr: Option<String>,
    /// Counts from the parsed message, persisted so a later publish retry
    /// can reproduce the full §4.7 header set without a driver of its own
    /// to re-parse `raw_text` (§4.7, §6: "Publishing headers on result
    /// emission: ... result_count, order_count ...").
    pub result_count: i64,
    pub order_count: i64,
}

impl ServerMessage {
    pub fn new_received(instrument: &str, raw_text: String, remote_addr: Option<String>) -> Self {
        Self {
            id: 0,
            message_id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            raw_text,
            message_type: MessageKind::Unknown,
            status: ServerMessageStatus::Received,
            received_at: Utc::now(),
            processed_at: None,
            published_at: None,
            error: None,
            remote_addr,
            result_count: 0,
            order_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Success => "SUCCESS",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Outbound durable order: persisted before dispatch so no order is lost
/// across restarts or transient disconnects (§3, §4.8, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderMessage {
    pub id: i64,
    pub message_id: Uuid,
    pub instrument: String,
    pub content: serde_json::Value,
    pub status: OrderStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OrderMessage {
    pub fn new_pending(instrument: &str, content: serde_json::Value, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            message_id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            content,
            status: OrderStatus::Pending,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            last_retry_at: None,
            next_retry_at: None,
            error: None,
        }
    }
}

/// Aggregate counts for the monitoring surface (§9 "stats()` snapshot").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderStoreStats {
    pub pending: u64,
    pub processing: u64,
    pub success: u64,
    pub failed: u64,
}
