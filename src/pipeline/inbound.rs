//! The inbound message pipeline: §4.7. Strictly ordered: persist the raw
//! text first (so it survives even if everything downstream fails), then
//! parse, then publish for RESULT/QUERY messages.
//!
//! Grounded on `handler/meril_handler.rs`'s sequential match-on-Result
//! orchestration style, generalized from "save patient/result" to
//! "persist raw, parse, publish".

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};

use crate::broker::Broker;
use crate::persistence::{MessageKind, PersistenceStore, ServerMessage, ServerMessageStatus};
use crate::protocol::{classify, VendorDriver};

/// Per-message context a connection handler already knows (instrument
/// identity and routing), threaded through so this module stays free of
/// any connection-handler state.
pub struct InboundContext {
    pub instrument: String,
    pub remote_addr: Option<String>,
    pub exchange: String,
    pub routing_key: String,
}

/// Run the full pipeline for one reassembled message. Never panics and
/// never drops the raw bytes: a parse failure still leaves the persisted
/// `ServerMessage` in place, marked `ERROR` (§7 "Pipelines never drop raw
/// bytes").
pub async fn process(
    ctx: InboundContext,
    raw_text: String,
    driver: Arc<dyn VendorDriver>,
    store: Arc<dyn PersistenceStore>,
    broker: Arc<dyn Broker>,
) {
    let message_type = classify(&raw_text);
    let mut record = ServerMessage::new_received(&ctx.instrument, raw_text.clone(), ctx.remote_addr.clone());
    record.message_type = MessageKind::from(message_type);

    let id = match store.save_server_message(&record).await {
        Ok(id) => id,
        Err(e) => {
            // Persistence is the one step this pipeline cannot recover
            // from by retrying later against the same record: there is no
            // row to retry against yet. Logged loudly; the instrument
            // still got its ACK at the protocol layer per §7.
            error!("[{}] failed to persist inbound message: {e}", ctx.instrument);
            return;
        }
    };
    record.id = id;

    let parsed = match driver.parse(&raw_text) {
        Ok(msg) => msg,
        Err(e) => {
            record.status = ServerMessageStatus::Error;
            record.error = Some(format!("parse error: {e}"));
            record.processed_at = Some(Utc::now());
            if let Err(update_err) = store.update_server_message(&record).await {
                error!("[{}] failed to record parse error: {update_err}", ctx.instrument);
            }
            warn!("[{}] parse failed: {e}", ctx.instrument);
            return;
        }
    };

    record.status = ServerMessageStatus::Processed;
    record.processed_at = Some(Utc::now());
    record.result_count = parsed.result_count() as i64;
    record.order_count = parsed.order_count() as i64;
    if let Err(e) = store.update_server_message(&record).await {
        error!("[{}] failed to mark message processed: {e}", ctx.instrument);
    }

    if !matches!(message_type, crate::protocol::MessageType::Result | crate::protocol::MessageType::Query) {
        return;
    }

    let mut headers = HashMap::new();
    headers.insert("instrument".to_string(), ctx.instrument.clone());
    headers.insert("message_type".to_string(), message_type.to_string());
    headers.insert("result_count".to_string(), parsed.result_count().to_string());
    headers.insert("order_count".to_string(), parsed.order_count().to_string());
    headers.insert("timestamp".to_string(), Utc::now().to_rfc3339());

    match broker
        .publish(&ctx.exchange, &ctx.routing_key, raw_text.as_bytes(), headers)
        .await
    {
        Ok(()) => {
            record.status = ServerMessageStatus::Published;
            record.published_at = Some(Utc::now());
            if let Err(e) = store.update_server_message(&record).await {
                error!("[{}] failed to mark message published: {e}", ctx.instrument);
            }
            info!(
                "[{}] published {} (results={}, orders={})",
                ctx.instrument, message_type, parsed.result_count(), parsed.order_count()
            );
        }
        Err(e) => {
            // §4.7 classification: connection/timeout/unavailable ⇒ retry,
            // auth/serialization ⇒ permanent error.
            if e.is_transient() {
                record.status = ServerMessageStatus::PublishRetry;
            } else {
                record.status = ServerMessageStatus::Error;
            }
            record.error = Some(format!("publish error: {e}"));
            if let Err(update_err) = store.update_server_message(&record).await {
                error!("[{}] failed to record publish failure: {update_err}", ctx.instrument);
            }
            warn!("[{}] publish failed ({}): {e}", ctx.instrument, if e.is_transient() { "will retry" } else { "permanent" });
        }
    }
}

/// Background task: periodically re-attempt publication of messages left
/// in `PUBLISH_RETRY` (§4.7). No maximum retry count is imposed; a broker
/// outage is treated as operationally recoverable.
pub async fn run_publish_retry_task(
    store: Arc<dyn PersistenceStore>,
    broker: Arc<dyn Broker>,
    exchange_for: impl Fn(&str) -> (String, String) + Send + Sync + 'static,
    batch_limit: u32,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let pending = match store.find_server_messages_by_status(ServerMessageStatus::PublishRetry, batch_limit).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("failed to query PUBLISH_RETRY messages: {e}");
                continue;
            }
        };
        for mut record in pending {
            let (exchange, routing_key) = exchange_for(&record.instrument);
            let mut headers = HashMap::new();
            headers.insert("instrument".to_string(), record.instrument.clone());
            headers.insert("message_type".to_string(), record.message_type.as_str().to_string());
            headers.insert("result_count".to_string(), record.result_count.to_string());
            headers.insert("order_count".to_string(), record.order_count.to_string());
            headers.insert("timestamp".to_string(), Utc::now().to_rfc3339());

            match broker.publish(&exchange, &routing_key, record.raw_text.as_bytes(), headers).await {
                Ok(()) => {
                    record.status = ServerMessageStatus::Published;
                    record.published_at = Some(Utc::now());
                    record.error = None;
                    if let Err(e) = store.update_server_message(&record).await {
                        error!("failed to mark retried message published: {e}");
                    }
                }
                Err(e) if !e.is_transient() => {
                    record.status = ServerMessageStatus::Error;
                    record.error = Some(format!("publish error: {e}"));
                    if let Err(update_err) = store.update_server_message(&record).await {
                        error!("failed to record permanent publish failure: {update_err}");
                    }
                }
                Err(e) => {
                    warn!("retry publish still failing for {}: {e}", record.instrument);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::persistence::SqliteStore;
    use crate::protocol::vendor::GenericDriver;

    #[tokio::test]
    async fn result_message_persists_then_publishes() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let broker = Arc::new(InMemoryBroker::new());
        let driver: Arc<dyn VendorDriver> = Arc::new(GenericDriver::new("INST1"));

        let ctx = InboundContext {
            instrument: "INST1".to_string(),
            remote_addr: Some("127.0.0.1:1".to_string()),
            exchange: "lis.astm".to_string(),
            routing_key: "astm.INST1".to_string(),
        };
        let text = "H|\\^&\rP|1||||DOE^J\rO|1|S1||\rR|1|^^^GLU|95|mg/dL|||F||||20240101000000|I1\rL|1|N\r".to_string();

        let broker_dyn: Arc<dyn Broker> = broker.clone();
        process(ctx, text, driver, Arc::clone(&store), broker_dyn).await;

        let recent = store.find_recent_by_instrument("INST1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, ServerMessageStatus::Published);
        assert_eq!(broker.published_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn parse_failure_keeps_raw_and_marks_error() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());

        struct FailingDriver;
        impl VendorDriver for FailingDriver {
            fn parse(&self, _raw_text: &str) -> crate::protocol::Result<crate::protocol::AstmMessage> {
                Err(crate::protocol::ProtocolError::InvalidRecordFormat("boom".into()))
            }
            fn build(&self, m: &crate::protocol::AstmMessage) -> crate::protocol::Result<String> {
                Ok(m.build())
            }
            fn instrument_name(&self) -> &str { "INST1" }
            fn astm_version(&self) -> &str { "E1394-97" }
            fn supports(&self, _raw: &str) -> bool { true }
            fn driver_config_descriptor(&self) -> &crate::protocol::vendor::FieldMap {
                static EMPTY: std::sync::OnceLock<crate::protocol::vendor::FieldMap> = std::sync::OnceLock::new();
                EMPTY.get_or_init(Default::default)
            }
        }

        let ctx = InboundContext {
            instrument: "INST1".to_string(),
            remote_addr: None,
            exchange: "lis.astm".to_string(),
            routing_key: "astm.INST1".to_string(),
        };
        process(ctx, "garbage".to_string(), Arc::new(FailingDriver), Arc::clone(&store), broker).await;

        let recent = store.find_recent_by_instrument("INST1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, ServerMessageStatus::Error);
        assert_eq!(recent[0].raw_text, "garbage");
    }
}
