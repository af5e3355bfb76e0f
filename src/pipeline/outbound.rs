//! The outbound order pipeline: §4.8. Collision-aware, durable, CAS'd
//! dispatch with a scheduled retry worker.
//!
//! Grounded on `handler/meril_handler.rs`'s orchestration style; new code
//! where the teacher has no outbound-order counterpart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use log::{error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::connection::ConnectionHandler;
use crate::persistence::{OrderMessage, OrderStatus, PersistenceStore};
use crate::protocol::AstmMessage;

const COLLISION_RETRY_SECS: i64 = 30;
const UNAVAILABLE_RETRY_SECS: i64 = 60;

/// Registry of live handlers keyed by instrument name, shared between the
/// acceptor (which populates it) and the dispatcher (which reads it). §5
/// "live-handlers map is concurrent; updates use atomic put-if-absent and
/// compare-and-remove".
pub type HandlerRegistry = Arc<DashMap<String, Arc<ConnectionHandler>>>;

pub fn new_handler_registry() -> HandlerRegistry {
    Arc::new(DashMap::new())
}

/// One attempt's outcome, for logging/testing — not exposed beyond this
/// module's callers.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    CollisionBusy,
    HandlerUnavailable,
    BuildFailed,
    EnqueueRejected,
}

pub struct OrderDispatcher {
    store: Arc<dyn PersistenceStore>,
    handlers: HandlerRegistry,
}

impl OrderDispatcher {
    pub fn new(store: Arc<dyn PersistenceStore>, handlers: HandlerRegistry) -> Self {
        Self { store, handlers }
    }

    /// Persist an order arriving fresh from the broker as `PENDING` and
    /// attempt immediate dispatch (§4.8 "On order arrival").
    pub async fn intake(&self, instrument: &str, content: serde_json::Value, max_retries: u32) {
        let mut order = OrderMessage::new_pending(instrument, content, max_retries);
        let id = match self.store.save_order(&order).await {
            Ok(id) => id,
            Err(e) => {
                error!("[{instrument}] failed to persist incoming order: {e}");
                return;
            }
        };
        order.id = id;
        self.attempt_dispatch(&mut order, false).await;
    }

    /// Try to dispatch one `PENDING` order. On failure, updates its
    /// `next_retry_at`/`error` and leaves it `PENDING` for the retry worker
    /// (§4.8's invariant 6: no order reaches `SUCCESS` without first CAS-ing
    /// through `PROCESSING`).
    ///
    /// `is_retry` distinguishes the initial immediate-dispatch attempt made
    /// on broker arrival from a re-dispatch made by the scheduled retry
    /// worker: §4.8 only credits `retry_count` for the latter ("a scheduled
    /// retry worker... each unsuccessful attempt increments retry_count"),
    /// and §8 S3 pins `retry_count=0` immediately after the first collision.
    async fn attempt_dispatch(&self, order: &mut OrderMessage, is_retry: bool) -> DispatchOutcome {
        let handler = match self.handlers.get(&order.instrument).map(|h| Arc::clone(&h)) {
            Some(h) => h,
            None => {
                self.defer(order, UNAVAILABLE_RETRY_SECS, "No live handler for instrument".to_string(), is_retry)
                    .await;
                return DispatchOutcome::HandlerUnavailable;
            }
        };

        if handler.is_busy() {
            let reason = format!("Protocol busy: {}", handler.state_label());
            self.defer(order, COLLISION_RETRY_SECS, reason, is_retry).await;
            return DispatchOutcome::CollisionBusy;
        }

        let claimed = match self.store.mark_processing(order.id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!("[{}] mark_processing failed: {e}", order.instrument);
                return DispatchOutcome::HandlerUnavailable;
            }
        };
        if !claimed {
            // Another worker already claimed this order between our read
            // and our CAS attempt; leave it alone.
            return DispatchOutcome::CollisionBusy;
        }
        order.status = OrderStatus::Processing;

        let message: AstmMessage = match serde_json::from_value(order.content.clone()) {
            Ok(m) => m,
            Err(e) => {
                order.status = OrderStatus::Failed;
                order.error = Some(format!("malformed order envelope: {e}"));
                if let Err(update_err) = self.store.update_order(order).await {
                    error!("[{}] failed to record malformed order: {update_err}", order.instrument);
                }
                return DispatchOutcome::BuildFailed;
            }
        };

        // §4.8 "tolerate the handler terminating between the CAS and the
        // enqueue": a failed enqueue reverts the order to PENDING rather
        // than leaving it stuck in PROCESSING.
        if !handler.enqueue_outgoing(message) {
            self.defer(order, COLLISION_RETRY_SECS, "Handler terminated before enqueue".to_string(), is_retry)
                .await;
            return DispatchOutcome::EnqueueRejected;
        }

        order.status = OrderStatus::Success;
        order.error = None;
        if let Err(e) = self.store.update_order(order).await {
            error!("[{}] failed to mark order SUCCESS: {e}", order.instrument);
        } else {
            info!("[{}] order {} dispatched", order.instrument, order.message_id);
        }
        DispatchOutcome::Success
    }

    async fn defer(&self, order: &mut OrderMessage, delay_secs: i64, reason: String, is_retry: bool) {
        order.status = OrderStatus::Pending;
        if is_retry {
            order.retry_count += 1;
            order.last_retry_at = Some(Utc::now());
        }
        order.next_retry_at = Some(Utc::now() + ChronoDuration::seconds(delay_secs));
        order.error = Some(reason);
        if is_retry && order.retry_count >= order.max_retries {
            order.status = OrderStatus::Failed;
        }
        if let Err(e) = self.store.update_order(order).await {
            error!("[{}] failed to persist deferred order: {e}", order.instrument);
        }
    }

    /// Drive a single retry-worker-equivalent dispatch attempt for one
    /// order. Exposed publicly so integration tests can simulate a retry
    /// tick without waiting on [`Self::run_retry_loop`]'s interval.
    pub async fn retry_once(&self, order: &mut OrderMessage) -> DispatchOutcome {
        self.attempt_dispatch(order, true).await
    }

    /// Run the scheduled retry worker forever (§4.8: wakes every `T ≤ 10s`,
    /// re-dispatches everything ready).
    pub async fn run_retry_loop(self: Arc<Self>, interval: Duration, batch_limit: u32) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ready = match self.store.find_ready_for_retry(batch_limit).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!("failed to query orders ready for retry: {e}");
                    continue;
                }
            };
            for mut order in ready {
                self.attempt_dispatch(&mut order, true).await;
            }
        }
    }
}

/// Consume order envelopes from the broker's `order_queue` for one
/// instrument and hand each to [`OrderDispatcher::intake`] (§2 "Broker →
/// OrderIntake → OrderStore(persist PENDING)").
pub async fn run_order_intake(
    dispatcher: Arc<OrderDispatcher>,
    broker: Arc<dyn Broker>,
    instrument: String,
    queue: String,
    max_retries: u32,
) {
    let mut rx = match broker.consume(&queue).await {
        Ok(rx) => rx,
        Err(e) => {
            error!("[{instrument}] failed to subscribe to order queue {queue}: {e}");
            return;
        }
    };
    while let Some(delivery) = rx.recv().await {
        handle_delivery(&dispatcher, &instrument, delivery, max_retries).await;
    }
}

async fn handle_delivery(dispatcher: &Arc<OrderDispatcher>, instrument: &str, delivery: Delivery, max_retries: u32) {
    match serde_json::from_slice::<serde_json::Value>(&delivery.body) {
        Ok(content) => dispatcher.intake(instrument, content, max_retries).await,
        Err(e) => warn!("[{instrument}] dropping malformed order envelope: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use crate::protocol::record::{Record, RecordType};
    use serde_json::json;

    fn sample_envelope() -> serde_json::Value {
        let mut order_record = Record::new(RecordType::Order);
        order_record.set_field(1, "1");
        order_record.set_field(2, "S1");
        let msg = AstmMessage {
            header: None,
            patients: vec![],
            queries: vec![],
            terminator: None,
            orphan_orders: vec![crate::protocol::message::OrderRecord {
                record: order_record,
                results: vec![],
            }],
        };
        let mut value = serde_json::to_value(&msg).unwrap();
        value["instrument"] = json!("INST1");
        value
    }

    /// S3-shaped: the initial immediate-dispatch attempt on broker arrival
    /// leaves `retry_count=0` per §8 S3 — only the scheduled retry worker's
    /// re-attempts count against `max_retries`.
    #[tokio::test]
    async fn unavailable_handler_defers_without_counting_first_attempt() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let handlers = new_handler_registry();
        let dispatcher = OrderDispatcher::new(Arc::clone(&store), handlers);

        dispatcher.intake("INST1", sample_envelope(), 5).await;

        let pending = store.find_pending_by_instrument("INST1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
        assert!(pending[0].next_retry_at.is_some());
        assert!(pending[0].error.as_deref().unwrap().contains("No live handler"));
    }

    #[tokio::test]
    async fn retries_exhausted_marks_failed() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let handlers = new_handler_registry();
        let dispatcher = OrderDispatcher::new(Arc::clone(&store), handlers);

        dispatcher.intake("INST1", sample_envelope(), 1).await;
        let mut order = store.find_pending_by_instrument("INST1").await.unwrap().remove(0);
        assert_eq!(order.retry_count, 0);

        // Simulate the retry worker's single permitted re-attempt.
        dispatcher.attempt_dispatch(&mut order, true).await;

        let pending = store.find_pending_by_instrument("INST1").await.unwrap();
        assert!(pending.is_empty());
        let stats = store.order_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
    }
}
