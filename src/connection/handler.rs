//! The per-connection protocol engine: §4.3.
//!
//! Grounded on `service/machine/meril_machine_service.rs`'s blocking
//! per-connection thread and `handler/meril_handler.rs`'s wrapping
//! start/stop/is-running object, generalized to own exactly one ASTM
//! session instead of one fixed Meril-only service.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::broker::Broker;
use crate::persistence::PersistenceStore;
use crate::pipeline::inbound::InboundContext;
use crate::protocol::{classify, AstmMessage, FramingStateMachine, MessageType, ProtocolError, State, VendorDriver};

const OUTBOUND_QUEUE_CAPACITY: usize = 64;
const LOOP_IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Connection health, a supplemental read-only stat (SPEC_FULL §3) derived
/// from recent I/O outcomes; it never feeds back into protocol timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Owns one instrument's live TCP session: its framing state machine, its
/// outbound queue, and its cooperative I/O loop.
pub struct ConnectionHandler {
    instrument: String,
    state_machine: Arc<FramingStateMachine>,
    outbound_tx: Sender<AstmMessage>,
    outbound_rx: Receiver<AstmMessage>,
    driver: Arc<dyn VendorDriver>,
    store: Arc<dyn PersistenceStore>,
    broker: Arc<dyn Broker>,
    runtime: tokio::runtime::Handle,
    running: Arc<AtomicBool>,
    consecutive_errors: std::sync::atomic::AtomicU32,
    remote_addr: String,
    exchange: String,
    routing_key: String,
}

impl ConnectionHandler {
    pub fn new(
        instrument: String,
        stream: TcpStream,
        driver: Arc<dyn VendorDriver>,
        store: Arc<dyn PersistenceStore>,
        broker: Arc<dyn Broker>,
        runtime: tokio::runtime::Handle,
        exchange: String,
        routing_key: String,
    ) -> std::io::Result<Self> {
        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let state_machine = Arc::new(
            FramingStateMachine::new(stream).map_err(|e| match e {
                ProtocolError::Io(io_err) => io_err,
                other => std::io::Error::new(std::io::ErrorKind::Other, other),
            })?,
        );
        let (outbound_tx, outbound_rx) = bounded(OUTBOUND_QUEUE_CAPACITY);
        Ok(Self {
            instrument,
            state_machine,
            outbound_tx,
            outbound_rx,
            driver,
            store,
            broker,
            runtime,
            running: Arc::new(AtomicBool::new(true)),
            consecutive_errors: std::sync::atomic::AtomicU32::new(0),
            remote_addr,
            exchange,
            routing_key,
        })
    }

    pub fn state_machine(&self) -> Arc<FramingStateMachine> {
        Arc::clone(&self.state_machine)
    }

    /// Enqueue an outgoing message. Never blocks the caller: a full queue
    /// is handled by a caller-runs policy — the order dispatcher's retry
    /// scheduler will simply see the order still `PENDING` and try later,
    /// rather than the publish path stalling (§9 "Outgoing queue").
    pub fn enqueue_outgoing(&self, msg: AstmMessage) -> bool {
        match self.outbound_tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("[{}] outbound queue full, rejecting enqueue", self.instrument);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.state_machine.is_connected()
    }

    pub fn is_busy(&self) -> bool {
        self.state_machine.get_state() != State::Idle
    }

    /// Upper-case label of the current framing state, for collision error
    /// messages (§4.8: `"Protocol busy: RECEIVING"`).
    pub fn state_label(&self) -> &'static str {
        self.state_machine.get_state().label()
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn can_accept_orders(&self) -> bool {
        self.is_connected() && !self.is_busy()
    }

    pub fn health(&self) -> ConnectionHealth {
        match self.consecutive_errors.load(Ordering::Relaxed) {
            0 => ConnectionHealth::Healthy,
            1..=2 => ConnectionHealth::Degraded,
            _ => ConnectionHealth::Unhealthy,
        }
    }

    /// Idempotent graceful shutdown: flips the running flag and closes the
    /// socket so a blocked read unblocks promptly.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.state_machine.close();
        }
    }

    /// Run the cooperative loop described in §4.3 until stopped or the
    /// session ends. Intended to run on its own `std::thread`.
    pub fn run(&self) {
        info!("[{}] connection handler starting ({})", self.instrument, self.remote_addr);
        while self.running.load(Ordering::SeqCst) {
            self.service_outbound_queue();

            match self.state_machine.try_receive_message() {
                Ok(Some(text)) => {
                    self.consecutive_errors.store(0, Ordering::Relaxed);
                    self.handle_received(text);
                }
                Ok(None) => {
                    if !self.state_machine.is_connected() {
                        info!("[{}] socket closed, terminating handler", self.instrument);
                        break;
                    }
                }
                Err(ProtocolError::StaleConnection) => {
                    info!("[{}] stale connection, terminating handler", self.instrument);
                    break;
                }
                Err(ProtocolError::LinkLost) => {
                    info!("[{}] link lost, terminating handler", self.instrument);
                    break;
                }
                Err(e) => {
                    warn!("[{}] receive error: {e}", self.instrument);
                    self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                }
            }

            std::thread::sleep(LOOP_IDLE_SLEEP);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("[{}] connection handler stopped", self.instrument);
    }

    fn service_outbound_queue(&self) {
        if self.state_machine.get_state() != State::Idle {
            return;
        }
        let Ok(msg) = self.outbound_rx.try_recv() else {
            return;
        };
        let text = match self.driver.build(&msg) {
            Ok(t) => t,
            Err(e) => {
                error!("[{}] failed to build outgoing message: {e}", self.instrument);
                return;
            }
        };
        debug!("[{}] sending queued outgoing message", self.instrument);
        if let Err(e) = self.state_machine.send_message(&text) {
            warn!("[{}] send_message failed: {e}", self.instrument);
            self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// §4.3 step 3: classify, persist raw, parse, and publish. Keep-alive
    /// text is logged and otherwise dropped, never persisted or published
    /// (§4.3 "Keep-alive handling on receive").
    fn handle_received(&self, text: String) {
        let message_type = classify(&text);
        if message_type == MessageType::KeepAlive {
            debug!("[{}] received keep-alive", self.instrument);
            return;
        }

        let ctx = InboundContext {
            instrument: self.instrument.clone(),
            remote_addr: Some(self.remote_addr.clone()),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
        };
        let store = Arc::clone(&self.store);
        let broker = Arc::clone(&self.broker);
        let driver = Arc::clone(&self.driver);
        self.runtime.block_on(async move {
            crate::pipeline::inbound::process(ctx, text, driver, store, broker).await
        });
    }
}
