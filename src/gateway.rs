//! Top-level wiring: §2's data/control flow diagram assembled into one
//! object, grounded on `app_state.rs`'s `AppState` — a struct built once at
//! startup owning every long-lived collaborator and spawning their
//! background tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use crate::broker::{Broker, InMemoryBroker, LapinBroker};
use crate::config::GatewayConfig;
use crate::connection::Acceptor;
use crate::keepalive::KeepAliveCoordinator;
use crate::persistence::{PersistenceStore, SqliteStore};
use crate::pipeline::outbound::{new_handler_registry, run_order_intake, HandlerRegistry, OrderDispatcher};

const RETRY_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_BATCH_LIMIT: u32 = 50;
const PUBLISH_RETRY_BATCH_LIMIT: u32 = 50;

/// Owns every long-lived collaborator: the shared store, the broker, one
/// acceptor per enabled instrument, the order dispatcher, and every
/// instrument's keep-alive coordinator (spawned lazily once its handler
/// exists).
pub struct Gateway {
    config: GatewayConfig,
    store: Arc<dyn PersistenceStore>,
    broker: Arc<dyn Broker>,
    acceptors: Vec<Arc<Acceptor>>,
    dispatcher: Arc<OrderDispatcher>,
    handlers: HandlerRegistry,
}

impl Gateway {
    pub async fn initialize(config: GatewayConfig, runtime: tokio::runtime::Handle) -> Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;

        let database_url = config
            .database_url
            .clone()
            .unwrap_or_else(|| "sqlite://astm-lis-gateway.db".to_string());
        let store: Arc<dyn PersistenceStore> = Arc::new(
            SqliteStore::connect(&database_url)
                .await
                .context("failed to connect to persistence store")?,
        );

        let broker: Arc<dyn Broker> = if config.messaging_enabled {
            let broker_url = config
                .broker_url
                .clone()
                .context("messaging_enabled=true requires broker_url")?;
            Arc::new(
                LapinBroker::connect(&broker_url)
                    .await
                    .context("failed to connect to the LIS message bus")?,
            )
        } else {
            Arc::new(InMemoryBroker::new())
        };

        let handlers = new_handler_registry();
        let dispatcher = Arc::new(OrderDispatcher::new(Arc::clone(&store), Arc::clone(&handlers)));

        let mut acceptors = Vec::new();
        for instrument in config.instruments.iter().filter(|i| i.enabled) {
            let acceptor = Arc::new(Acceptor::bind(
                instrument.clone(),
                Arc::clone(&handlers),
                Arc::clone(&store),
                Arc::clone(&broker),
                runtime.clone(),
            )?);
            acceptors.push(acceptor);
        }

        Ok(Self {
            config,
            store,
            broker,
            acceptors,
            dispatcher,
            handlers,
        })
    }

    /// Spawn every acceptor on its own OS thread, the order intake/retry
    /// tasks, and the inbound publish-retry sweeper onto `runtime`. Returns
    /// once everything is running; callers block on a shutdown signal
    /// separately (§4.4 "Shutdown").
    pub fn run(&self, runtime: &tokio::runtime::Handle) {
        for acceptor in &self.acceptors {
            let acceptor = Arc::clone(acceptor);
            std::thread::spawn(move || acceptor.run());
        }

        for instrument in self.config.instruments.iter().filter(|i| i.enabled) {
            let dispatcher = Arc::clone(&self.dispatcher);
            let broker = Arc::clone(&self.broker);
            let instrument_name = instrument.name.clone();
            let queue = instrument.order_queue.clone();
            let max_retries = 5;
            runtime.spawn(run_order_intake(dispatcher, broker, instrument_name, queue, max_retries));
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        runtime.spawn(dispatcher.run_retry_loop(RETRY_INTERVAL, RETRY_BATCH_LIMIT));

        let store = Arc::clone(&self.store);
        let broker = Arc::clone(&self.broker);
        let exchange_map: std::collections::HashMap<String, (String, String)> = self
            .config
            .instruments
            .iter()
            .map(|i| (i.name.clone(), (i.exchange.clone(), i.routing_key.clone())))
            .collect();
        runtime.spawn(crate::pipeline::inbound::run_publish_retry_task(
            store,
            broker,
            move |instrument| exchange_map.get(instrument).cloned().unwrap_or_default(),
            PUBLISH_RETRY_BATCH_LIMIT,
            RETRY_INTERVAL,
        ));

        info!(
            "gateway running: {} instrument(s) enabled",
            self.acceptors.len()
        );
    }

    /// Graceful shutdown (§4.4): stop every acceptor so `accept()` unblocks
    /// within `ACCEPT_TIMEOUT_SECS`, then tell every live handler to stop
    /// (closing its socket so a blocked `receive_message` unblocks). Each
    /// handler's own thread observes the running flag and exits; joining
    /// those threads with a bounded timeout is the caller's job (the pool
    /// a handler thread runs on is `std::thread`, not tracked here).
    /// Background tasks on `runtime` are left to the caller to abort when
    /// the runtime itself is shut down.
    pub fn shutdown(&self) {
        for acceptor in &self.acceptors {
            acceptor.stop();
        }
        for entry in self.handlers.iter() {
            entry.value().stop();
        }
    }
}

/// Build a [`KeepAliveCoordinator`] for a freshly accepted session, honoring
/// `keep_alive_interval_minutes == 0` meaning "disabled" (§4.9, §9 Open
/// Question: immutable after startup).
pub fn spawn_keep_alive(
    runtime: &tokio::runtime::Handle,
    instrument: String,
    state_machine: Arc<crate::protocol::FramingStateMachine>,
    interval_minutes: u32,
) {
    if let Some(coordinator) = KeepAliveCoordinator::new(instrument, state_machine, interval_minutes) {
        runtime.spawn(Arc::new(coordinator).run());
    }
}
