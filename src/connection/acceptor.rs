//! The per-instrument TCP acceptor: §4.4.
//!
//! Grounded on `service/machine/meril_machine_service.rs`'s
//! `run_tcp_server` non-blocking-accept-and-sleep loop, generalized from one
//! fixed listener to one acceptor per configured instrument and from an
//! unconditional `thread::spawn` per connection to single-active-session
//! enforcement via the live-handlers map.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use socket2::{Domain, Socket, Type};

use crate::broker::Broker;
use crate::config::InstrumentConfig;
use crate::connection::handler::ConnectionHandler;
use crate::persistence::PersistenceStore;
use crate::pipeline::outbound::HandlerRegistry;
use crate::protocol::vendor::driver_for_identifier;

/// Owns one instrument's listening socket and enforces single-active-session
/// (§5 "Ownership": "there is at most one live handler per instrument").
pub struct Acceptor {
    config: InstrumentConfig,
    listener: StdTcpListener,
    handlers: HandlerRegistry,
    store: Arc<dyn PersistenceStore>,
    broker: Arc<dyn Broker>,
    runtime: tokio::runtime::Handle,
    running: Arc<AtomicBool>,
}

impl Acceptor {
    pub fn bind(
        config: InstrumentConfig,
        handlers: HandlerRegistry,
        store: Arc<dyn PersistenceStore>,
        broker: Arc<dyn Broker>,
        runtime: tokio::runtime::Handle,
    ) -> std::io::Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad port: {e}"))
        })?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        let listener: StdTcpListener = socket.into();

        info!("[{}] listening on {addr}", config.name);
        Ok(Self {
            config,
            listener,
            handlers,
            store,
            broker,
            runtime,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// The bound local address, including the OS-assigned port when
    /// `config.port == 0`. Exposed for tests that need an ephemeral port.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocking accept loop: intended to run on its own `std::thread`, one
    /// per configured instrument, mirroring `run_tcp_server`'s shape.
    pub fn run(&self) {
        let accept_poll = Duration::from_secs(crate::protocol::constants::ACCEPT_TIMEOUT_SECS);
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => self.on_accept(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(accept_poll);
                }
                Err(e) => {
                    error!("[{}] accept() failed: {e}", self.config.name);
                    std::thread::sleep(accept_poll);
                }
            }
        }
        info!("[{}] acceptor stopped", self.config.name);
    }

    fn on_accept(&self, stream: std::net::TcpStream, peer: SocketAddr) {
        // Single-active-session: an existing live handler for this
        // instrument means a second session is refused outright (S6).
        if self.handlers.contains_key(&self.config.name) {
            warn!(
                "[{}] refusing session from {peer}: instrument already has a live session",
                self.config.name
            );
            drop(stream);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!("[{}] failed to set TCP_NODELAY for {peer}: {e}", self.config.name);
        }
        let stream = {
            let socket = Socket::from(stream);
            if let Err(e) = socket.set_keepalive(true) {
                warn!("[{}] failed to set SO_KEEPALIVE for {peer}: {e}", self.config.name);
            }
            std::net::TcpStream::from(socket)
        };

        let driver = driver_for_identifier(&self.config.driver_identifier, &self.config.name);
        let handler = match ConnectionHandler::new(
            self.config.name.clone(),
            stream,
            driver,
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            self.runtime.clone(),
            self.config.exchange.clone(),
            self.config.routing_key.clone(),
        ) {
            Ok(h) => Arc::new(h),
            Err(e) => {
                error!("[{}] failed to initialize handler for {peer}: {e}", self.config.name);
                return;
            }
        };

        // Atomic put-if-absent: `entry` under the map's internal shard lock
        // avoids a second acceptor thread racing between the `contains_key`
        // check above and this insert for the same instrument (§5).
        use dashmap::mapref::entry::Entry;
        match self.handlers.entry(self.config.name.clone()) {
            Entry::Occupied(_) => {
                warn!("[{}] lost the race to register session {peer}", self.config.name);
                handler.stop();
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handler));
            }
        }

        info!("[{}] accepted session from {peer}", self.config.name);
        crate::gateway::spawn_keep_alive(
            &self.runtime,
            self.config.name.clone(),
            handler.state_machine(),
            self.config.keep_alive_interval_minutes,
        );

        let instrument = self.config.name.clone();
        let handlers = Arc::clone(&self.handlers);
        std::thread::spawn(move || {
            handler.run();
            handlers.remove(&instrument);
            info!("[{instrument}] session from {peer} ended, slot freed");
        });
    }
}
