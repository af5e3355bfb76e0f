//! The keep-alive coordinator: §4.9.
//!
//! New code (the teacher has no equivalent subsystem), styled like
//! `handler/meril_handler.rs`'s periodic event-emitting methods and built on
//! the same `FramingStateMachine` mutex the connection handler uses, so the
//! two never race over the socket (§5 "Mutual exclusion").

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};

use crate::protocol::FramingStateMachine;

/// Minimal synthetic header+terminator message, classified `KEEP_ALIVE` by
/// §4.6 (header and terminator only, no P/O/R/Q records).
fn build_keep_alive_text() -> String {
    let ts = Utc::now().format("%Y%m%d%H%M%S");
    format!("H|\\^&|||LIS^KeepAlive^1.0|||||||P|LIS2-A|{ts}\rL|1|N\r")
}

/// Per-instrument keep-alive ticker. Holds only a borrowed (`Arc`-shared)
/// reference to the handler's framing state machine — it never owns the
/// socket (§5 "Ownership").
pub struct KeepAliveCoordinator {
    instrument: String,
    state_machine: Arc<FramingStateMachine>,
    interval: Duration,
    consecutive_failures: AtomicU32,
}

impl KeepAliveCoordinator {
    /// `interval_minutes = 0` means keep-alive is disabled for this
    /// instrument; callers should not spawn [`run`](Self::run) in that case.
    pub fn new(instrument: String, state_machine: Arc<FramingStateMachine>, interval_minutes: u32) -> Option<Self> {
        if interval_minutes == 0 {
            return None;
        }
        Some(Self {
            instrument,
            state_machine,
            interval: Duration::from_secs(interval_minutes as u64 * 60),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    /// Three consecutive keep-alive failures are logged at `error` level and
    /// surfaced through [`Self::is_failing`] for the gateway's stats snapshot;
    /// the coordinator never tears down the connection itself — that remains
    /// the read-timeout's job (§4.2, §9 "Keep-alive failure").
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so we wait one full
        // interval before the first keep-alive probe.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.state_machine.is_connected() {
                info!("[{}] keep-alive stopping: connection closed", self.instrument);
                return;
            }
            self.send_one();
        }
    }

    fn send_one(&self) {
        let text = build_keep_alive_text();
        match self.state_machine.send_message(&text) {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= 3 {
                    error!("[{}] keep-alive failed {failures} times in a row: {e}", self.instrument);
                } else {
                    warn!("[{}] keep-alive send failed: {e}", self.instrument);
                }
            }
        }
    }

    pub fn is_failing(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_keep_alive_classified_message() {
        let text = build_keep_alive_text();
        assert_eq!(crate::protocol::classify(&text), crate::protocol::MessageType::KeepAlive);
    }

    #[test]
    fn zero_interval_disables_coordinator() {
        let stream_pair = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = stream_pair.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = stream_pair.accept().unwrap();
        let _client = client;
        let sm = Arc::new(FramingStateMachine::new(server).unwrap());
        assert!(KeepAliveCoordinator::new("X".to_string(), sm, 0).is_none());
    }
}
