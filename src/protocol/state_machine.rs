//! The ASTM framing state machine: §4.2.
//!
//! A monitor: every operation that touches the socket is taken under the
//! same `parking_lot::Mutex`, so the keep-alive coordinator and the
//! connection handler's main loop never race over the wire (§5, §9
//! "Race between main loop and keep-alive").

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::constants::{
    ACK, ACK_TIMEOUT_SECS, ENQ, EOT, NAK, SOCKET_READ_TIMEOUT_SECS,
};
use super::error::{ProtocolError, Result};
use super::frame::{build_frame, exceeds_receive_limit, extract_data, extract_fn, next_fn, validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    WaitingForAck,
    Receiving,
    Transmitting,
    Error,
}

impl State {
    /// Upper-case label used in collision error messages (§4.8: `"Protocol
    /// busy: RECEIVING"`).
    pub fn label(&self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::WaitingForAck => "WAITING_FOR_ACK",
            State::Receiving => "RECEIVING",
            State::Transmitting => "TRANSMITTING",
            State::Error => "ERROR",
        }
    }

    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Idle,
            1 => State::WaitingForAck,
            2 => State::Receiving,
            3 => State::Transmitting,
            _ => State::Error,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            State::Idle => 0,
            State::WaitingForAck => 1,
            State::Receiving => 2,
            State::Transmitting => 3,
            State::Error => 4,
        }
    }
}

struct Inner {
    stream: TcpStream,
}

/// One per live connection. Owns the TCP stream exclusively; all reads and
/// writes on it happen through this type's methods, under its mutex. `state`
/// is tracked separately in an `AtomicU8` rather than inside `Inner` so that
/// `get_state`/`is_busy`/`is_connected` never block on the mutex a
/// multi-second `send_message`/`receive_message` call holds across its
/// blocking I/O. The collision detector in `OrderDispatcher` polls these
/// from an async task and must never stall on an in-flight protocol
/// exchange (§4.8, §5 "Mutual exclusion").
pub struct FramingStateMachine {
    inner: Mutex<Inner>,
    state: AtomicU8,
}

impl FramingStateMachine {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_read_timeout(Some(Duration::from_secs(SOCKET_READ_TIMEOUT_SECS)))?;
        Ok(Self {
            inner: Mutex::new(Inner { stream }),
            state: AtomicU8::new(State::Idle.to_u8()),
        })
    }

    pub fn get_state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn reset(&self) {
        self.set_state(State::Idle);
    }

    /// Force the monitor into a given state without touching the socket.
    /// Exposed for integration tests that need to simulate a collision
    /// (§8 S3: an order arriving while the handler is mid-session) without
    /// actually racing a second thread over the wire.
    pub fn force_state_for_test(&self, state: State) {
        self.set_state(state);
    }

    pub fn is_connected(&self) -> bool {
        self.get_state() != State::Error
    }

    pub fn close(&self) {
        let inner = self.inner.lock();
        let _ = inner.stream.shutdown(std::net::Shutdown::Both);
        self.set_state(State::Error);
    }

    /// Peek without consuming: true if at least one byte is already
    /// readable. Used by the connection handler to service its outbound
    /// queue between inbound messages without blocking on the socket's
    /// full read timeout (§9 "Non-blocking receive without busy waiting").
    fn has_pending_data(&self) -> Result<bool> {
        let inner = self.inner.lock();
        let mut buf = [0u8; 1];
        inner.stream.set_nonblocking(true)?;
        let result = match inner.stream.peek(&mut buf) {
            Ok(0) => Ok(true), // peer closed; let receive_message observe the close
            Ok(_) => Ok(true),
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(ProtocolError::Io(e)),
        };
        inner.stream.set_nonblocking(false)?;
        result
    }

    /// Non-blocking-at-the-handler-level wrapper around [`Self::receive_message`]:
    /// returns `Ok(None)` immediately when nothing is readable yet instead of
    /// blocking for the full socket read timeout, preserving that timeout as
    /// the sole stale-connection signal (§9).
    pub fn try_receive_message(&self) -> Result<Option<String>> {
        if !self.has_pending_data()? {
            return Ok(None);
        }
        self.receive_message()
    }

    /// Send a complete ASTM message: ENQ, then each frame awaiting ACK, then
    /// EOT. Splits `text` into frames of at most 240 bytes, preferring to
    /// break on a record boundary (CR) when one falls within the window.
    pub fn send_message(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        self.set_state(State::WaitingForAck);
        debug!("sending ENQ, awaiting ACK");

        write_byte(&mut inner.stream, ENQ)?;
        match read_one_with_timeout(&mut inner.stream, Duration::from_secs(ACK_TIMEOUT_SECS))? {
            Some(ACK) => {}
            Some(NAK) | Some(EOT) => {
                self.set_state(State::Idle);
                return Err(ProtocolError::PeerRefused("ENQ"));
            }
            Some(_) => {
                // any other byte while awaiting ENQ's ACK is treated like a refusal
                self.set_state(State::Idle);
                return Err(ProtocolError::PeerRefused("ENQ"));
            }
            None => {
                self.set_state(State::Error);
                return Err(ProtocolError::ProtocolTimeout("ACK after ENQ"));
            }
        }

        self.set_state(State::Transmitting);
        let chunks = split_into_frames(text);
        let mut fn_seq: u8 = 1;
        let total = chunks.len();
        for (idx, chunk) in chunks.iter().enumerate() {
            let is_last = idx + 1 == total;
            let frame = build_frame(fn_seq, chunk.as_bytes(), is_last)?;
            loop {
                inner.stream.write_all(&frame)?;
                match read_one_with_timeout(&mut inner.stream, Duration::from_secs(ACK_TIMEOUT_SECS))? {
                    Some(ACK) => break,
                    Some(NAK) => {
                        warn!("peer NAK'd frame {fn_seq}, retransmitting");
                        continue;
                    }
                    Some(_) => continue, // any other byte while awaiting ACK is ignored
                    None => {
                        self.set_state(State::Error);
                        return Err(ProtocolError::ProtocolTimeout("ACK after frame"));
                    }
                }
            }
            fn_seq = next_fn(fn_seq);
        }

        write_byte(&mut inner.stream, EOT)?;
        self.set_state(State::Idle);
        Ok(())
    }

    /// Receive one complete ASTM message. Blocks up to the socket read
    /// timeout for ENQ; returns `Ok(None)` on clean peer close, or
    /// `Err(StaleConnection)` on read timeout while idle (§4.2).
    pub fn receive_message(&self) -> Result<Option<String>> {
        let mut inner = self.inner.lock();

        match read_one(&mut inner.stream)? {
            None => return Ok(None), // peer closed cleanly
            Some(ENQ) => {}
            Some(_) => return Ok(None), // not an ENQ: nothing to receive this tick
        }

        debug!("received ENQ, sending ACK");
        write_byte(&mut inner.stream, ACK)?;
        self.set_state(State::Receiving);

        let mut expected_fn: u8 = 1;
        let mut accumulator = String::new();

        loop {
            let first = match read_one(&mut inner.stream)? {
                Some(b) => b,
                None => {
                    self.set_state(State::Error);
                    return Err(ProtocolError::LinkLost);
                }
            };

            if first == EOT {
                debug!("received EOT, message complete");
                self.set_state(State::Idle);
                return Ok(if accumulator.is_empty() { None } else { Some(accumulator) });
            }

            // first must be STX; read the rest of the frame up to and
            // including CR LF.
            let mut raw = vec![first];
            read_until_crlf(&mut inner.stream, &mut raw)?;

            if exceeds_receive_limit(&raw) {
                warn!("frame data exceeds receive limit, NAK");
                write_byte(&mut inner.stream, NAK)?;
                continue;
            }

            if !validate(&raw) {
                warn!("frame checksum mismatch, NAK");
                write_byte(&mut inner.stream, NAK)?;
                continue;
            }

            let fn_received = extract_fn(&raw);
            if fn_received < 0 || fn_received as u8 != expected_fn {
                warn!("frame sequence mismatch: expected {expected_fn}, got {fn_received}, NAK");
                write_byte(&mut inner.stream, NAK)?;
                continue;
            }

            let data = extract_data(&raw);
            accumulator.push_str(&String::from_utf8_lossy(&data));
            accumulator.push('\r');
            accumulator.push('\n');

            write_byte(&mut inner.stream, ACK)?;
            expected_fn = next_fn(expected_fn);
            trace!("accepted frame {fn_received}, expecting {expected_fn} next");
        }
    }
}

fn write_byte(stream: &mut TcpStream, b: u8) -> Result<()> {
    stream.write_all(&[b])?;
    Ok(())
}

/// Read exactly one byte, honoring the stream's configured read timeout.
/// Returns `Ok(None)` on clean EOF.
fn read_one(stream: &mut TcpStream) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if is_timeout(&e) => return Err(ProtocolError::StaleConnection),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
}

/// Read one byte with an explicit timeout shorter than the socket's
/// configured stale-connection timeout (used for ACK waits, §4.2).
fn read_one_with_timeout(stream: &mut TcpStream, timeout: Duration) -> Result<Option<u8>> {
    let previous = stream.read_timeout()?;
    stream.set_read_timeout(Some(timeout))?;
    let deadline = Instant::now() + timeout;
    let result = loop {
        let mut buf = [0u8; 1];
        match stream.read(&mut buf) {
            Ok(0) => break Ok(None),
            Ok(_) => break Ok(Some(buf[0])),
            Err(e) if is_timeout(&e) => break Err(ProtocolError::ProtocolTimeout("ACK")),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if Instant::now() >= deadline {
                    break Err(ProtocolError::ProtocolTimeout("ACK"));
                }
                continue;
            }
            Err(e) => break Err(ProtocolError::Io(e)),
        }
    };
    stream.set_read_timeout(previous)?;
    match result {
        Ok(v) => Ok(v),
        Err(ProtocolError::ProtocolTimeout(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Read bytes one at a time (honoring the stream's read timeout) until the
/// trailing CR LF of a frame has been consumed, appending to `raw`.
fn read_until_crlf(stream: &mut TcpStream, raw: &mut Vec<u8>) -> Result<()> {
    loop {
        let b = match read_one(stream)? {
            Some(b) => b,
            None => return Err(ProtocolError::LinkLost),
        };
        raw.push(b);
        if raw.len() >= 2 && raw[raw.len() - 2] == super::constants::CR && raw[raw.len() - 1] == super::constants::LF {
            return Ok(());
        }
    }
}

/// Split message text into ≤240-byte chunks, preferring to break at a CR
/// record boundary within the window but not requiring it (§4.2).
fn split_into_frames(text: &str) -> Vec<String> {
    const MAX: usize = super::constants::MAX_FRAME_DATA_LEN;
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return vec![String::new()];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let end = (start + MAX).min(bytes.len());
        let mut split_at = end;
        if end < bytes.len() {
            if let Some(pos) = bytes[start..end].iter().rposition(|&b| b == super::constants::CR) {
                if pos > 0 {
                    split_at = start + pos + 1;
                }
            }
        }
        chunks.push(String::from_utf8_lossy(&bytes[start..split_at]).into_owned());
        start = split_at;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn splits_respecting_max_length() {
        let text = "A".repeat(500);
        let chunks = split_into_frames(&text);
        assert!(chunks.iter().all(|c| c.len() <= 240));
        assert_eq!(chunks.concat().len(), 500);
    }

    #[test]
    fn one_frame_send_receive_round_trip() {
        let (server_stream, client_stream) = pair();
        let server = FramingStateMachine::new(server_stream).unwrap();

        let client_handle = thread::spawn(move || {
            let mut client_stream = client_stream;
            client_stream.write_all(&[ENQ]).unwrap();
            let mut ack = [0u8; 1];
            client_stream.read_exact(&mut ack).unwrap();
            assert_eq!(ack[0], ACK);

            let frame = build_frame(1, b"H|\\^&\r", true).unwrap();
            client_stream.write_all(&frame).unwrap();
            client_stream.read_exact(&mut ack).unwrap();
            assert_eq!(ack[0], ACK);

            client_stream.write_all(&[EOT]).unwrap();
        });

        let received = server.receive_message().unwrap();
        assert!(received.unwrap().starts_with("H|\\^&"));
        assert_eq!(server.get_state(), State::Idle);
        client_handle.join().unwrap();
    }

    #[test]
    fn clean_close_returns_none() {
        let (server_stream, client_stream) = pair();
        let server = FramingStateMachine::new(server_stream).unwrap();
        drop(client_stream);
        assert!(matches!(server.receive_message(), Ok(None)));
    }

    /// S2: a corrupted checksum draws a NAK without advancing the expected
    /// FN; retransmitting the same frame with a correct checksum succeeds.
    #[test]
    fn nak_then_retransmit_does_not_advance_sequence() {
        let (server_stream, mut client_stream) = pair();
        let server = FramingStateMachine::new(server_stream).unwrap();

        let server_thread = thread::spawn(move || server.receive_message());

        client_stream.write_all(&[ENQ]).unwrap();
        let mut ack = [0u8; 1];
        client_stream.read_exact(&mut ack).unwrap();
        assert_eq!(ack[0], ACK);

        let good_frame = build_frame(1, b"H|\\^&\r", true).unwrap();
        let mut corrupted = good_frame.clone();
        // Flip one checksum hex digit so validate() rejects it.
        let checksum_pos = corrupted.len() - 4;
        corrupted[checksum_pos] = if corrupted[checksum_pos] == b'0' { b'1' } else { b'0' };

        client_stream.write_all(&corrupted).unwrap();
        let mut resp = [0u8; 1];
        client_stream.read_exact(&mut resp).unwrap();
        assert_eq!(resp[0], NAK, "corrupted checksum should be NAK'd");

        client_stream.write_all(&good_frame).unwrap();
        client_stream.read_exact(&mut resp).unwrap();
        assert_eq!(resp[0], ACK, "retransmitted frame with FN unchanged should be ACK'd");

        client_stream.write_all(&[EOT]).unwrap();

        let received = server_thread.join().unwrap().unwrap();
        assert_eq!(received, Some("H|\\^&\r\n".to_string()));
    }
}
