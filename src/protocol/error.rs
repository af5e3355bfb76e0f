use std::io;
use thiserror::Error;

/// Errors surfaced by the frame codec and the framing state machine.
///
/// Per §7, only a small set of these ever escape the state machine: frame-level
/// faults (`FrameChecksumMismatch`, `FrameSequenceMismatch`) are handled
/// internally via NAK and never returned to the caller.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("frame checksum mismatch: expected {expected}, got {actual}")]
    FrameChecksumMismatch { expected: String, actual: String },

    #[error("frame sequence mismatch: expected {expected}, got {actual}")]
    FrameSequenceMismatch { expected: u8, actual: u8 },

    #[error("invalid frame format: {0}")]
    InvalidFrameFormat(String),

    #[error("invalid record format: {0}")]
    InvalidRecordFormat(String),

    #[error("protocol timeout waiting for {0}")]
    ProtocolTimeout(&'static str),

    #[error("link lost")]
    LinkLost,

    #[error("peer refused with {0}")]
    PeerRefused(&'static str),

    #[error("stale connection: no data within the read timeout")]
    StaleConnection,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
