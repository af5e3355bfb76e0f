//! The ASTM E1381 frame codec: §4.1.
//!
//! A frame is `<STX><FN><DATA><CR><TERM><C1><C2><CR><LF>` where `TERM` is
//! `ETX` on the last frame of a message and `ETB` otherwise, and `C1C2` is
//! the two-hex-uppercase modulo-256 checksum over `FN..TERM` inclusive.

use super::constants::{CR, ETB, ETX, LF, MAX_FRAME_DATA_LEN, MAX_FRAME_DATA_LEN_RECEIVE, STX};
use super::error::{ProtocolError, Result};

/// Build a frame from a sequence number, record text, and a last-frame flag.
///
/// `data` must not exceed [`MAX_FRAME_DATA_LEN`] bytes; callers are expected
/// to have already split the message into frame-sized chunks.
pub fn build_frame(fn_seq: u8, data: &[u8], is_last: bool) -> Result<Vec<u8>> {
    if data.len() > MAX_FRAME_DATA_LEN {
        return Err(ProtocolError::InvalidFrameFormat(format!(
            "frame data length {} exceeds max {}",
            data.len(),
            MAX_FRAME_DATA_LEN
        )));
    }

    let mut body = Vec::with_capacity(data.len() + 4);
    body.push(fn_digit(fn_seq));
    body.extend_from_slice(data);
    body.push(CR);
    body.push(if is_last { ETX } else { ETB });

    let checksum = checksum_of(&body);

    let mut frame = Vec::with_capacity(body.len() + 6);
    frame.push(STX);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(format!("{:02X}", checksum).as_bytes());
    frame.push(CR);
    frame.push(LF);
    Ok(frame)
}

/// Validate a raw received frame: minimum length, STX/CR/LF framing, and
/// checksum.
pub fn validate(raw: &[u8]) -> bool {
    if raw.len() < 8 || raw[0] != STX {
        return false;
    }
    if raw[raw.len() - 1] != LF || raw[raw.len() - 2] != CR {
        return false;
    }
    let checksum_bytes = &raw[raw.len() - 4..raw.len() - 2];
    let received = match parse_hex_checksum(checksum_bytes) {
        Some(v) => v,
        None => return false,
    };
    // checksum covers FN..TERM inclusive, i.e. everything between STX and the
    // checksum bytes.
    let covered = &raw[1..raw.len() - 4];
    checksum_of(covered) == received
}

/// Extract the record text between FN and TERM (exclusive of the trailing
/// `CR TERM C1 C2 CR LF`).
pub fn extract_data(raw: &[u8]) -> Vec<u8> {
    if raw.len() < 8 {
        return Vec::new();
    }
    let covered = &raw[1..raw.len() - 4];
    // covered is `FN DATA CR TERM`; strip FN (1 byte) and the trailing CR+TERM.
    if covered.len() < 3 {
        return Vec::new();
    }
    covered[1..covered.len() - 2].to_vec()
}

/// Extract the numeric frame sequence number, or -1 if not an ASCII digit.
pub fn extract_fn(raw: &[u8]) -> i32 {
    if raw.len() < 2 {
        return -1;
    }
    let b = raw[1];
    if b.is_ascii_digit() {
        (b - b'0') as i32
    } else {
        -1
    }
}

/// True when a received frame's `DATA` exceeds the receive-side tolerance
/// and SHOULD be NAK'd per §4.1.
pub fn exceeds_receive_limit(raw: &[u8]) -> bool {
    extract_data(raw).len() > MAX_FRAME_DATA_LEN_RECEIVE
}

fn fn_digit(fn_seq: u8) -> u8 {
    b'0' + (fn_seq % 8)
}

fn checksum_of(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    (sum % 256) as u8
}

fn parse_hex_checksum(bytes: &[u8]) -> Option<u8> {
    if bytes.len() != 2 {
        return None;
    }
    let s = std::str::from_utf8(bytes).ok()?;
    u8::from_str_radix(s, 16).ok()
}

/// Advance a frame sequence number: 1..7 then wraps 7→0→1 per §3.
pub fn next_fn(current: u8) -> u8 {
    if current == 7 {
        0
    } else {
        (current + 1) % 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_data() {
        let data = b"H|\\^&|||X|||||||P|LIS2-A|20240101000000";
        let frame = build_frame(1, data, true).unwrap();
        assert!(validate(&frame));
        assert_eq!(extract_data(&frame), data);
        assert_eq!(extract_fn(&frame), 1);
    }

    #[test]
    fn empty_data_is_preserved() {
        let frame = build_frame(2, b"", false).unwrap();
        assert!(validate(&frame));
        assert_eq!(extract_data(&frame), b"");
    }

    #[test]
    fn corrupted_checksum_fails_validation() {
        let mut frame = build_frame(1, b"H|abc", true).unwrap();
        let len = frame.len();
        frame[len - 3] = frame[len - 3].wrapping_add(1);
        assert!(!validate(&frame));
    }

    #[test]
    fn sequence_wraps_seven_to_zero() {
        assert_eq!(next_fn(7), 0);
        assert_eq!(next_fn(0), 1);
        assert_eq!(next_fn(6), 7);
    }

    #[test]
    fn frame_over_240_bytes_is_rejected_on_build() {
        let data = vec![b'A'; 241];
        assert!(build_frame(1, &data, true).is_err());
    }

    #[test]
    fn max_data_length_accepted() {
        let data = vec![b'A'; 240];
        let frame = build_frame(1, &data, true).unwrap();
        assert!(validate(&frame));
        assert_eq!(extract_data(&frame).len(), 240);
    }
}
