//! Message classification by record-type presence: §4.6.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Result,
    Order,
    Query,
    KeepAlive,
    Unknown,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Result => "RESULT",
            MessageType::Order => "ORDER",
            MessageType::Query => "QUERY",
            MessageType::KeepAlive => "KEEP_ALIVE",
            MessageType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Classify raw reassembled message text by the record types it contains,
/// in the priority order given by §4.6.
pub fn classify(text: &str) -> MessageType {
    let has_h = contains_record(text, 'H');
    let has_l = contains_record(text, 'L');
    let has_p = contains_record(text, 'P');
    // §4.6's KEEP_ALIVE guard excludes only P, R, and O records, not M, so
    // it is tested against R alone, separately from the RESULT test below
    // (which also fires on a bare M record).
    let has_r_only = contains_record(text, 'R');
    let has_r = has_r_only || contains_record(text, 'M');
    let has_o = contains_record(text, 'O');
    let has_q = contains_record(text, 'Q');

    if has_h && has_l && !has_p && !has_r_only && !has_o {
        MessageType::KeepAlive
    } else if has_r {
        MessageType::Result
    } else if has_q {
        MessageType::Query
    } else if has_o {
        MessageType::Order
    } else {
        MessageType::Unknown
    }
}

fn contains_record(text: &str, type_char: char) -> bool {
    text.split(|c| c == '\r' || c == '\n')
        .any(|line| line.starts_with(type_char) && line.as_bytes().get(1) == Some(&b'|'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_header_and_terminator_only() {
        let text = "H|\\^&|||LIS^KeepAlive^1.0|||||||P|LIS2-A|20240101000000\r\nL|1|N\r\n";
        assert_eq!(classify(text), MessageType::KeepAlive);
    }

    #[test]
    fn result_wins_over_order() {
        let text = "H|\\^&\rP|1\rO|1|S1\rR|1|^^^GLU|95\rL|1|N\r";
        assert_eq!(classify(text), MessageType::Result);
    }

    #[test]
    fn order_only_is_order() {
        let text = "H|\\^&\rO|1|S1\rL|1|N\r";
        assert_eq!(classify(text), MessageType::Order);
    }

    #[test]
    fn query_only_is_query() {
        let text = "H|\\^&\rQ|1|^S1\rL|1|N\r";
        assert_eq!(classify(text), MessageType::Query);
    }

    #[test]
    fn header_and_terminator_only_with_no_other_records_is_keep_alive_not_unknown() {
        let text = "H|\\^&\rL|1|N\r";
        assert_eq!(classify(text), MessageType::KeepAlive);
    }

    /// §4.6's KEEP_ALIVE guard names only P, R, and O as exclusions; a bare
    /// M record (with no owning R) does not disqualify it.
    #[test]
    fn header_terminator_and_sub_result_only_is_keep_alive_not_result() {
        let text = "H|\\^&\rM|1|note\rL|1|N\r";
        assert_eq!(classify(text), MessageType::KeepAlive);
    }
}
