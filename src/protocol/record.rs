//! The generic E1394 record model: §3, §4.5.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};

use super::constants::{COMPONENT_DELIMITER, FIELD_DELIMITER, REPEAT_DELIMITER};

/// Parse an ASTM date/time field per §4.5: 8 digits (`yyyyMMdd`), 12
/// (`yyyyMMddHHmm`), or 14 (`yyyyMMddHHmmss`), interpreted in the local time
/// zone. Any other length, or a value that doesn't parse, yields `None`
/// ("parse failure leaves the field `null`").
pub fn parse_astm_datetime(raw: &str) -> Option<DateTime<Local>> {
    let naive = match raw.len() {
        8 => NaiveDate::parse_from_str(raw, "%Y%m%d")
            .ok()
            .map(|d| NaiveDateTime::new(d, NaiveTime::default())),
        12 => NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M").ok(),
        14 => NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S").ok(),
        _ => None,
    }?;
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Some(dt),
        chrono::LocalResult::Ambiguous(dt, _) => Some(dt),
        chrono::LocalResult::None => None,
    }
}

/// Emit a `DateTime` in the builder's 14-digit form (§4.5 "Dates are emitted
/// in 14-digit form").
pub fn format_astm_datetime(dt: &DateTime<Local>) -> String {
    dt.format("%Y%m%d%H%M%S").to_string()
}

/// One of the record types this core understands (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Header,
    Patient,
    Order,
    Result,
    SubResult,
    Query,
    Comment,
    Terminator,
}

impl RecordType {
    /// Dispatch on a record's first character, case-insensitively (§4.5).
    pub fn from_identifier(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'H' => Some(RecordType::Header),
            'P' => Some(RecordType::Patient),
            'O' => Some(RecordType::Order),
            'R' => Some(RecordType::Result),
            'M' => Some(RecordType::SubResult),
            'Q' => Some(RecordType::Query),
            'C' => Some(RecordType::Comment),
            'L' => Some(RecordType::Terminator),
            _ => None,
        }
    }

    pub fn identifier(&self) -> &'static str {
        match self {
            RecordType::Header => "H",
            RecordType::Patient => "P",
            RecordType::Order => "O",
            RecordType::Result => "R",
            RecordType::SubResult => "M",
            RecordType::Query => "Q",
            RecordType::Comment => "C",
            RecordType::Terminator => "L",
        }
    }
}

/// One `|`-delimited record. Fields are 0-indexed internally (field 0 is the
/// record type identifier itself); `get_field`/`set_field` take the 1-based
/// ASTM field numbers used throughout §4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub record_type: RecordType,
    fields: Vec<String>,
}

impl Record {
    pub fn new(record_type: RecordType) -> Self {
        Self {
            record_type,
            fields: vec![record_type.identifier().to_string()],
        }
    }

    /// Parse one `|`-delimited record line. A malformed (empty or
    /// unrecognized type) record is reported to the caller but never panics,
    /// per §4.5's "a malformed record does not abort the message".
    pub fn parse(line: &str) -> Option<Self> {
        if line.is_empty() {
            return None;
        }
        let record_type = RecordType::from_identifier(line.chars().next()?)?;
        let fields: Vec<String> = line.split(FIELD_DELIMITER as char).map(String::from).collect();
        Some(Self { record_type, fields })
    }

    /// Get a 1-based field. Field 0 (the type identifier) is not addressable
    /// through this accessor.
    pub fn get_field(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.fields.get(index).map(|s| s.as_str())
    }

    pub fn set_field(&mut self, index: usize, value: impl Into<String>) {
        if index == 0 {
            return;
        }
        if self.fields.len() <= index {
            self.fields.resize(index + 1, String::new());
        }
        self.fields[index] = value.into();
    }

    /// Components of a field, split on `^` (§3).
    pub fn components(&self, index: usize) -> Vec<&str> {
        self.get_field(index)
            .map(|f| f.split(COMPONENT_DELIMITER as char).collect())
            .unwrap_or_default()
    }

    /// Repeats of a field, split on `\` (§3).
    pub fn repeats(&self, index: usize) -> Vec<&str> {
        self.get_field(index)
            .map(|f| f.split(REPEAT_DELIMITER as char).collect())
            .unwrap_or_default()
    }

    /// Interpret a field as an ASTM date/time (§4.5). `None` both when the
    /// field is absent and when its contents don't match one of the three
    /// accepted lengths.
    pub fn get_date(&self, index: usize) -> Option<DateTime<Local>> {
        parse_astm_datetime(self.get_field(index)?)
    }

    /// Write a date/time field in the builder's 14-digit form (§4.5).
    pub fn set_date(&mut self, index: usize, dt: &DateTime<Local>) {
        self.set_field(index, format_astm_datetime(dt));
    }

    /// Encode back to a `|`-delimited line, padding missing intermediate
    /// fields with empty strings up to the last populated one (§4.5).
    pub fn encode(&self) -> String {
        let last_populated = self
            .fields
            .iter()
            .enumerate()
            .rev()
            .find(|(_, f)| !f.is_empty())
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.fields[..=last_populated.max(0)].join(&(FIELD_DELIMITER as char).to_string())
    }
}

pub fn join_components(parts: &[&str]) -> String {
    parts.join(&(COMPONENT_DELIMITER as char).to_string())
}

pub fn join_repeats(parts: &[&str]) -> String {
    parts.join(&(REPEAT_DELIMITER as char).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_sequence() {
        let r = Record::parse("R|1|^^^GLU|95|mg/dL|||F||||20240101000000|I1").unwrap();
        assert_eq!(r.get_field(1), Some("1"));
        assert_eq!(r.get_field(3), Some("95"));
        assert_eq!(r.components(2), vec!["", "", "", "GLU"]);
    }

    #[test]
    fn unknown_type_returns_none() {
        assert!(Record::parse("Z|1|foo").is_none());
    }

    #[test]
    fn encode_pads_missing_fields() {
        let mut r = Record::new(RecordType::Result);
        r.set_field(1, "1");
        r.set_field(3, "95");
        assert_eq!(r.encode(), "R|1||95");
    }

    #[test]
    fn parses_all_three_accepted_date_lengths() {
        assert!(parse_astm_datetime("20240101").is_some());
        assert!(parse_astm_datetime("202401011530").is_some());
        assert!(parse_astm_datetime("20240101153045").is_some());
    }

    #[test]
    fn rejects_unsupported_date_lengths_and_garbage() {
        assert!(parse_astm_datetime("2024").is_none());
        assert!(parse_astm_datetime("not-a-date").is_none());
    }

    #[test]
    fn record_get_date_round_trips_through_set_date() {
        let mut r = Record::new(RecordType::Result);
        let dt = parse_astm_datetime("20240101153045").unwrap();
        r.set_date(13, &dt);
        assert_eq!(r.get_field(13), Some("20240101153045"));
        assert_eq!(r.get_date(13), Some(dt));
    }
}
