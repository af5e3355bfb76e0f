//! The "Ortho Vision" reference vendor profile (§4.5): a table-driven field
//! map over the generic parser, not an additional code path.
//!
//! The source material disagrees on several field indices across variants
//! (e.g. specimen-collection datetime at O field 7 vs 8). Per the Open
//! Question in spec.md §9, this profile picks field 7, matching the
//! ASTM E1394 base standard's Order record layout, and keeps the mapping in
//! one table so a future profile variant is a data change, not a code change.

use super::error::Result;
use super::message::AstmMessage;
use super::vendor::{FieldAssignment, FieldMap, VendorDriver};

pub struct OrthoVisionDriver {
    fields: FieldMap,
}

impl Default for OrthoVisionDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl OrthoVisionDriver {
    pub fn new() -> Self {
        Self {
            fields: FieldMap {
                patient: vec![
                    FieldAssignment { name: "patient_id", field: 3 },
                    FieldAssignment { name: "name", field: 5 },
                    FieldAssignment { name: "birth_date", field: 7 },
                    FieldAssignment { name: "sex", field: 8 },
                    FieldAssignment { name: "attending_physician", field: 9 },
                    FieldAssignment { name: "address", field: 11 },
                ],
                order: vec![
                    FieldAssignment { name: "specimen_id", field: 3 },
                    FieldAssignment { name: "test_id", field: 5 },
                    FieldAssignment { name: "specimen_collection_datetime", field: 7 },
                    FieldAssignment { name: "priority", field: 6 },
                    FieldAssignment { name: "action_code", field: 12 },
                ],
                result: vec![
                    FieldAssignment { name: "test_id", field: 2 },
                    FieldAssignment { name: "value", field: 3 },
                    FieldAssignment { name: "units", field: 4 },
                    FieldAssignment { name: "reference_range", field: 5 },
                    FieldAssignment { name: "abnormal_flag", field: 6 },
                    FieldAssignment { name: "result_status", field: 8 },
                    FieldAssignment { name: "completed_datetime", field: 13 },
                    FieldAssignment { name: "instrument", field: 14 },
                ],
            },
        }
    }
}

impl VendorDriver for OrthoVisionDriver {
    fn parse(&self, raw_text: &str) -> Result<AstmMessage> {
        // The field layout only affects which semantic names resolve to
        // which indices (exposed via `driver_config_descriptor`); the
        // record/message structure itself is the generic one from §3/§4.5.
        Ok(AstmMessage::assemble(super::message::tokenize(raw_text)))
    }

    fn build(&self, message: &AstmMessage) -> Result<String> {
        Ok(message.build())
    }

    fn instrument_name(&self) -> &str {
        "Ortho Vision"
    }

    fn astm_version(&self) -> &str {
        "E1394-97"
    }

    fn supports(&self, raw: &str) -> bool {
        raw.contains("OrthoVision") || raw.contains("Vision")
    }

    fn driver_config_descriptor(&self) -> &FieldMap {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_map_resolves_specimen_collection_datetime_to_field_7() {
        let driver = OrthoVisionDriver::new();
        assert_eq!(driver.driver_config_descriptor().order_field("specimen_collection_datetime"), Some(7));
    }

    #[test]
    fn parses_a_full_message() {
        let driver = OrthoVisionDriver::new();
        let text = "H|\\^&|||X|||||||P|LIS2-A|20240101000000\rP|1||||DOE^J\rO|1|S1||\rR|1|^^^GLU|95|mg/dL|||F||||20240101000000|I1\rL|1|N\r";
        let msg = driver.parse(text).unwrap();
        assert_eq!(msg.result_count(), 1);
    }
}
