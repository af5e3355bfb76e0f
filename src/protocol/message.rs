//! The `AstmMessage` aggregate: §3.
//!
//! One header, zero-or-more patients, each followed by zero-or-more orders,
//! each followed by zero-or-more results, each of which owns zero-or-more
//! sub-results, plus zero-or-more queries and exactly one terminator.

use serde::{Deserialize, Serialize};

use super::constants::{CR, LF};
use super::record::{Record, RecordType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub record: Record,
    pub sub_results: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub record: Record,
    pub results: Vec<ResultRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub record: Record,
    pub orders: Vec<OrderRecord>,
}

/// A fully reassembled, structurally parsed ASTM message. This is also the
/// wire envelope for outbound orders arriving from the LIS bus (§6: "JSON
/// encoding of `AstmMessage`").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AstmMessage {
    pub header: Option<Record>,
    pub patients: Vec<PatientRecord>,
    pub queries: Vec<Record>,
    pub terminator: Option<Record>,
    /// Orders/results/queries seen before any `P` record — some instruments
    /// emit order-only or query-only messages with no patient context.
    pub orphan_orders: Vec<OrderRecord>,
}

impl AstmMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokenize `text` into records (split on CR or LF) and assemble the
    /// nesting described in §3: O records reset R sequence numbers, R
    /// records reset M sequence numbers, and an R's trailing M records
    /// attach to it until the next R/O/L (§4.5).
    pub fn assemble(records: Vec<Record>) -> Self {
        let mut msg = AstmMessage::new();
        let mut current_patient: Option<PatientRecord> = None;
        let mut current_order: Option<OrderRecord> = None;
        let mut current_result: Option<ResultRecord> = None;

        macro_rules! flush_result {
            () => {
                if let Some(result) = current_result.take() {
                    if let Some(order) = current_order.as_mut() {
                        order.results.push(result);
                    } else if let Some(order) = msg.orphan_orders.last_mut() {
                        order.results.push(result);
                    }
                }
            };
        }
        macro_rules! flush_order {
            () => {
                flush_result!();
                if let Some(order) = current_order.take() {
                    if let Some(patient) = current_patient.as_mut() {
                        patient.orders.push(order);
                    } else {
                        msg.orphan_orders.push(order);
                    }
                }
            };
        }
        macro_rules! flush_patient {
            () => {
                flush_order!();
                if let Some(patient) = current_patient.take() {
                    msg.patients.push(patient);
                }
            };
        }

        for record in records {
            match record.record_type {
                RecordType::Header => {
                    msg.header = Some(record);
                }
                RecordType::Patient => {
                    flush_patient!();
                    current_patient = Some(PatientRecord {
                        record,
                        orders: Vec::new(),
                    });
                }
                RecordType::Order => {
                    flush_order!();
                    current_order = Some(OrderRecord {
                        record,
                        results: Vec::new(),
                    });
                }
                RecordType::Result => {
                    flush_result!();
                    current_result = Some(ResultRecord {
                        record,
                        sub_results: Vec::new(),
                    });
                }
                RecordType::SubResult => {
                    if let Some(result) = current_result.as_mut() {
                        result.sub_results.push(record);
                    }
                }
                RecordType::Query => {
                    flush_result!();
                    msg.queries.push(record);
                }
                RecordType::Comment => {
                    // Comments attach to whatever is open; the generic model
                    // has no dedicated slot for them (logged and skipped).
                }
                RecordType::Terminator => {
                    flush_patient!();
                    msg.terminator = Some(record);
                }
            }
        }
        flush_patient!();
        msg
    }

    pub fn result_count(&self) -> usize {
        let nested: usize = self
            .patients
            .iter()
            .flat_map(|p| &p.orders)
            .map(|o| o.results.len())
            .sum();
        let orphan: usize = self.orphan_orders.iter().map(|o| o.results.len()).sum();
        nested + orphan
    }

    pub fn order_count(&self) -> usize {
        let nested: usize = self.patients.iter().map(|p| p.orders.len()).sum();
        nested + self.orphan_orders.len()
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Serialize back to `\r\n`-separated record lines per §4.5's builder
    /// contract (numeric sequence fields as decimal, dates in 14-digit form
    /// handled by the caller before `set_field`).
    pub fn build(&self) -> String {
        let mut out = String::new();
        if let Some(h) = &self.header {
            out.push_str(&h.encode());
            out.push_str("\r\n");
        }
        for patient in &self.patients {
            append_patient(&mut out, patient);
        }
        for order in &self.orphan_orders {
            append_order(&mut out, order);
        }
        for q in &self.queries {
            out.push_str(&q.encode());
            out.push_str("\r\n");
        }
        if let Some(l) = &self.terminator {
            out.push_str(&l.encode());
            out.push_str("\r\n");
        }
        out
    }
}

fn append_patient(out: &mut String, patient: &PatientRecord) {
    out.push_str(&patient.record.encode());
    out.push_str("\r\n");
    for order in &patient.orders {
        append_order(out, order);
    }
}

fn append_order(out: &mut String, order: &OrderRecord) {
    out.push_str(&order.record.encode());
    out.push_str("\r\n");
    for result in &order.results {
        out.push_str(&result.record.encode());
        out.push_str("\r\n");
        for sub in &result.sub_results {
            out.push_str(&sub.encode());
            out.push_str("\r\n");
        }
    }
}

/// Split reassembled message text into records on CR or LF, dropping empty
/// segments, per §4.5.
pub fn tokenize(text: &str) -> Vec<Record> {
    text.split(|c| c == CR as char || c == LF as char)
        .filter(|s| !s.is_empty())
        .filter_map(Record::parse)
        .collect()
}
