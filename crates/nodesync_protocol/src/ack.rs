//! Batch acknowledgments and their line-oriented text format.
//!
//! ## Format
//!
//! The ack stream has one line per batch:
//!
//! ```text
//! <batchId>,OK
//! <batchId>,IG
//! <batchId>,ER[,<errorLine>]
//! ```
//!
//! The optional extended stream carries statistics and diagnostics:
//!
//! ```text
//! <batchId>,<byteCount>,<networkMillis>,<filterMillis>,<databaseMillis>,<sqlState>,<sqlCode>,<sqlMessage>
//! ```
//!
//! The sql message is the rest of the line and may contain commas.

use crate::batch::{Batch, BatchId, BatchStatus};
use std::collections::HashMap;
use std::fmt::Write;

/// A receiver's report about one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAck {
    /// Batch id.
    pub batch_id: BatchId,
    /// Node that sent the ack (the receiver of the batch).
    pub node_id: String,
    /// Whether the batch loaded.
    pub is_ok: bool,
    /// Whether the receiver ignored the batch.
    pub is_ignored: bool,
    /// Failed row within the batch (1-based, 0 if unknown).
    pub error_line: u64,
    /// SQL state of the failure.
    pub sql_state: Option<String>,
    /// SQL code of the failure.
    pub sql_code: i32,
    /// Message of the failure.
    pub sql_message: Option<String>,
    /// Bytes received.
    pub byte_count: u64,
    /// Network time.
    pub network_millis: u64,
    /// Filter time.
    pub filter_millis: u64,
    /// Database time.
    pub database_millis: u64,
}

impl BatchAck {
    /// Creates a successful ack.
    pub fn ok(batch_id: BatchId, node_id: impl Into<String>) -> Self {
        Self {
            batch_id,
            node_id: node_id.into(),
            is_ok: true,
            is_ignored: false,
            error_line: 0,
            sql_state: None,
            sql_code: 0,
            sql_message: None,
            byte_count: 0,
            network_millis: 0,
            filter_millis: 0,
            database_millis: 0,
        }
    }

    /// Creates an ack for an ignored batch.
    pub fn ignored(batch_id: BatchId, node_id: impl Into<String>) -> Self {
        Self {
            is_ignored: true,
            ..Self::ok(batch_id, node_id)
        }
    }

    /// Creates an error ack.
    pub fn error(batch_id: BatchId, node_id: impl Into<String>, error_line: u64) -> Self {
        Self {
            is_ok: false,
            error_line,
            ..Self::ok(batch_id, node_id)
        }
    }

    /// Builds the ack a receiver reports for an incoming ledger row.
    ///
    /// `acking_node` is the receiver's own id. Returns `None` while the batch
    /// is still loading.
    pub fn from_incoming(batch: &Batch, acking_node: &str) -> Option<Self> {
        let mut ack = match batch.status {
            BatchStatus::Ok => Self::ok(batch.batch_id, acking_node),
            BatchStatus::Ignored => Self::ignored(batch.batch_id, acking_node),
            BatchStatus::Error => {
                let mut ack = Self::error(batch.batch_id, acking_node, batch.failed_row_number);
                ack.sql_state = batch.sql_state.clone();
                ack.sql_code = batch.sql_code;
                ack.sql_message = batch.sql_message.clone();
                ack
            }
            _ => return None,
        };
        ack.byte_count = batch.byte_count;
        ack.network_millis = batch.network_millis;
        ack.filter_millis = batch.filter_millis;
        ack.database_millis = batch.database_millis;
        Some(ack)
    }

    fn status_code(&self) -> &'static str {
        if !self.is_ok {
            "ER"
        } else if self.is_ignored {
            "IG"
        } else {
            "OK"
        }
    }
}

/// Result of parsing an ack stream.
#[derive(Debug, Clone, Default)]
pub struct ParsedAcks {
    /// Acks in the order they appeared.
    pub acks: Vec<BatchAck>,
    /// Non-blank lines that could not be parsed.
    pub unexpected: Vec<String>,
}

/// Encodes acks into the ack stream and the extended stream.
pub fn encode_acks(acks: &[BatchAck]) -> (String, String) {
    let mut lines = String::new();
    let mut extended = String::new();
    for ack in acks {
        if ack.is_ok {
            let _ = writeln!(lines, "{},{}", ack.batch_id, ack.status_code());
        } else {
            let _ = writeln!(lines, "{},ER,{}", ack.batch_id, ack.error_line);
        }
        let message = ack
            .sql_message
            .as_deref()
            .unwrap_or("")
            .replace(['\r', '\n'], " ");
        let _ = writeln!(
            extended,
            "{},{},{},{},{},{},{},{}",
            ack.batch_id,
            ack.byte_count,
            ack.network_millis,
            ack.filter_millis,
            ack.database_millis,
            ack.sql_state.as_deref().unwrap_or(""),
            ack.sql_code,
            message
        );
    }
    (lines, extended)
}

/// Parses an ack stream, merging in the extended stream when present.
///
/// `node_id` is the node the acks came from. Lines that are neither blank nor
/// parseable are returned in [`ParsedAcks::unexpected`] for the caller to log.
pub fn parse_acks(node_id: &str, ack_text: &str, extended_text: Option<&str>) -> ParsedAcks {
    let mut parsed = ParsedAcks::default();

    for line in ack_text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_ack_line(node_id, line) {
            Some(ack) => parsed.acks.push(ack),
            None => parsed.unexpected.push(line.to_string()),
        }
    }

    if let Some(extended_text) = extended_text {
        let mut details = HashMap::new();
        for line in extended_text.lines().filter(|l| !l.trim().is_empty()) {
            match parse_extended_line(line) {
                Some(detail) => {
                    details.insert(detail.batch_id, detail);
                }
                None => parsed.unexpected.push(line.to_string()),
            }
        }
        for ack in &mut parsed.acks {
            if let Some(detail) = details.remove(&ack.batch_id) {
                detail.apply(ack);
            }
        }
    }

    parsed
}

fn parse_ack_line(node_id: &str, line: &str) -> Option<BatchAck> {
    let mut fields = line.split(',').map(str::trim);
    let batch_id = fields.next()?.parse::<BatchId>().ok()?;
    let ack = match fields.next()? {
        "OK" => BatchAck::ok(batch_id, node_id),
        "IG" => BatchAck::ignored(batch_id, node_id),
        "ER" => {
            let error_line = match fields.next() {
                Some(value) if !value.is_empty() => value.parse().ok()?,
                _ => 0,
            };
            BatchAck::error(batch_id, node_id, error_line)
        }
        _ => return None,
    };
    if fields.next().is_some() {
        return None;
    }
    Some(ack)
}

struct ExtendedDetail {
    batch_id: BatchId,
    byte_count: u64,
    network_millis: u64,
    filter_millis: u64,
    database_millis: u64,
    sql_state: Option<String>,
    sql_code: i32,
    sql_message: Option<String>,
}

impl ExtendedDetail {
    fn apply(self, ack: &mut BatchAck) {
        ack.byte_count = self.byte_count;
        ack.network_millis = self.network_millis;
        ack.filter_millis = self.filter_millis;
        ack.database_millis = self.database_millis;
        if !ack.is_ok {
            ack.sql_state = self.sql_state;
            ack.sql_code = self.sql_code;
            ack.sql_message = self.sql_message;
        }
    }
}

fn parse_extended_line(line: &str) -> Option<ExtendedDetail> {
    let mut fields = line.splitn(8, ',');
    let batch_id = fields.next()?.trim().parse().ok()?;
    let byte_count = fields.next()?.trim().parse().ok()?;
    let network_millis = fields.next()?.trim().parse().ok()?;
    let filter_millis = fields.next()?.trim().parse().ok()?;
    let database_millis = fields.next()?.trim().parse().ok()?;
    let sql_state = Some(fields.next()?.trim().to_string()).filter(|s| !s.is_empty());
    let sql_code = fields.next()?.trim().parse().ok()?;
    let sql_message = fields
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Some(ExtendedDetail {
        batch_id,
        byte_count,
        network_millis,
        filter_millis,
        database_millis,
        sql_state,
        sql_code,
        sql_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_stream() {
        let parsed = parse_acks("N2", "1001,ER\n1002,OK\n1003,IG\n", None);
        assert!(parsed.unexpected.is_empty());
        assert_eq!(parsed.acks.len(), 3);
        assert!(!parsed.acks[0].is_ok);
        assert_eq!(parsed.acks[0].error_line, 0);
        assert!(parsed.acks[1].is_ok && !parsed.acks[1].is_ignored);
        assert!(parsed.acks[2].is_ok && parsed.acks[2].is_ignored);
        assert_eq!(parsed.acks[2].node_id, "N2");
    }

    #[test]
    fn unexpected_lines_are_collected() {
        let parsed = parse_acks("N2", "1001,OK\n\n  \nHTTP/1.1 500\n1002,XX\n", None);
        assert_eq!(parsed.acks.len(), 1);
        assert_eq!(parsed.unexpected, vec!["HTTP/1.1 500", "1002,XX"]);
    }

    #[test]
    fn extended_stream_carries_diagnostics() {
        let mut ack = BatchAck::error(7, "N2", 3);
        ack.sql_state = Some("23505".into());
        ack.sql_code = -803;
        ack.sql_message = Some("duplicate key, table orders\nline two".into());
        ack.byte_count = 400;
        ack.database_millis = 12;

        let (lines, extended) = encode_acks(&[ack, BatchAck::ok(8, "N2")]);
        assert_eq!(lines, "7,ER,3\n8,OK\n");

        let parsed = parse_acks("N2", &lines, Some(&extended));
        assert!(parsed.unexpected.is_empty());
        let first = &parsed.acks[0];
        assert_eq!(first.error_line, 3);
        assert_eq!(first.sql_state.as_deref(), Some("23505"));
        assert_eq!(first.sql_code, -803);
        assert_eq!(
            first.sql_message.as_deref(),
            Some("duplicate key, table orders line two")
        );
        assert_eq!(first.byte_count, 400);
        assert_eq!(first.database_millis, 12);
        assert!(parsed.acks[1].sql_state.is_none());
    }

    #[test]
    fn ack_from_incoming_row() {
        let mut batch = Batch::new(5, "N1", "default", BatchStatus::Loading);
        assert!(BatchAck::from_incoming(&batch, "N2").is_none());

        batch.status = BatchStatus::Error;
        batch.failed_row_number = 4;
        let ack = BatchAck::from_incoming(&batch, "N2").unwrap();
        assert!(!ack.is_ok);
        assert_eq!(ack.error_line, 4);
        assert_eq!(ack.node_id, "N2");

        batch.status = BatchStatus::Ignored;
        assert!(BatchAck::from_incoming(&batch, "N2").unwrap().is_ignored);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn every_line_is_an_ack_or_unexpected(lines in prop::collection::vec("[0-9A-Z, ]{0,12}", 0..20)) {
                let text = lines.join("\n");
                let parsed = parse_acks("N2", &text, None);
                let non_blank = lines.iter().filter(|l| !l.trim().is_empty()).count();
                prop_assert_eq!(parsed.acks.len() + parsed.unexpected.len(), non_blank);
            }
        }
    }
}
