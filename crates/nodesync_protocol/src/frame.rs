//! Staged payload frames.
//!
//! A staged batch is a sequence of JSON objects, one per line:
//!
//! ```text
//! {"frame":"batch","batch_id":1001,"source_node_id":"N1","channel_id":"default","load_id":null,"ignored":false}
//! {"frame":"table","name":"orders"}
//! {"frame":"row","data_id":77,"event":"I","data":["1","widget"],"old_data":null}
//! {"frame":"commit","batch_id":1001}
//! ```
//!
//! A push session concatenates several staged batches back-to-back.

use crate::batch::BatchId;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Kind of captured change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataEventType {
    /// Row inserted.
    #[serde(rename = "I")]
    Insert,
    /// Row updated.
    #[serde(rename = "U")]
    Update,
    /// Row deleted.
    #[serde(rename = "D")]
    Delete,
}

/// One captured change as supplied by the capture reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRow {
    /// Capture id.
    pub data_id: u64,
    /// Table the row belongs to.
    pub table: String,
    /// Change kind.
    pub event: DataEventType,
    /// Column values after the change.
    pub data: Vec<Option<String>>,
    /// Column values before the change.
    pub old_data: Option<Vec<Option<String>>>,
}

impl CaptureRow {
    /// Creates an insert row.
    pub fn insert(data_id: u64, table: impl Into<String>, data: Vec<Option<String>>) -> Self {
        Self {
            data_id,
            table: table.into(),
            event: DataEventType::Insert,
            data,
            old_data: None,
        }
    }
}

/// One line of a staged payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Starts a batch.
    Batch {
        /// Batch id.
        batch_id: BatchId,
        /// Node that produced the batch.
        source_node_id: String,
        /// Channel.
        channel_id: String,
        /// Load the batch belongs to.
        load_id: Option<u64>,
        /// Marker for a batch the sender ignored; carries no rows.
        ignored: bool,
    },
    /// Switches the current table.
    Table {
        /// Table name.
        name: String,
    },
    /// A row of the current table.
    Row {
        /// Capture id.
        data_id: u64,
        /// Change kind.
        event: DataEventType,
        /// Values after the change.
        data: Vec<Option<String>>,
        /// Values before the change.
        old_data: Option<Vec<Option<String>>>,
    },
    /// Ends a batch.
    Commit {
        /// Batch id.
        batch_id: BatchId,
    },
}

impl Frame {
    /// Encodes the frame as one newline-terminated line.
    pub fn encode_line(&self) -> ProtocolResult<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// A decoded batch from a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPayload {
    /// Batch id.
    pub batch_id: BatchId,
    /// Node that produced the batch.
    pub source_node_id: String,
    /// Channel.
    pub channel_id: String,
    /// Load id.
    pub load_id: Option<u64>,
    /// Whether the sender ignored the batch.
    pub ignored: bool,
    /// Rows in order, with their table filled in.
    pub rows: Vec<CaptureRow>,
}

/// Decodes a payload of one or more staged batches.
pub fn decode_payload(bytes: &[u8]) -> ProtocolResult<Vec<BatchPayload>> {
    let text = std::str::from_utf8(bytes).map_err(|e| ProtocolError::MalformedFrame {
        line: 0,
        message: e.to_string(),
    })?;

    let mut batches = Vec::new();
    let mut current: Option<BatchPayload> = None;
    let mut table: Option<String> = None;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let frame: Frame =
            serde_json::from_str(line).map_err(|e| ProtocolError::MalformedFrame {
                line: line_no,
                message: e.to_string(),
            })?;

        match frame {
            Frame::Batch {
                batch_id,
                source_node_id,
                channel_id,
                load_id,
                ignored,
            } => {
                if let Some(open) = &current {
                    return Err(ProtocolError::UnexpectedFrame {
                        line: line_no,
                        message: format!("batch {} started before {} committed", batch_id, open.batch_id),
                    });
                }
                table = None;
                current = Some(BatchPayload {
                    batch_id,
                    source_node_id,
                    channel_id,
                    load_id,
                    ignored,
                    rows: Vec::new(),
                });
            }
            Frame::Table { name } => {
                if current.is_none() {
                    return Err(unexpected(line_no, "table outside of a batch"));
                }
                table = Some(name);
            }
            Frame::Row {
                data_id,
                event,
                data,
                old_data,
            } => {
                let (Some(batch), Some(table)) = (current.as_mut(), table.as_ref()) else {
                    return Err(unexpected(line_no, "row outside of a table"));
                };
                batch.rows.push(CaptureRow {
                    data_id,
                    table: table.clone(),
                    event,
                    data,
                    old_data,
                });
            }
            Frame::Commit { batch_id } => match current.take() {
                Some(batch) if batch.batch_id == batch_id => batches.push(batch),
                _ => return Err(unexpected(line_no, "commit does not match the open batch")),
            },
        }
    }

    if let Some(open) = current {
        return Err(ProtocolError::UnexpectedFrame {
            line: text.lines().count(),
            message: format!("batch {} was not committed", open.batch_id),
        });
    }
    Ok(batches)
}

/// Rewrites a staged batch under another batch id and load, keeping its rows.
pub fn renumber_payload(
    bytes: &[u8],
    batch_id: BatchId,
    load_id: Option<u64>,
) -> ProtocolResult<Vec<u8>> {
    let text = std::str::from_utf8(bytes).map_err(|e| ProtocolError::MalformedFrame {
        line: 0,
        message: e.to_string(),
    })?;
    let mut out = Vec::with_capacity(bytes.len());
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut frame: Frame =
            serde_json::from_str(line).map_err(|e| ProtocolError::MalformedFrame {
                line: index + 1,
                message: e.to_string(),
            })?;
        match &mut frame {
            Frame::Batch {
                batch_id: id,
                load_id: load,
                ..
            } => {
                *id = batch_id;
                *load = load_id;
            }
            Frame::Commit { batch_id: id } => *id = batch_id,
            Frame::Table { .. } | Frame::Row { .. } => {}
        }
        out.extend(frame.encode_line()?);
    }
    Ok(out)
}

fn unexpected(line: usize, message: &str) -> ProtocolError {
    ProtocolError::UnexpectedFrame {
        line,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(batch_id: BatchId, rows: &[(&str, u64)]) -> Vec<u8> {
        let mut out = Frame::Batch {
            batch_id,
            source_node_id: "N1".into(),
            channel_id: "default".into(),
            load_id: None,
            ignored: false,
        }
        .encode_line()
        .unwrap();
        let mut table = "";
        for (name, data_id) in rows {
            if *name != table {
                table = name;
                out.extend(Frame::Table { name: name.to_string() }.encode_line().unwrap());
            }
            out.extend(
                Frame::Row {
                    data_id: *data_id,
                    event: DataEventType::Insert,
                    data: vec![Some(data_id.to_string())],
                    old_data: None,
                }
                .encode_line()
                .unwrap(),
            );
        }
        out.extend(Frame::Commit { batch_id }.encode_line().unwrap());
        out
    }

    #[test]
    fn decode_concatenated_batches() {
        let mut payload = staged(1, &[("orders", 10), ("orders", 11), ("items", 12)]);
        payload.extend(staged(2, &[]));

        let batches = decode_payload(&payload).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].rows.len(), 3);
        assert_eq!(batches[0].rows[2].table, "items");
        assert_eq!(batches[0].rows[1].data_id, 11);
        assert!(batches[1].rows.is_empty());
    }

    #[test]
    fn uncommitted_batch_is_rejected() {
        let payload = staged(1, &[("orders", 10)]);
        let truncated = &payload[..payload.len() - 25];
        assert!(decode_payload(truncated).is_err());
    }

    #[test]
    fn row_without_table_is_rejected() {
        let mut payload = Frame::Batch {
            batch_id: 3,
            source_node_id: "N1".into(),
            channel_id: "default".into(),
            load_id: Some(9),
            ignored: false,
        }
        .encode_line()
        .unwrap();
        payload.extend(
            Frame::Row {
                data_id: 1,
                event: DataEventType::Delete,
                data: vec![],
                old_data: None,
            }
            .encode_line()
            .unwrap(),
        );
        let err = decode_payload(&payload).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedFrame { line: 2, .. }));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = decode_payload(b"not json\n").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedFrame { line: 1, .. }));
    }

    #[test]
    fn renumbered_batch_keeps_its_rows() {
        let payload = staged(11, &[("orders", 10), ("items", 12)]);

        let copy = renumber_payload(&payload, 2011, Some(5)).unwrap();

        let original = decode_payload(&payload).unwrap();
        let batches = decode_payload(&copy).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].batch_id, 2011);
        assert_eq!(batches[0].load_id, Some(5));
        assert_eq!(batches[0].source_node_id, "N1");
        assert_eq!(batches[0].rows, original[0].rows);
    }
}
