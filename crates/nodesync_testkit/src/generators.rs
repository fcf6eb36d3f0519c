//! Property-based test generators using proptest.
//!
//! Strategies produce values that satisfy the ledger's own rules, so
//! properties can focus on the behavior under test.

use nodesync_protocol::{BatchAck, BatchId, BatchStatus, CaptureRow, DataEventType};
use proptest::prelude::*;

/// Strategy for batch ids in the range the sequence generator hands out.
pub fn batch_id_strategy() -> impl Strategy<Value = BatchId> {
    1u64..1_000_000
}

/// Strategy for node ids.
pub fn node_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][0-9]{1,3}").expect("Invalid regex")
}

/// Strategy for any batch status.
pub fn batch_status_strategy() -> impl Strategy<Value = BatchStatus> {
    prop::sample::select(vec![
        BatchStatus::Requested,
        BatchStatus::New,
        BatchStatus::Querying,
        BatchStatus::Sending,
        BatchStatus::Loading,
        BatchStatus::Ok,
        BatchStatus::Error,
        BatchStatus::Ignored,
        BatchStatus::Resend,
        BatchStatus::Routing,
    ])
}

/// Strategy for column values; `None` is a database null.
pub fn column_value_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::weighted(0.9, "[ -~]{0,24}")
}

/// Strategy for a captured change.
pub fn capture_row_strategy() -> impl Strategy<Value = CaptureRow> {
    (
        1u64..1_000_000,
        prop::string::string_regex("[a-z][a-z_]{0,15}").expect("Invalid regex"),
        prop::sample::select(vec![
            DataEventType::Insert,
            DataEventType::Update,
            DataEventType::Delete,
        ]),
        prop::collection::vec(column_value_strategy(), 1..6),
    )
        .prop_map(|(data_id, table, event, data)| {
            let old_data = match event {
                DataEventType::Insert => None,
                _ => Some(data.clone()),
            };
            CaptureRow {
                data_id,
                table,
                event,
                data,
                old_data,
            }
        })
}

/// Strategy for the rows of one batch.
pub fn capture_rows_strategy(max: usize) -> impl Strategy<Value = Vec<CaptureRow>> {
    prop::collection::vec(capture_row_strategy(), 0..=max)
}

/// Strategy for an ack from `node_id`.
///
/// Error acks carry a 1-based error line and a message without line
/// breaks, which is all the text format can carry.
pub fn batch_ack_strategy(node_id: String) -> impl Strategy<Value = BatchAck> {
    (
        batch_id_strategy(),
        0u8..3,
        1u64..500,
        prop::option::of("[A-Z_]{1,10}"),
        any::<i32>(),
        prop::option::of("[ -~]{0,40}"),
        0u64..1_000_000,
    )
        .prop_map(
            move |(batch_id, kind, line, state, code, message, bytes)| {
                let mut ack = match kind {
                    0 => BatchAck::ok(batch_id, node_id.clone()),
                    1 => BatchAck::ignored(batch_id, node_id.clone()),
                    _ => {
                        let mut ack = BatchAck::error(batch_id, node_id.clone(), line);
                        ack.sql_state = state;
                        ack.sql_code = code;
                        ack.sql_message = message;
                        ack
                    }
                };
                ack.byte_count = bytes;
                ack
            },
        )
}

/// Strategy for acks with distinct batch ids.
pub fn batch_acks_strategy(node_id: String, max: usize) -> impl Strategy<Value = Vec<BatchAck>> {
    prop::collection::vec(batch_ack_strategy(node_id), 0..=max).prop_map(|acks| {
        let mut seen = std::collections::HashSet::new();
        acks.into_iter()
            .filter(|ack| seen.insert(ack.batch_id))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_acks_have_unique_ids(acks in batch_acks_strategy("N2".to_string(), 20)) {
            let mut ids: Vec<_> = acks.iter().map(|a| a.batch_id).collect();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), acks.len());
            prop_assert!(acks.iter().all(|a| a.node_id == "N2"));
        }

        #[test]
        fn inserts_carry_no_old_data(row in capture_row_strategy()) {
            prop_assert_eq!(row.event == DataEventType::Insert, row.old_data.is_none());
        }
    }
}
