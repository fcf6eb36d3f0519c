//! Extract requests for reloads.

use crate::batch::BatchId;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Status of an extract request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractStatus {
    /// Waiting to be extracted.
    #[serde(rename = "NE")]
    New,
    /// Extraction finished (or was cancelled).
    #[serde(rename = "OK")]
    Ok,
}

/// A contiguous range of outgoing load batches to produce for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRequest {
    /// Request id from the `extract_request` sequence.
    pub request_id: u64,
    /// Target node.
    pub node_id: String,
    /// Channel of the batches.
    pub channel_id: String,
    /// Status.
    pub status: ExtractStatus,
    /// First batch id of the range.
    pub start_batch_id: BatchId,
    /// Last batch id of the range, inclusive.
    pub end_batch_id: BatchId,
    /// Load the batches belong to.
    pub load_id: u64,
    /// Trigger (source table) to reload.
    pub trigger_id: String,
    /// Router that targets the node.
    pub router_id: String,
    /// When the request was last written.
    pub last_update_time: Option<Timestamp>,
    /// When the request was created.
    pub create_time: Option<Timestamp>,
    /// Request whose extraction also stages this request's batches.
    #[serde(default)]
    pub parent_request_id: Option<u64>,
}

impl ExtractRequest {
    /// Returns true if `batch_id` is part of the range.
    pub fn contains(&self, batch_id: BatchId) -> bool {
        (self.start_batch_id..=self.end_batch_id).contains(&batch_id)
    }

    /// Number of batches in the range.
    pub fn batch_count(&self) -> u64 {
        self.end_batch_id.saturating_sub(self.start_batch_id) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_helpers() {
        let request = ExtractRequest {
            request_id: 1,
            node_id: "N2".into(),
            channel_id: "reload".into(),
            status: ExtractStatus::New,
            start_batch_id: 10,
            end_batch_id: 13,
            load_id: 4,
            trigger_id: "orders".into(),
            router_id: "to_store".into(),
            last_update_time: None,
            create_time: None,
            parent_request_id: None,
        };
        assert!(request.contains(10));
        assert!(request.contains(13));
        assert!(!request.contains(14));
        assert_eq!(request.batch_count(), 4);
    }
}
