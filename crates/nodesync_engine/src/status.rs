//! Outcome of a push or pull cycle per remote node and channel.

use std::fmt;

/// What happened with one (node, channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteStatus {
    /// Nothing to send or receive.
    NoData,
    /// Batches moved.
    DataProcessed,
    /// Reservation rejected or lease held elsewhere.
    Busy,
    /// The remote could not be reached.
    Offline,
    /// Batches moved but at least one failed, or the cycle aborted.
    Failed,
}

impl RemoteStatus {
    /// Returns the status name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteStatus::NoData => "NO_DATA",
            RemoteStatus::DataProcessed => "DATA_PROCESSED",
            RemoteStatus::Busy => "BUSY",
            RemoteStatus::Offline => "OFFLINE",
            RemoteStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome for one (node, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNodeStatus {
    /// Remote node.
    pub node_id: String,
    /// Channel.
    pub channel_id: String,
    /// Outcome.
    pub status: RemoteStatus,
    /// Batches sent or loaded.
    pub batches_processed: usize,
    /// Rows in those batches.
    pub rows_processed: u64,
    /// Batches that ended in error.
    pub batches_in_error: usize,
    /// Why the cycle did not complete, if it did not.
    pub failure: Option<String>,
}

impl RemoteNodeStatus {
    /// Creates a status with no data processed.
    pub fn new(node_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            status: RemoteStatus::NoData,
            batches_processed: 0,
            rows_processed: 0,
            batches_in_error: 0,
            failure: None,
        }
    }

    /// Sets the outcome.
    pub fn with_status(mut self, status: RemoteStatus) -> Self {
        self.status = status;
        self
    }

    /// Marks the cycle failed with a reason.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.status = RemoteStatus::Failed;
        self.failure = Some(reason.into());
        self
    }

    /// Adds processed batches and derives the outcome.
    pub fn record_batches(&mut self, batches: usize, rows: u64, in_error: usize) {
        self.batches_processed += batches;
        self.rows_processed += rows;
        self.batches_in_error += in_error;
        if self.batches_in_error > 0 {
            self.status = RemoteStatus::Failed;
        } else if self.batches_processed > 0 {
            self.status = RemoteStatus::DataProcessed;
        }
    }

    /// Returns true if the pair should be retried soon.
    pub fn is_failure(&self) -> bool {
        matches!(self.status, RemoteStatus::Offline | RemoteStatus::Failed)
    }
}

/// Outcomes of one push or pull cycle across all pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteNodeStatuses {
    statuses: Vec<RemoteNodeStatus>,
}

impl RemoteNodeStatuses {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the outcome of a pair.
    pub fn add(&mut self, status: RemoteNodeStatus) {
        self.statuses.push(status);
    }

    /// Outcome of a pair.
    pub fn get(&self, node_id: &str, channel_id: &str) -> Option<&RemoteNodeStatus> {
        self.statuses
            .iter()
            .find(|s| s.node_id == node_id && s.channel_id == channel_id)
    }

    /// All outcomes in completion order.
    pub fn iter(&self) -> impl Iterator<Item = &RemoteNodeStatus> {
        self.statuses.iter()
    }

    /// Number of pairs handled.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Returns true if no pair was handled.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Pairs with the given outcome.
    pub fn count(&self, status: RemoteStatus) -> usize {
        self.statuses.iter().filter(|s| s.status == status).count()
    }

    /// Total batches processed.
    pub fn batches_processed(&self) -> usize {
        self.statuses.iter().map(|s| s.batches_processed).sum()
    }

    /// Returns true if any pair moved data.
    pub fn data_processed(&self) -> bool {
        self.statuses.iter().any(|s| s.batches_processed > 0)
    }

    /// Returns true if any pair failed or was offline.
    pub fn has_failure(&self) -> bool {
        self.statuses.iter().any(RemoteNodeStatus::is_failure)
    }
}

impl IntoIterator for RemoteNodeStatuses {
    type Item = RemoteNodeStatus;
    type IntoIter = std::vec::IntoIter<RemoteNodeStatus>;

    fn into_iter(self) -> Self::IntoIter {
        self.statuses.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_batches_derives_status() {
        let mut status = RemoteNodeStatus::new("N2", "default");
        assert_eq!(status.status, RemoteStatus::NoData);

        status.record_batches(2, 10, 0);
        assert_eq!(status.status, RemoteStatus::DataProcessed);

        status.record_batches(1, 3, 1);
        assert_eq!(status.status, RemoteStatus::Failed);
        assert_eq!(status.batches_processed, 3);
        assert_eq!(status.rows_processed, 13);
        assert!(status.is_failure());
    }

    #[test]
    fn aggregate() {
        let mut statuses = RemoteNodeStatuses::new();
        let mut sent = RemoteNodeStatus::new("N2", "default");
        sent.record_batches(2, 4, 0);
        statuses.add(sent);
        statuses.add(RemoteNodeStatus::new("N3", "default").with_status(RemoteStatus::Busy));

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses.batches_processed(), 2);
        assert_eq!(statuses.count(RemoteStatus::Busy), 1);
        assert!(statuses.data_processed());
        assert!(!statuses.has_failure());
        assert_eq!(
            statuses.get("N3", "default").map(|s| s.status),
            Some(RemoteStatus::Busy)
        );
    }

    #[test]
    fn status_names() {
        assert_eq!(RemoteStatus::DataProcessed.to_string(), "DATA_PROCESSED");
        assert_eq!(
            RemoteNodeStatus::new("N2", "default").failed("boom").failure.as_deref(),
            Some("boom")
        );
    }
}
