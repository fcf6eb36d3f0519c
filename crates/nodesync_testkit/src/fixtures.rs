//! Test fixtures: capture sources, appliers and wired nodes.

use nodesync_core::{
    BatchApplier, CaptureReader, CoreConfig, CoreError, CoreResult, LoadFailure,
    NodeServices, RowStream, StaticNodeDirectory, Stores,
};
use nodesync_protocol::{
    Batch, BatchId, BatchStatus, CaptureRow, Clock, ExtractRequest, Frame, ManualClock, Node,
    Timestamp,
};
use nodesync_store::{LocalStagingManager, MemoryStore, StagingManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Start time of every [`TestNode`] clock.
pub const TEST_EPOCH: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Builds an insert row with one value per column.
pub fn capture_row(data_id: u64, table: &str, values: &[&str]) -> CaptureRow {
    CaptureRow::insert(
        data_id,
        table,
        values.iter().map(|v| Some((*v).to_string())).collect(),
    )
}

/// Builds `count` insert rows for `table` with ids starting at `first_id`.
pub fn capture_rows(first_id: u64, table: &str, count: usize) -> Vec<CaptureRow> {
    (0..count as u64)
        .map(|i| {
            let id = first_id + i;
            capture_row(id, table, &[&id.to_string()])
        })
        .collect()
}

/// Encodes one staged batch the way a sending node stages it.
pub fn batch_payload(
    source_node_id: &str,
    channel_id: &str,
    batch_id: BatchId,
    rows: &[CaptureRow],
) -> Vec<u8> {
    let mut frames = vec![Frame::Batch {
        batch_id,
        source_node_id: source_node_id.to_string(),
        channel_id: channel_id.to_string(),
        load_id: None,
        ignored: false,
    }];
    let mut table: Option<&str> = None;
    for row in rows {
        if table != Some(row.table.as_str()) {
            table = Some(row.table.as_str());
            frames.push(Frame::Table {
                name: row.table.clone(),
            });
        }
        frames.push(Frame::Row {
            data_id: row.data_id,
            event: row.event,
            data: row.data.clone(),
            old_data: row.old_data.clone(),
        });
    }
    frames.push(Frame::Commit { batch_id });

    frames
        .iter()
        .flat_map(|frame| frame.encode_line().expect("encode frame"))
        .collect()
}

/// A capture source holding rows in memory.
#[derive(Default)]
pub struct MemoryCapture {
    batches: Mutex<HashMap<(String, BatchId), Vec<CaptureRow>>>,
    loads: Mutex<HashMap<u64, Vec<CaptureRow>>>,
    failing: Mutex<HashMap<BatchId, String>>,
}

impl MemoryCapture {
    /// Creates an empty capture source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rows routed to a batch.
    pub fn set_batch_rows(&self, node_id: &str, batch_id: BatchId, rows: Vec<CaptureRow>) {
        self.batches
            .lock()
            .insert((node_id.to_string(), batch_id), rows);
    }

    /// Sets the rows of a reload.
    pub fn set_load_rows(&self, load_id: u64, rows: Vec<CaptureRow>) {
        self.loads.lock().insert(load_id, rows);
    }

    /// Makes reading a batch fail with `message`.
    pub fn fail_batch(&self, batch_id: BatchId, message: impl Into<String>) {
        self.failing.lock().insert(batch_id, message.into());
    }
}

impl CaptureReader for MemoryCapture {
    fn batch_rows(&self, batch: &Batch) -> CoreResult<RowStream<'_>> {
        if let Some(message) = self.failing.lock().get(&batch.batch_id) {
            return Err(CoreError::Capture(message.clone()));
        }
        let rows = self
            .batches
            .lock()
            .get(&(batch.node_id.clone(), batch.batch_id))
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn load_rows(&self, request: &ExtractRequest) -> CoreResult<RowStream<'_>> {
        let rows = self
            .loads
            .lock()
            .get(&request.load_id)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(rows.into_iter().map(Ok)))
    }
}

/// A batch the [`RecordingApplier`] applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Batch id.
    pub batch_id: BatchId,
    /// Source node.
    pub node_id: String,
    /// Rows in order.
    pub rows: Vec<CaptureRow>,
}

/// A batch applier that records every applied batch.
#[derive(Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<AppliedBatch>>,
    failures: Mutex<HashMap<BatchId, LoadFailure>>,
}

impl RecordingApplier {
    /// Creates an applier that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every load of `batch_id` fail until cleared.
    pub fn fail_batch(&self, batch_id: BatchId, failure: LoadFailure) {
        self.failures.lock().insert(batch_id, failure);
    }

    /// Lets `batch_id` load again.
    pub fn clear_failure(&self, batch_id: BatchId) {
        self.failures.lock().remove(&batch_id);
    }

    /// Batches applied so far.
    pub fn applied(&self) -> Vec<AppliedBatch> {
        self.applied.lock().clone()
    }

    /// Ids of the batches applied so far, in order.
    pub fn applied_ids(&self) -> Vec<BatchId> {
        self.applied.lock().iter().map(|b| b.batch_id).collect()
    }

    /// Rows applied so far.
    pub fn row_count(&self) -> usize {
        self.applied.lock().iter().map(|b| b.rows.len()).sum()
    }
}

impl BatchApplier for RecordingApplier {
    fn apply(&self, batch: &Batch, rows: &[CaptureRow]) -> Result<(), LoadFailure> {
        if let Some(failure) = self.failures.lock().get(&batch.batch_id) {
            return Err(failure.clone());
        }
        self.applied.lock().push(AppliedBatch {
            batch_id: batch.batch_id,
            node_id: batch.node_id.clone(),
            rows: rows.to_vec(),
        });
        Ok(())
    }
}

/// A fully wired node over an in-memory store.
pub struct TestNode {
    /// Node identity.
    pub node: Node,
    /// Durable store.
    pub store: Arc<MemoryStore>,
    /// Known nodes.
    pub directory: Arc<StaticNodeDirectory>,
    /// Capture source.
    pub capture: Arc<MemoryCapture>,
    /// Batch applier.
    pub applier: Arc<RecordingApplier>,
    /// Clock shared by every service.
    pub clock: Arc<ManualClock>,
    /// The services.
    pub services: Arc<NodeServices>,
    _staging_dir: Option<TempDir>,
}

impl TestNode {
    /// Starts building a node.
    pub fn builder(node_id: &str) -> TestNodeBuilder {
        TestNodeBuilder {
            node: Node::new(node_id, "test"),
            store: None,
            clock: None,
            push_targets: Vec::new(),
            pull_sources: Vec::new(),
            channels: vec!["default".to_string()],
            config: CoreConfig::default(),
            file_staging: false,
        }
    }

    /// A sender that pushes to a receiver which pulls from it.
    pub fn pair(sender_id: &str, receiver_id: &str) -> (TestNode, TestNode) {
        let sender = Self::builder(sender_id)
            .push_to(Node::new(receiver_id, "test"))
            .build();
        let receiver = Self::builder(receiver_id)
            .pull_from(Node::new(sender_id, "test"))
            .build();
        (sender, receiver)
    }

    /// Node id.
    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    /// Creates an outgoing batch for `target` with `rows` captured rows.
    pub fn route_batch(&self, target: &str, channel_id: &str, rows: usize) -> Batch {
        self.route_batch_with(target, channel_id, |batch_id| {
            capture_rows(batch_id * 1_000, "item", rows)
        })
    }

    /// Creates an outgoing batch for `target` with the rows `rows` returns.
    pub fn route_batch_with(
        &self,
        target: &str,
        channel_id: &str,
        rows: impl FnOnce(BatchId) -> Vec<CaptureRow>,
    ) -> Batch {
        let batch = self
            .services
            .outgoing
            .create_batch(target, channel_id, None)
            .expect("create batch");
        self.capture
            .set_batch_rows(target, batch.batch_id, rows(batch.batch_id));
        batch
    }

    /// Reads the outgoing row of a batch.
    pub fn outgoing(&self, batch_id: BatchId, node_id: &str) -> Batch {
        self.services
            .outgoing
            .get(batch_id, node_id)
            .expect("outgoing batch")
    }

    /// Reads the incoming row of a batch, if any.
    pub fn incoming(&self, batch_id: BatchId, node_id: &str) -> Option<Batch> {
        self.services
            .incoming
            .find(batch_id, node_id)
            .expect("incoming batch")
    }

    /// Status of an outgoing batch.
    pub fn outgoing_status(&self, batch_id: BatchId, node_id: &str) -> BatchStatus {
        self.outgoing(batch_id, node_id).status
    }
}

/// Builder for [`TestNode`].
pub struct TestNodeBuilder {
    node: Node,
    store: Option<Arc<MemoryStore>>,
    clock: Option<Arc<ManualClock>>,
    push_targets: Vec<Node>,
    pull_sources: Vec<Node>,
    channels: Vec<String>,
    config: CoreConfig,
    file_staging: bool,
}

impl TestNodeBuilder {
    /// Shares a store with another node, as two servers of one cluster do.
    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Shares a clock.
    pub fn clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds a push target.
    pub fn push_to(mut self, node: Node) -> Self {
        self.push_targets.push(node);
        self
    }

    /// Adds a pull source.
    pub fn pull_from(mut self, node: Node) -> Self {
        self.pull_sources.push(node);
        self
    }

    /// Replaces the channel list.
    pub fn channels(mut self, channels: &[&str]) -> Self {
        self.channels = channels.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Sets the core configuration.
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Stages to files in a temporary directory.
    pub fn file_staging(mut self) -> Self {
        self.file_staging = true;
        self
    }

    /// Builds the node.
    pub fn build(self) -> TestNode {
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(ManualClock::new(TEST_EPOCH)));
        let shared_clock: Arc<dyn Clock> = clock.clone();

        let mut directory = StaticNodeDirectory::new(self.node.clone()).with_channels(self.channels);
        for node in self.push_targets {
            directory = directory.with_push_target(node);
        }
        for node in self.pull_sources {
            directory = directory.with_pull_source(node);
        }
        let directory = Arc::new(directory);

        let (staging, staging_dir): (Arc<dyn StagingManager>, _) = if self.file_staging {
            let dir = TempDir::new().expect("staging directory");
            (
                Arc::new(LocalStagingManager::with_directory(
                    dir.path(),
                    Arc::clone(&shared_clock),
                )),
                Some(dir),
            )
        } else {
            (
                Arc::new(LocalStagingManager::in_memory(Arc::clone(&shared_clock))),
                None,
            )
        };

        let mut config = self.config;
        if config.lock.server_id.is_none() {
            config.lock.server_id = Some(format!("{}-server", self.node.node_id));
        }

        let capture = Arc::new(MemoryCapture::new());
        let applier = Arc::new(RecordingApplier::new());
        let services = NodeServices::builder(
            Stores::shared(Arc::clone(&store)),
            directory.clone(),
            capture.clone(),
            applier.clone(),
        )
        .clock(shared_clock)
        .staging(staging)
        .config(config)
        .open()
        .expect("open node services");

        TestNode {
            node: self.node,
            store,
            directory,
            capture,
            applier,
            clock,
            services: Arc::new(services),
            _staging_dir: staging_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_returns_routed_rows() {
        let capture = MemoryCapture::new();
        capture.set_batch_rows("N2", 5, capture_rows(1, "item", 3));
        let batch = Batch::new(5, "N2", "default", BatchStatus::New);

        let rows: Vec<_> = capture
            .batch_rows(&batch)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].data_id, 3);

        capture.fail_batch(5, "cursor closed");
        assert!(capture.batch_rows(&batch).is_err());
    }

    #[test]
    fn applier_records_and_fails() {
        let applier = RecordingApplier::new();
        let batch = Batch::new(9, "N1", "default", BatchStatus::Loading);
        applier.apply(&batch, &capture_rows(1, "item", 2)).unwrap();
        assert_eq!(applier.applied_ids(), vec![9]);
        assert_eq!(applier.row_count(), 2);

        applier.fail_batch(9, LoadFailure::io("disk full"));
        assert!(applier.apply(&batch, &[]).is_err());
        applier.clear_failure(9);
        assert!(applier.apply(&batch, &[]).is_ok());
    }

    #[test]
    fn payload_decodes() {
        let payload = batch_payload("N1", "default", 7, &capture_rows(70, "item", 2));
        let decoded = nodesync_protocol::decode_payload(&payload).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].source_node_id, "N1");
        assert_eq!(decoded[0].rows.len(), 2);
        assert_eq!(decoded[0].rows[1].data_id, 71);
    }

    #[test]
    fn pair_is_wired() {
        let (sender, receiver) = TestNode::pair("N1", "N2");
        assert_eq!(sender.services.local_node_id(), "N1");
        assert_eq!(receiver.services.server_id(), "N2-server");

        let batch = sender.route_batch("N2", "default", 4);
        assert_eq!(sender.outgoing_status(batch.batch_id, "N2"), BatchStatus::New);
    }
}
