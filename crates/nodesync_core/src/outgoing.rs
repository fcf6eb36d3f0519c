//! Outgoing batch ledger.

use crate::error::{CoreError, CoreResult};
use crate::sequence::SequenceService;
use nodesync_protocol::{sequences, Batch, BatchId, BatchStatus, Clock};
use nodesync_store::OutgoingBatchStore;
use std::sync::Arc;

/// Sender-side ledger of batches and their delivery state.
pub struct OutgoingBatchService {
    store: Arc<dyn OutgoingBatchStore>,
    sequences: Arc<SequenceService>,
    clock: Arc<dyn Clock>,
    host: String,
}

impl OutgoingBatchService {
    /// Creates the ledger service. `host` is written as the last updater.
    pub fn new(
        store: Arc<dyn OutgoingBatchStore>,
        sequences: Arc<SequenceService>,
        clock: Arc<dyn Clock>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sequences,
            clock,
            host: host.into(),
        }
    }

    /// Creates a `NE` batch with an id from the `outgoing_batch` sequence.
    pub fn create_batch(
        &self,
        node_id: &str,
        channel_id: &str,
        load_id: Option<u64>,
    ) -> CoreResult<Batch> {
        let batch_id = self.next_batch_id()?;
        let mut batch = Batch::new(batch_id, node_id, channel_id, BatchStatus::New);
        batch.load_id = load_id;
        self.insert(&mut batch)?;
        Ok(batch)
    }

    /// Allocates a batch id without creating a row.
    pub fn next_batch_id(&self) -> CoreResult<BatchId> {
        let id = self.sequences.next_val(sequences::OUTGOING_BATCH)?;
        BatchId::try_from(id)
            .map_err(|_| CoreError::InvalidArgument(format!("negative batch id {id}")))
    }

    /// Inserts a batch row.
    pub fn insert(&self, batch: &mut Batch) -> CoreResult<()> {
        let now = self.clock.now();
        batch.create_time.get_or_insert(now);
        self.stamp(batch);
        self.store.insert_outgoing(batch)?;
        Ok(())
    }

    /// Reads a batch.
    pub fn find(&self, batch_id: BatchId, node_id: &str) -> CoreResult<Option<Batch>> {
        Ok(self.store.find_outgoing(batch_id, node_id)?)
    }

    /// Reads a batch that must exist.
    pub fn get(&self, batch_id: BatchId, node_id: &str) -> CoreResult<Batch> {
        self.find(batch_id, node_id)?
            .ok_or_else(|| CoreError::BatchNotFound {
                batch_id,
                node_id: node_id.to_string(),
            })
    }

    /// Writes status, error flag and counters in one update.
    pub fn update(&self, batch: &mut Batch) -> CoreResult<()> {
        batch.derive_error_flag();
        self.stamp(batch);
        if self.store.update_outgoing(batch)? {
            Ok(())
        } else {
            Err(CoreError::BatchNotFound {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
            })
        }
    }

    /// Writes a batch only if its stored status is still `expected`.
    /// Returns false when the row moved on, leaving it untouched.
    pub fn update_if(&self, batch: &mut Batch, expected: BatchStatus) -> CoreResult<bool> {
        batch.derive_error_flag();
        self.stamp(batch);
        Ok(self.store.update_outgoing_if(batch, expected)?)
    }

    /// Unfinished batches for a node, ordered by id.
    ///
    /// While a load is in progress and nothing is in error, only load
    /// batches are returned so the initial load completes first.
    pub fn pending_batches(&self, node_id: &str) -> CoreResult<Vec<Batch>> {
        let mut batches = self.store.outgoing_for_node(node_id, &BatchStatus::PENDING)?;
        let has_load = batches.iter().any(Batch::is_load_batch);
        let has_error = batches.iter().any(|b| b.status == BatchStatus::Error);
        if has_load && !has_error {
            batches.retain(Batch::is_load_batch);
        }
        Ok(batches)
    }

    /// Pending batches of one channel that may be sent now. `RQ` batches wait
    /// for their extract request.
    pub fn sendable_batches(&self, node_id: &str, channel_id: &str) -> CoreResult<Vec<Batch>> {
        let mut batches = self.pending_batches(node_id)?;
        batches.retain(|b| b.channel_id == channel_id && b.status != BatchStatus::Requested);
        Ok(batches)
    }

    /// Batches of a node inside an inclusive id range.
    pub fn batches_in_range(
        &self,
        node_id: &str,
        start: BatchId,
        end: BatchId,
    ) -> CoreResult<Vec<Batch>> {
        Ok(self.store.outgoing_in_range(node_id, start, end)?)
    }

    /// Batches of a load, ordered by id.
    pub fn batches_for_load(&self, load_id: u64) -> CoreResult<Vec<Batch>> {
        Ok(self.store.outgoing_for_load(load_id)?)
    }

    /// Marks every unfinished batch of a load `OK` as ignored.
    pub fn cancel_load_batches(&self, load_id: u64) -> CoreResult<usize> {
        let mut cancelled = 0;
        for mut batch in self.store.outgoing_for_load(load_id)? {
            if batch.status == BatchStatus::Ok {
                continue;
            }
            batch.status = BatchStatus::Ok;
            batch.ignore_count += 1;
            self.update(&mut batch)?;
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::info!(load_id, cancelled, "cancelled load batches");
        }
        Ok(cancelled)
    }

    /// Operator bulk resolve: every unfinished batch of a node becomes `OK`,
    /// highest id first.
    pub fn mark_all_as_sent_for_node(&self, node_id: &str) -> CoreResult<usize> {
        let mut batches = self.store.outgoing_for_node(node_id, &BatchStatus::PENDING)?;
        batches.reverse();
        for batch in &mut batches {
            batch.status = BatchStatus::Ok;
            self.update(batch)?;
        }
        if !batches.is_empty() {
            tracing::info!(node_id, count = batches.len(), "marked all batches as sent");
        }
        Ok(batches.len())
    }

    /// Resolves `RT` batches a crashed router left behind.
    pub fn update_abandoned_routing_batches(&self) -> CoreResult<usize> {
        let batches = self.store.outgoing_with_status(&[BatchStatus::Routing])?;
        if batches.is_empty() {
            return Ok(0);
        }
        tracing::info!(
            count = batches.len(),
            "cleaning up batches abandoned by a failed routing attempt"
        );
        for mut batch in batches.iter().cloned() {
            batch.status = BatchStatus::Ok;
            self.update(&mut batch)?;
        }
        Ok(batches.len())
    }

    /// Operator force to `OK` or `IG` without replaying data.
    pub fn operator_resolve(
        &self,
        batch_id: BatchId,
        node_id: &str,
        status: BatchStatus,
    ) -> CoreResult<Batch> {
        if !matches!(status, BatchStatus::Ok | BatchStatus::Ignored) {
            return Err(CoreError::InvalidArgument(format!(
                "operators may only resolve to OK or IG, not {status}"
            )));
        }
        let mut batch = self.get(batch_id, node_id)?;
        if batch.status == BatchStatus::Ok && status == BatchStatus::Ok {
            batch.error_flag = false;
            self.stamp(&mut batch);
            self.store.update_outgoing(&batch)?;
            return Ok(batch);
        }
        let previous = batch.status;
        batch.status = status;
        if status == BatchStatus::Ignored {
            batch.ignore_count += 1;
        }
        self.update(&mut batch)?;
        tracing::info!(batch = %batch.node_batch_id(), %previous, %status, "operator resolved batch");
        Ok(batch)
    }

    /// Records an extraction failure on a batch.
    pub fn record_extract_failure(
        &self,
        batch: &mut Batch,
        sql_state: Option<String>,
        sql_code: i32,
        message: impl Into<String>,
    ) -> CoreResult<()> {
        if batch.status != BatchStatus::Ignored {
            batch.status = BatchStatus::Error;
        }
        batch.sql_state = sql_state;
        batch.sql_code = sql_code;
        batch.sql_message = Some(message.into());
        batch.error_flag = true;
        self.stamp(batch);
        if !self.store.update_outgoing(batch)? {
            return Err(CoreError::BatchNotFound {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
            });
        }
        tracing::warn!(
            batch = %batch.node_batch_id(),
            message = ?batch.sql_message,
            "failed to extract batch"
        );
        Ok(())
    }

    /// Number of batches in error across all nodes.
    pub fn count_in_error(&self) -> CoreResult<usize> {
        Ok(self
            .store
            .outgoing_with_status(&[BatchStatus::Error])?
            .len())
    }

    /// Number of unfinished batches for a node.
    pub fn count_unsent(&self, node_id: &str) -> CoreResult<usize> {
        Ok(self
            .store
            .outgoing_for_node(node_id, &BatchStatus::PENDING)?
            .len())
    }

    fn stamp(&self, batch: &mut Batch) {
        batch.last_update_host = Some(self.host.clone());
        batch.last_update_time = Some(self.clock.now());
    }
}
