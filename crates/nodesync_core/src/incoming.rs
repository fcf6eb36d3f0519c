//! Incoming batch ledger and idempotent admission.

use crate::config::LoadConfig;
use crate::error::{CoreError, CoreResult};
use nodesync_protocol::{Batch, BatchAck, BatchId, BatchStatus, Clock};
use nodesync_store::IncomingBatchStore;
use std::sync::Arc;

/// Decision for a batch arriving from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Load the batch. Set for first deliveries and retries of failed loads.
    Proceed,
    /// Already loaded; the retransmission is skipped.
    Skip,
    /// An operator ignored the batch; it stays ignored.
    Ignored,
}

impl Admission {
    /// Returns true if the batch must be loaded.
    pub fn should_load(&self) -> bool {
        matches!(self, Admission::Proceed)
    }
}

/// Receiver-side ledger.
pub struct IncomingBatchService {
    store: Arc<dyn IncomingBatchStore>,
    clock: Arc<dyn Clock>,
    config: LoadConfig,
    host: String,
}

impl IncomingBatchService {
    /// Creates the ledger service.
    pub fn new(
        store: Arc<dyn IncomingBatchStore>,
        clock: Arc<dyn Clock>,
        config: LoadConfig,
        host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            host: host.into(),
        }
    }

    /// Receiving side configuration.
    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// Admission control for a delivered batch.
    ///
    /// The first delivery inserts a `LD` row. A redelivery finds the row and
    /// decides on its status: `ER`/`LD` is retried, `IG` stays ignored, `OK` is
    /// skipped (or retried when duplicate skipping is off). `batch` is updated
    /// to reflect the decision.
    pub fn acquire(&self, batch: &mut Batch) -> CoreResult<Admission> {
        let now = self.clock.now();
        batch.status = BatchStatus::Loading;
        batch.create_time = Some(now);
        batch.load_count = 1;
        self.stamp(batch);
        match self.store.insert_incoming(batch) {
            Ok(()) => return Ok(Admission::Proceed),
            Err(err) if err.is_duplicate() => {}
            Err(err) => return Err(err.into()),
        }

        let mut existing = self
            .store
            .find_incoming(batch.batch_id, &batch.node_id)?
            .ok_or_else(|| CoreError::BatchNotFound {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
            })?;
        batch.retry_flag = true;
        batch.create_time = existing.create_time;
        batch.skip_count = existing.skip_count;
        batch.ignore_count = existing.ignore_count;

        let retry = match existing.status {
            BatchStatus::Error | BatchStatus::Loading => true,
            BatchStatus::Ignored => false,
            BatchStatus::Ok => !self.config.skip_duplicate_batches,
            _ => false,
        };

        if retry {
            tracing::info!(
                batch = %batch.node_batch_id(),
                previous = %existing.status,
                "retrying batch"
            );
            batch.load_count = existing.load_count + 1;
            existing.status = BatchStatus::Loading;
            existing.retry_flag = true;
            existing.load_count = batch.load_count;
            self.write(&mut existing)?;
            return Ok(Admission::Proceed);
        }

        if existing.status == BatchStatus::Ignored {
            existing.ignore_count += 1;
            self.write(&mut existing)?;
            batch.status = BatchStatus::Ok;
            batch.ignore_count = existing.ignore_count;
            batch.load_count = existing.load_count;
            tracing::info!(batch = %batch.node_batch_id(), "batch was ignored, not loading it");
            return Ok(Admission::Ignored);
        }

        existing.skip_count += 1;
        self.write(&mut existing)?;
        batch.copy_statistics_from(&existing);
        batch.status = BatchStatus::Ok;
        batch.skip_count = existing.skip_count;
        batch.load_count = existing.load_count;
        tracing::info!(
            batch = %batch.node_batch_id(),
            skip_count = batch.skip_count,
            "skipping batch that was already loaded"
        );
        Ok(Admission::Skip)
    }

    /// Admission control reduced to "should this batch be loaded".
    pub fn acquire_incoming_batch(&self, batch: &mut Batch) -> CoreResult<bool> {
        Ok(self.acquire(batch)?.should_load())
    }

    /// Reads a batch.
    pub fn find(&self, batch_id: BatchId, node_id: &str) -> CoreResult<Option<Batch>> {
        Ok(self.store.find_incoming(batch_id, node_id)?)
    }

    /// Writes status, error flag and counters in one update, inserting the
    /// row if it disappeared.
    pub fn update(&self, batch: &mut Batch) -> CoreResult<()> {
        self.write(batch)
    }

    /// Deletes a batch row.
    pub fn delete(&self, batch: &Batch) -> CoreResult<bool> {
        Ok(self.store.delete_incoming(batch.batch_id, &batch.node_id)?)
    }

    /// Records a successful load.
    pub fn record_loaded(&self, batch: &mut Batch) -> CoreResult<()> {
        batch.status = BatchStatus::Ok;
        batch.clear_error();
        if self.config.record_ok_batches {
            self.write(batch)
        } else {
            self.delete(batch)?;
            Ok(())
        }
    }

    /// Records the ignored marker of a batch the sender's operator ignored.
    pub fn record_ignored(&self, batch: &mut Batch) -> CoreResult<()> {
        batch.status = BatchStatus::Ignored;
        self.write(batch)
    }

    /// Records a failed load. A row an operator resolved to `OK` or `IG`
    /// meanwhile is left alone and copied back into `batch`.
    pub fn record_failure(&self, batch: &mut Batch) -> CoreResult<()> {
        if let Some(current) = self.store.find_incoming(batch.batch_id, &batch.node_id)? {
            if matches!(current.status, BatchStatus::Ok | BatchStatus::Ignored) {
                tracing::info!(
                    batch = %batch.node_batch_id(),
                    status = %current.status,
                    "batch was resolved while loading, keeping its status"
                );
                *batch = current;
                return Ok(());
            }
        }
        batch.status = BatchStatus::Error;
        self.write(batch)?;
        tracing::warn!(
            batch = %batch.node_batch_id(),
            sql_state = ?batch.sql_state,
            sql_code = batch.sql_code,
            message = ?batch.sql_message,
            "failed to load batch"
        );
        Ok(())
    }

    /// Ack lines for the asked batch ids from `source_node_id`. Rows still
    /// loading or unknown are omitted.
    pub fn status_acks(
        &self,
        source_node_id: &str,
        batch_ids: &[BatchId],
        local_node_id: &str,
    ) -> CoreResult<Vec<BatchAck>> {
        let mut acks = Vec::with_capacity(batch_ids.len());
        for &batch_id in batch_ids {
            if let Some(batch) = self.store.find_incoming(batch_id, source_node_id)? {
                acks.extend(BatchAck::from_incoming(&batch, local_node_id));
            }
        }
        Ok(acks)
    }

    /// Batches currently in error.
    pub fn list_in_error(&self) -> CoreResult<Vec<Batch>> {
        Ok(self.store.incoming_with_status(&[BatchStatus::Error])?)
    }

    fn write(&self, batch: &mut Batch) -> CoreResult<()> {
        batch.derive_error_flag();
        self.stamp(batch);
        if !self.store.update_incoming(batch)? {
            self.store.insert_incoming(batch)?;
        }
        Ok(())
    }

    fn stamp(&self, batch: &mut Batch) {
        batch.last_update_host = Some(self.host.clone());
        batch.last_update_time = Some(self.clock.now());
    }
}
