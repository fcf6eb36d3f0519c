//! Applies receiver acknowledgments to the outgoing ledger.

use crate::error::CoreResult;
use crate::outgoing::OutgoingBatchService;
use nodesync_protocol::{decode_payload, Batch, BatchAck, BatchId, BatchStatus};
use nodesync_store::{outgoing_path, ResourceState, StagingManager};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Effect of one ack on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    /// The batch row was updated.
    Applied,
    /// The batch was already `OK`; nothing changed.
    AlreadyOk,
    /// No such batch in the ledger.
    Unknown,
}

/// Totals of one processed ack stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSummary {
    /// Batches acked `OK`.
    pub ok: usize,
    /// Batches acked in error.
    pub error: usize,
    /// Batches acked as ignored by the receiver.
    pub ignored: usize,
    /// Acks skipped because the batch was already `OK` or unknown.
    pub skipped: usize,
    /// Acks that could not be applied.
    pub failed: usize,
    /// Expected batches below the first error that were never acked.
    pub missing: Vec<BatchId>,
}

impl AckSummary {
    /// Returns true if any batch was acked in error.
    pub fn has_error(&self) -> bool {
        self.error > 0
    }
}

/// Acknowledgment protocol, sender side.
pub struct AcknowledgeService {
    outgoing: Arc<OutgoingBatchService>,
    staging: Arc<dyn StagingManager>,
}

impl AcknowledgeService {
    /// Creates the service.
    pub fn new(outgoing: Arc<OutgoingBatchService>, staging: Arc<dyn StagingManager>) -> Self {
        Self { outgoing, staging }
    }

    /// Applies one ack. A batch already `OK` is never rewritten.
    pub fn ack(&self, ack: &BatchAck) -> CoreResult<AckResult> {
        let Some(mut batch) = self.outgoing.find(ack.batch_id, &ack.node_id)? else {
            tracing::warn!(batch_id = ack.batch_id, node_id = %ack.node_id, "ack for unknown batch");
            return Ok(AckResult::Unknown);
        };
        if batch.status == BatchStatus::Ok {
            tracing::debug!(batch = %batch.node_batch_id(), "batch is already OK, ignoring ack");
            return Ok(AckResult::AlreadyOk);
        }

        batch.network_millis = ack.network_millis;
        batch.filter_millis = ack.filter_millis;
        batch.database_millis = ack.database_millis;
        // Line acks carry no byte count.
        if ack.byte_count > 0 {
            batch.byte_count = ack.byte_count;
        }
        if ack.is_ok {
            batch.status = BatchStatus::Ok;
            batch.clear_error();
            if ack.is_ignored {
                batch.ignore_count += 1;
            }
        } else {
            if batch.status != BatchStatus::Ignored {
                batch.status = BatchStatus::Error;
            }
            batch.sql_state = ack.sql_state.clone();
            batch.sql_code = ack.sql_code;
            batch.sql_message = ack.sql_message.clone();
            batch.failed_row_number = ack.error_line;
            batch.failed_line_number = ack.error_line;
            batch.failed_data_id = self.resolve_failed_data_id(&batch, ack.error_line);
            tracing::warn!(
                batch = %batch.node_batch_id(),
                error_line = ack.error_line,
                failed_data_id = batch.failed_data_id,
                sql_state = ?batch.sql_state,
                message = ?batch.sql_message,
                "receiver reported a batch in error"
            );
        }
        self.outgoing.update(&mut batch)?;

        if batch.status == BatchStatus::Ok {
            if let Some(resource) = self
                .staging
                .find(&outgoing_path(&batch.node_id, batch.batch_id))
            {
                resource.set_state(ResourceState::Done);
            }
        }
        Ok(AckResult::Applied)
    }

    /// Applies an ack stream for a session that sent `expected`.
    ///
    /// Acks are applied in ascending batch id order. An expected batch below
    /// the first error that got no ack was skipped by the receiver; its staged
    /// payload is dropped unless it belongs to a load.
    pub fn process_acks(&self, mut acks: Vec<BatchAck>, expected: &[Batch]) -> AckSummary {
        acks.sort_by_key(|ack| ack.batch_id);
        let first_error_id = acks
            .iter()
            .filter(|ack| !ack.is_ok)
            .map(|ack| ack.batch_id)
            .min()
            .unwrap_or(BatchId::MAX);

        let mut unacked: BTreeMap<BatchId, &Batch> =
            expected.iter().map(|b| (b.batch_id, b)).collect();
        let mut summary = AckSummary::default();

        for ack in &acks {
            unacked.remove(&ack.batch_id);
            match self.ack(ack) {
                Ok(AckResult::Applied) => {
                    if !ack.is_ok {
                        summary.error += 1;
                    } else if ack.is_ignored {
                        summary.ignored += 1;
                    } else {
                        summary.ok += 1;
                    }
                }
                Ok(AckResult::AlreadyOk | AckResult::Unknown) => summary.skipped += 1,
                Err(err) => {
                    tracing::error!(
                        batch_id = ack.batch_id,
                        node_id = %ack.node_id,
                        error = %err,
                        "failed to apply ack"
                    );
                    summary.failed += 1;
                }
            }
        }

        for (batch_id, batch) in unacked {
            if batch_id >= first_error_id {
                continue;
            }
            tracing::error!(
                batch = %batch.node_batch_id(),
                first_error_id,
                "batch was sent but never acknowledged"
            );
            summary.missing.push(batch_id);
            if batch.is_load_batch() {
                continue;
            }
            let path = outgoing_path(&batch.node_id, batch_id);
            match self.staging.remove(&path) {
                Ok(true) => tracing::warn!(path = %path, "removed staged payload of unacknowledged batch"),
                Ok(false) => {}
                Err(err) => tracing::error!(path = %path, error = %err, "failed to remove staged payload"),
            }
        }
        summary
    }

    fn resolve_failed_data_id(&self, batch: &Batch, error_line: u64) -> u64 {
        if error_line == 0 {
            return 0;
        }
        let path = outgoing_path(&batch.node_id, batch.batch_id);
        let Some(resource) = self.staging.find(&path) else {
            return 0;
        };
        let payloads = match resource.read_all() {
            Ok(bytes) => decode_payload(&bytes),
            Err(err) => {
                tracing::debug!(path = %path, error = %err, "cannot read staged payload");
                return 0;
            }
        };
        match payloads {
            Ok(payloads) => payloads
                .iter()
                .find(|p| p.batch_id == batch.batch_id)
                .and_then(|p| p.rows.get((error_line - 1) as usize))
                .map_or(0, |row| row.data_id),
            Err(err) => {
                tracing::debug!(path = %path, error = %err, "cannot decode staged payload");
                0
            }
        }
    }
}
