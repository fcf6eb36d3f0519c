//! Receiving side: loads delivered payloads through the incoming ledger.

use crate::error::CoreResult;
use crate::incoming::{Admission, IncomingBatchService};
use nodesync_protocol::{
    decode_payload, Batch, BatchAck, BatchPayload, BatchStatus, CaptureRow, Clock,
    DataEventType, CONFLICT_STATE, DEADLOCK_STATE, FK_VIOLATION_STATE,
};
use std::sync::Arc;

/// Longest sql state kept on a ledger row.
const MAX_SQL_STATE_LEN: usize = 10;

/// Classification of a failed load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailureKind {
    /// Row conflicted with local data.
    Conflict,
    /// Foreign key violation.
    ForeignKey,
    /// Deadlock with another transaction.
    Deadlock,
    /// Any other database error.
    Sql {
        /// Database sql state.
        state: Option<String>,
        /// Vendor error code.
        code: i32,
    },
    /// Failure outside the database.
    Io,
}

/// A failed load reported by a [`BatchApplier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    /// Classification.
    pub kind: LoadFailureKind,
    /// 1-based row within the batch, 0 if unknown.
    pub row_number: u64,
    /// Error message.
    pub message: String,
}

impl LoadFailure {
    /// Creates a failure.
    pub fn new(kind: LoadFailureKind, row_number: u64, message: impl Into<String>) -> Self {
        Self {
            kind,
            row_number,
            message: message.into(),
        }
    }

    /// Creates an I/O failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(LoadFailureKind::Io, 0, message)
    }

    /// Writes the diagnostics onto a ledger row.
    pub fn apply_to(&self, batch: &mut Batch) {
        batch.sql_message = Some(self.message.clone());
        let (state, code) = match &self.kind {
            LoadFailureKind::Conflict => (Some(CONFLICT_STATE.to_string()), 0),
            LoadFailureKind::ForeignKey => (Some(FK_VIOLATION_STATE.to_string()), 0),
            LoadFailureKind::Deadlock => (Some(DEADLOCK_STATE.to_string()), 0),
            LoadFailureKind::Sql { state, code } => (
                state
                    .as_ref()
                    .map(|s| s.chars().take(MAX_SQL_STATE_LEN).collect()),
                *code,
            ),
            LoadFailureKind::Io => (None, 0),
        };
        batch.sql_state = state;
        batch.sql_code = code;
        if self.kind != LoadFailureKind::Io {
            batch.failed_row_number = self.row_number;
            batch.failed_line_number = self.row_number;
        }
    }
}

/// Applies the rows of one batch to the local database.
pub trait BatchApplier: Send + Sync {
    /// Applies `rows` atomically.
    fn apply(&self, batch: &Batch, rows: &[CaptureRow]) -> Result<(), LoadFailure>;
}

/// Outcome of one delivered batch.
#[derive(Debug, Clone)]
pub struct LoadedBatch {
    /// Ledger view of the batch after loading.
    pub batch: Batch,
    /// Admission decision.
    pub admission: Admission,
}

impl LoadedBatch {
    /// The ack reported back to the sender.
    pub fn ack(&self, local_node_id: &str) -> Option<BatchAck> {
        if self.admission == Admission::Ignored {
            let mut ack = BatchAck::ignored(self.batch.batch_id, local_node_id);
            ack.byte_count = self.batch.byte_count;
            return Some(ack);
        }
        BatchAck::from_incoming(&self.batch, local_node_id)
    }
}

/// Loads payloads and records every outcome in the incoming ledger.
pub struct DataLoaderService {
    incoming: Arc<IncomingBatchService>,
    applier: Arc<dyn BatchApplier>,
    clock: Arc<dyn Clock>,
    local_node_id: String,
}

impl DataLoaderService {
    /// Creates the loader for `local_node_id`.
    pub fn new(
        incoming: Arc<IncomingBatchService>,
        applier: Arc<dyn BatchApplier>,
        clock: Arc<dyn Clock>,
        local_node_id: impl Into<String>,
    ) -> Self {
        Self {
            incoming,
            applier,
            clock,
            local_node_id: local_node_id.into(),
        }
    }

    /// Id of the local node, used in acks.
    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Loads every batch of a payload in order, stopping at the first
    /// failure. A payload that cannot be decoded has no batch to record the
    /// error on and is returned as an error.
    pub fn load_payload(&self, payload: &[u8]) -> CoreResult<Vec<LoadedBatch>> {
        let batches = decode_payload(payload)?;
        let mut loaded = Vec::with_capacity(batches.len());
        for payload in batches {
            let result = self.load_batch(payload)?;
            let failed = result.batch.status == BatchStatus::Error;
            loaded.push(result);
            if failed {
                break;
            }
        }
        Ok(loaded)
    }

    /// Acks for loaded batches.
    pub fn acks_for(&self, loaded: &[LoadedBatch]) -> Vec<BatchAck> {
        loaded
            .iter()
            .filter_map(|l| l.ack(&self.local_node_id))
            .collect()
    }

    fn load_batch(&self, payload: BatchPayload) -> CoreResult<LoadedBatch> {
        let mut batch = Batch::new(
            payload.batch_id,
            payload.source_node_id.clone(),
            payload.channel_id.clone(),
            BatchStatus::Loading,
        );
        batch.load_id = payload.load_id;
        batch.row_count = payload.rows.len() as u64;

        let admission = self.incoming.acquire(&mut batch)?;
        if !admission.should_load() {
            return Ok(LoadedBatch { batch, admission });
        }
        if payload.ignored {
            self.incoming.record_ignored(&mut batch)?;
            tracing::info!(batch = %batch.node_batch_id(), "sender ignored batch");
            return Ok(LoadedBatch { batch, admission });
        }

        let started = self.clock.now();
        let outcome = self.applier.apply(&batch, &payload.rows);
        batch.database_millis = self.clock.now().since(started).as_millis() as u64;
        match outcome {
            Ok(()) => {
                for row in &payload.rows {
                    match row.event {
                        DataEventType::Insert => batch.insert_count += 1,
                        DataEventType::Update => batch.update_count += 1,
                        DataEventType::Delete => batch.delete_count += 1,
                    }
                }
                self.incoming.record_loaded(&mut batch)?;
                tracing::debug!(batch = %batch.node_batch_id(), rows = batch.row_count, "loaded batch");
            }
            Err(failure) => {
                failure.apply_to(&mut batch);
                self.incoming.record_failure(&mut batch)?;
            }
        }
        Ok(LoadedBatch { batch, admission })
    }
}
