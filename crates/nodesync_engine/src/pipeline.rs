//! Extract stage shared by push sessions and pull serving.
//!
//! The extract stage stages pending batches one by one and hands each to a
//! sink. Push runs it on a blocking thread feeding a bounded channel that the
//! transport stage drains; the channel ends with [`StagedItem::EndOfMeasurement`].

use crate::error::EngineResult;
use nodesync_core::NodeServices;
use nodesync_protocol::{Batch, BatchStatus, Frame};
use tokio::sync::mpsc;

/// A staged batch ready to be sent.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    /// Ledger row after staging.
    pub batch: Batch,
    /// Staged frames.
    pub payload: Vec<u8>,
}

/// Item handed from the extract stage to the transport stage.
#[derive(Debug)]
pub enum StagedItem {
    /// A staged batch.
    Batch(StagedBatch),
    /// No more batches for this session.
    EndOfMeasurement,
}

/// Frames telling the receiver a batch was ignored by an operator.
pub fn ignored_marker(batch: &Batch, source_node_id: &str) -> EngineResult<Vec<u8>> {
    let mut payload = Frame::Batch {
        batch_id: batch.batch_id,
        source_node_id: source_node_id.to_string(),
        channel_id: batch.channel_id.clone(),
        load_id: batch.load_id,
        ignored: true,
    }
    .encode_line()?;
    payload.extend(
        Frame::Commit {
            batch_id: batch.batch_id,
        }
        .encode_line()?,
    );
    Ok(payload)
}

/// Stages `batches` in order and passes each to `sink` until the byte
/// budget is spent or `sink` returns false.
///
/// Staged batches move to `SE` with their send count raised. Ignored
/// batches keep their status and are sent as an ignored marker.
pub fn stage_batches(
    services: &NodeServices,
    batches: Vec<Batch>,
    max_bytes: u64,
    mut sink: impl FnMut(StagedBatch) -> bool,
) -> EngineResult<()> {
    let local_node_id = services.local_node_id();
    let mut staged_bytes = 0u64;
    for mut batch in batches {
        if staged_bytes >= max_bytes {
            tracing::debug!(
                node_id = %batch.node_id,
                staged_bytes,
                max_bytes,
                "byte budget reached, remaining batches wait for the next session"
            );
            break;
        }

        let payload = if batch.status == BatchStatus::Ignored {
            ignored_marker(&batch, &local_node_id)?
        } else {
            let resource = services.extractor.extract_batch(&mut batch)?;
            resource.read_all()?
        };
        staged_bytes += payload.len() as u64;

        if batch.status != BatchStatus::Ignored {
            batch.status = BatchStatus::Sending;
            batch.sent_count += 1;
            services.outgoing.update(&mut batch)?;
        }
        if !sink(StagedBatch { batch, payload }) {
            break;
        }
    }
    Ok(())
}

/// Runs the extract stage into `tx`, always ending with the sentinel.
pub(crate) fn extract_stage(
    services: &NodeServices,
    batches: Vec<Batch>,
    max_bytes: u64,
    tx: mpsc::Sender<StagedItem>,
) -> EngineResult<()> {
    let result = stage_batches(services, batches, max_bytes, |staged| {
        tx.blocking_send(StagedItem::Batch(staged)).is_ok()
    });
    // The transport stage may already be gone.
    let _ = tx.blocking_send(StagedItem::EndOfMeasurement);
    result
}
