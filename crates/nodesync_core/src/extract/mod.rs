//! Staging extractor.
//!
//! Captured rows are serialized into staged resources, one per outgoing
//! batch. [`StagingDataWriter`] stages one batch at a time;
//! [`MultiBatchStagingWriter`] spreads a single load stream over the
//! placeholder batches of an extract request.

mod multi;
mod service;
mod writer;

pub use multi::MultiBatchStagingWriter;
pub use service::DataExtractorService;
pub use writer::{DataWriter, StagingDataWriter, WriterStatistics};

use crate::error::CoreResult;
use nodesync_protocol::{Batch, CaptureRow, ExtractRequest};

/// An ordered stream of captured rows.
pub type RowStream<'a> = Box<dyn Iterator<Item = CoreResult<CaptureRow>> + Send + 'a>;

/// Supplies captured rows to the extractor.
pub trait CaptureReader: Send + Sync {
    /// Rows routed to one batch, table by table.
    fn batch_rows(&self, batch: &Batch) -> CoreResult<RowStream<'_>>;

    /// Rows of a reload request, table by table.
    fn load_rows(&self, request: &ExtractRequest) -> CoreResult<RowStream<'_>>;
}

/// Feeds a row stream into a writer, opening and closing tables as the
/// stream moves between them. Returns the number of rows written.
pub fn transfer(writer: &mut dyn DataWriter, rows: RowStream<'_>) -> CoreResult<u64> {
    let mut table: Option<String> = None;
    let mut count = 0;
    for row in rows {
        let row = row?;
        if table.as_deref() != Some(row.table.as_str()) {
            if let Some(previous) = table.take() {
                writer.end_table(&previous)?;
            }
            writer.start_table(&row.table)?;
            table = Some(row.table.clone());
        }
        writer.write(&row)?;
        count += 1;
    }
    if let Some(previous) = table {
        writer.end_table(&previous)?;
    }
    Ok(count)
}
