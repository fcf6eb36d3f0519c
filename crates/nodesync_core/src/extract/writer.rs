use crate::error::{CoreError, CoreResult};
use nodesync_protocol::{Batch, BatchStatus, CaptureRow, DataEventType, Frame};
use nodesync_store::{outgoing_path, ResourceState, StagedResource, StagingManager};
use std::sync::Arc;

/// Counters of the batch a writer is staging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStatistics {
    /// Rows written.
    pub rows: u64,
    /// Insert rows.
    pub inserts: u64,
    /// Update rows.
    pub updates: u64,
    /// Delete rows.
    pub deletes: u64,
    /// Tables started.
    pub tables: u64,
    /// Bytes staged.
    pub bytes: u64,
}

impl WriterStatistics {
    /// Copies the row counters into a ledger row.
    pub fn apply_to(&self, batch: &mut Batch) {
        batch.row_count = self.rows;
        batch.insert_count = self.inserts;
        batch.update_count = self.updates;
        batch.delete_count = self.deletes;
        batch.byte_count = self.bytes;
    }
}

/// Sink for a captured row stream.
pub trait DataWriter {
    /// Prepares the writer.
    fn open(&mut self) -> CoreResult<()>;

    /// Starts a batch.
    fn start_batch(&mut self, batch: &Batch) -> CoreResult<()>;

    /// Starts a table within the current batch.
    fn start_table(&mut self, table: &str) -> CoreResult<()>;

    /// Writes a row of the current table.
    fn write(&mut self, row: &CaptureRow) -> CoreResult<()>;

    /// Ends the current table.
    fn end_table(&mut self, table: &str) -> CoreResult<()>;

    /// Ends the current batch.
    fn end_batch(&mut self, batch: &Batch) -> CoreResult<()>;

    /// Releases the writer.
    fn close(&mut self) -> CoreResult<()>;

    /// Counters of the current or last batch.
    fn statistics(&self) -> &WriterStatistics;
}

/// Serializes batches into staged resources as payload frames.
pub struct StagingDataWriter {
    staging: Arc<dyn StagingManager>,
    source_node_id: String,
    memory_threshold: usize,
    resource: Option<Arc<dyn StagedResource>>,
    open_batch: Option<Batch>,
    statistics: WriterStatistics,
}

impl StagingDataWriter {
    /// Creates a writer staging batches produced by `source_node_id`.
    pub fn new(
        staging: Arc<dyn StagingManager>,
        source_node_id: impl Into<String>,
        memory_threshold: usize,
    ) -> Self {
        Self {
            staging,
            source_node_id: source_node_id.into(),
            memory_threshold,
            resource: None,
            open_batch: None,
            statistics: WriterStatistics::default(),
        }
    }

    /// Resource of the current or last batch.
    pub fn resource(&self) -> Option<Arc<dyn StagedResource>> {
        self.resource.clone()
    }

    /// Returns true while a batch is open.
    pub fn is_batch_open(&self) -> bool {
        self.open_batch.is_some()
    }

    /// Removes the resource of an unfinished batch.
    pub fn discard(&mut self) -> CoreResult<()> {
        if let Some(batch) = self.open_batch.take() {
            let path = outgoing_path(&batch.node_id, batch.batch_id);
            self.staging.remove(&path)?;
            self.resource = None;
            tracing::debug!(path = %path, "discarded partial staged batch");
        }
        Ok(())
    }

    fn emit(&mut self, frame: &Frame) -> CoreResult<()> {
        let resource = match (&self.resource, &self.open_batch) {
            (Some(resource), Some(_)) => resource,
            _ => {
                return Err(CoreError::InvalidArgument(
                    "no batch is open on the staging writer".into(),
                ))
            }
        };
        let line = frame.encode_line()?;
        resource.append(&line)?;
        self.statistics.bytes += line.len() as u64;
        Ok(())
    }
}

impl DataWriter for StagingDataWriter {
    fn open(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn start_batch(&mut self, batch: &Batch) -> CoreResult<()> {
        if let Some(open) = &self.open_batch {
            return Err(CoreError::InvalidArgument(format!(
                "batch {} started while {} is open",
                batch.node_batch_id(),
                open.node_batch_id()
            )));
        }
        let path = outgoing_path(&batch.node_id, batch.batch_id);
        let resource = self.staging.create(&path, self.memory_threshold)?;
        resource.set_state(ResourceState::Create);
        self.resource = Some(resource);
        self.open_batch = Some(batch.clone());
        self.statistics = WriterStatistics::default();
        self.emit(&Frame::Batch {
            batch_id: batch.batch_id,
            source_node_id: self.source_node_id.clone(),
            channel_id: batch.channel_id.clone(),
            load_id: batch.load_id,
            ignored: batch.status == BatchStatus::Ignored,
        })
    }

    fn start_table(&mut self, table: &str) -> CoreResult<()> {
        self.emit(&Frame::Table {
            name: table.to_string(),
        })?;
        self.statistics.tables += 1;
        Ok(())
    }

    fn write(&mut self, row: &CaptureRow) -> CoreResult<()> {
        self.emit(&Frame::Row {
            data_id: row.data_id,
            event: row.event,
            data: row.data.clone(),
            old_data: row.old_data.clone(),
        })?;
        self.statistics.rows += 1;
        match row.event {
            DataEventType::Insert => self.statistics.inserts += 1,
            DataEventType::Update => self.statistics.updates += 1,
            DataEventType::Delete => self.statistics.deletes += 1,
        }
        Ok(())
    }

    fn end_table(&mut self, _table: &str) -> CoreResult<()> {
        Ok(())
    }

    fn end_batch(&mut self, batch: &Batch) -> CoreResult<()> {
        self.emit(&Frame::Commit {
            batch_id: batch.batch_id,
        })?;
        if let Some(resource) = &self.resource {
            resource.set_state(ResourceState::Ready);
        }
        self.open_batch = None;
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        if self.open_batch.is_some() {
            tracing::warn!("closing staging writer with an unfinished batch");
            self.discard()?;
        }
        Ok(())
    }

    fn statistics(&self) -> &WriterStatistics {
        &self.statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_protocol::{decode_payload, ManualClock, Timestamp};
    use nodesync_store::LocalStagingManager;

    fn staging() -> Arc<LocalStagingManager> {
        Arc::new(LocalStagingManager::in_memory(Arc::new(ManualClock::new(
            Timestamp::from_millis(0),
        ))))
    }

    #[test]
    fn stages_decodable_batch() {
        let staging = staging();
        let mut writer = StagingDataWriter::new(staging.clone(), "N1", 1024);
        let batch = Batch::new(11, "N2", "default", BatchStatus::Querying);

        writer.open().unwrap();
        writer.start_batch(&batch).unwrap();
        writer.start_table("item").unwrap();
        writer
            .write(&CaptureRow::insert(1, "item", vec![Some("a".into())]))
            .unwrap();
        let mut update = CaptureRow::insert(2, "item", vec![Some("b".into())]);
        update.event = DataEventType::Update;
        writer.write(&update).unwrap();
        writer.end_table("item").unwrap();
        writer.end_batch(&batch).unwrap();
        writer.close().unwrap();

        let stats = writer.statistics().clone();
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.updates, 1);

        let resource = writer.resource().unwrap();
        assert_eq!(resource.state(), ResourceState::Ready);
        assert_eq!(resource.size(), stats.bytes);

        let payloads = decode_payload(&resource.read_all().unwrap()).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].source_node_id, "N1");
        assert_eq!(payloads[0].rows[1].data_id, 2);
        assert_eq!(payloads[0].rows[1].table, "item");
    }

    #[test]
    fn ignored_batch_is_a_marker() {
        let staging = staging();
        let mut writer = StagingDataWriter::new(staging, "N1", 1024);
        let batch = Batch::new(12, "N2", "default", BatchStatus::Ignored);
        writer.start_batch(&batch).unwrap();
        writer.end_batch(&batch).unwrap();

        let payloads = decode_payload(&writer.resource().unwrap().read_all().unwrap()).unwrap();
        assert!(payloads[0].ignored);
        assert!(payloads[0].rows.is_empty());
    }

    #[test]
    fn write_without_batch_fails() {
        let mut writer = StagingDataWriter::new(staging(), "N1", 1024);
        assert!(writer.start_table("item").is_err());
    }

    #[test]
    fn close_discards_unfinished_batch() {
        let staging = staging();
        let mut writer = StagingDataWriter::new(staging.clone(), "N1", 1024);
        let batch = Batch::new(13, "N2", "default", BatchStatus::Querying);
        writer.start_batch(&batch).unwrap();
        writer.start_table("item").unwrap();
        writer.close().unwrap();
        assert!(staging.find(&outgoing_path("N2", 13)).is_none());
    }
}
