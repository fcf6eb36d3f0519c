use super::writer::{DataWriter, StagingDataWriter, WriterStatistics};
use crate::config::ExtractConfig;
use crate::error::{CoreError, CoreResult};
use crate::outgoing::OutgoingBatchService;
use nodesync_protocol::{
    renumber_payload, Batch, BatchStatus, CaptureRow, Clock, ExtractRequest, Timestamp,
};
use nodesync_store::{outgoing_path, ResourceState, StagingManager};
use std::collections::VecDeque;
use std::sync::Arc;

/// Writes one load stream across the placeholder batches of an extract
/// request, moving to the next batch whenever the row bound is reached.
///
/// Batches are staged lazily: a placeholder that never receives a table is
/// marked `OK` without producing a staged resource. Finished batches stay
/// `RQ` until the whole request is staged, unless send-when-staged is on.
///
/// Each finished batch is also copied to the batch at the same offset of
/// every child request.
pub struct MultiBatchStagingWriter {
    outgoing: Arc<OutgoingBatchService>,
    staging: Arc<dyn StagingManager>,
    clock: Arc<dyn Clock>,
    config: ExtractConfig,
    request: ExtractRequest,
    children: Vec<ExtractRequest>,
    inner: StagingDataWriter,
    pending: VecDeque<Batch>,
    finished: Vec<Batch>,
    copies: Vec<Batch>,
    current: Option<Batch>,
    table: Option<String>,
    batch_started: Timestamp,
    last_progress: Timestamp,
    total_rows: u64,
    total_bytes: u64,
}

impl MultiBatchStagingWriter {
    /// Creates a writer over `batches`, which must be ordered by id.
    pub fn new(
        outgoing: Arc<OutgoingBatchService>,
        staging: Arc<dyn StagingManager>,
        clock: Arc<dyn Clock>,
        config: ExtractConfig,
        source_node_id: &str,
        request: ExtractRequest,
        batches: Vec<Batch>,
    ) -> Self {
        let inner = StagingDataWriter::new(
            Arc::clone(&staging),
            source_node_id,
            config.memory_threshold,
        );
        let now = clock.now();
        Self {
            outgoing,
            staging,
            clock,
            config,
            request,
            children: Vec::new(),
            inner,
            pending: batches.into(),
            finished: Vec::new(),
            copies: Vec::new(),
            current: None,
            table: None,
            batch_started: now,
            last_progress: now,
            total_rows: 0,
            total_bytes: 0,
        }
    }

    /// Stages the batches of `children` from this request's batches.
    pub fn with_children(mut self, children: Vec<ExtractRequest>) -> Self {
        self.children = children;
        self
    }

    /// Batches staged so far.
    pub fn finished_batches(&self) -> &[Batch] {
        &self.finished
    }

    /// Child request batches staged so far.
    pub fn copied_batches(&self) -> &[Batch] {
        &self.copies
    }

    /// Drops the partial batch after a failure.
    pub fn abort(&mut self) -> CoreResult<()> {
        self.table = None;
        self.current = None;
        self.inner.discard()
    }

    fn begin_current(&mut self) -> CoreResult<()> {
        let batch = self.current.as_ref().ok_or_else(|| {
            CoreError::InvalidArgument(format!(
                "extract request {} has no batch left to write",
                self.request.request_id
            ))
        })?;
        self.inner.start_batch(batch)?;
        self.batch_started = self.clock.now();
        Ok(())
    }

    fn rotate(&mut self) -> CoreResult<()> {
        let table = self.table.clone();
        if let Some(table) = &table {
            self.inner.end_table(table)?;
        }
        self.finish_current()?;
        self.current = self.pending.pop_front();
        self.begin_current()?;
        if let Some(table) = &table {
            self.inner.start_table(table)?;
        }
        Ok(())
    }

    fn finish_current(&mut self) -> CoreResult<()> {
        let Some(mut batch) = self.current.take() else {
            return Ok(());
        };
        if !self.inner.is_batch_open() {
            return self.skip_empty(batch);
        }
        self.inner.end_batch(&batch)?;
        let stats = self.inner.statistics().clone();
        stats.apply_to(&mut batch);
        batch.extract_count += 1;
        batch.extract_millis = self.clock.now().since(self.batch_started).as_millis() as u64;
        self.total_rows += stats.rows;
        self.total_bytes += stats.bytes;

        batch.status = if self.config.send_when_staged {
            BatchStatus::New
        } else {
            BatchStatus::Requested
        };
        if !self.outgoing.update_if(&mut batch, BatchStatus::Requested)? {
            return Err(self.cancel_resolved(&batch)?);
        }
        self.copy_to_children(&batch, &stats)?;

        for earlier in self.finished.iter().chain(&self.copies) {
            if let Some(resource) = self
                .staging
                .find(&outgoing_path(&earlier.node_id, earlier.batch_id))
            {
                resource.refresh_last_update_time();
            }
        }
        self.finished.push(batch);
        Ok(())
    }

    fn copy_to_children(&mut self, parent: &Batch, stats: &WriterStatistics) -> CoreResult<()> {
        if self.children.is_empty() {
            return Ok(());
        }
        let parent_path = outgoing_path(&parent.node_id, parent.batch_id);
        let bytes = match self.staging.find(&parent_path) {
            Some(resource) => resource.read_all()?,
            None => return Err(CoreError::StagedResourceMissing(parent_path)),
        };
        let offset = parent.batch_id - self.request.start_batch_id;

        for child in &self.children {
            let batch_id = child.start_batch_id + offset;
            if !child.contains(batch_id) {
                continue;
            }
            let mut copy = self.outgoing.get(batch_id, &child.node_id)?;
            if copy.status != BatchStatus::Requested {
                tracing::debug!(
                    batch = %copy.node_batch_id(),
                    status = %copy.status,
                    "child batch is already resolved, not copying"
                );
                continue;
            }

            let path = outgoing_path(&copy.node_id, copy.batch_id);
            let payload = renumber_payload(&bytes, copy.batch_id, copy.load_id)?;
            let resource = self.staging.create(&path, self.config.memory_threshold)?;
            resource.append(&payload)?;
            resource.set_state(ResourceState::Ready);

            stats.apply_to(&mut copy);
            copy.byte_count = payload.len() as u64;
            copy.extract_count += 1;
            copy.extract_millis = parent.extract_millis;
            copy.status = if self.config.send_when_staged {
                BatchStatus::New
            } else {
                BatchStatus::Requested
            };
            if !self.outgoing.update_if(&mut copy, BatchStatus::Requested)? {
                self.staging.remove(&path)?;
                continue;
            }
            tracing::debug!(
                from = %parent.node_batch_id(),
                to = %copy.node_batch_id(),
                "copied staged batch to child request"
            );
            self.copies.push(copy);
        }
        Ok(())
    }

    fn cancel_resolved(&self, batch: &Batch) -> CoreResult<CoreError> {
        let current = self.outgoing.get(batch.batch_id, &batch.node_id)?;
        self.staging
            .remove(&outgoing_path(&batch.node_id, batch.batch_id))?;
        tracing::info!(
            batch = %batch.node_batch_id(),
            status = %current.status,
            "batch was resolved while extracting, cancelling the load extract"
        );
        Ok(CoreError::Cancelled {
            batch_id: batch.batch_id,
            node_id: batch.node_id.clone(),
        })
    }

    fn skip_empty(&mut self, mut batch: Batch) -> CoreResult<()> {
        tracing::info!(
            batch = %batch.node_batch_id(),
            request_id = self.request.request_id,
            "no rows left for batch, marking it OK without staging"
        );
        batch.status = BatchStatus::Ok;
        self.outgoing.update_if(&mut batch, BatchStatus::Requested)?;
        Ok(())
    }

    fn release_finished(&mut self) -> CoreResult<()> {
        let finished = std::mem::take(&mut self.finished);
        self.finished = self.release(finished)?;
        let copies = std::mem::take(&mut self.copies);
        self.copies = self.release(copies)?;
        Ok(())
    }

    /// Moves staged `RQ` batches to `NE`, dropping the ones resolved meanwhile.
    fn release(&self, batches: Vec<Batch>) -> CoreResult<Vec<Batch>> {
        let mut released = Vec::with_capacity(batches.len());
        for mut batch in batches {
            batch.status = BatchStatus::New;
            if self.outgoing.update_if(&mut batch, BatchStatus::Requested)? {
                released.push(batch);
                continue;
            }
            self.staging
                .remove(&outgoing_path(&batch.node_id, batch.batch_id))?;
            tracing::info!(
                batch = %batch.node_batch_id(),
                "batch was resolved after staging, not releasing it"
            );
        }
        Ok(released)
    }

    fn log_progress(&mut self) {
        let now = self.clock.now();
        if now.since(self.last_progress) < self.config.progress_interval {
            return;
        }
        self.last_progress = now;
        tracing::info!(
            request_id = self.request.request_id,
            node_id = %self.request.node_id,
            batches = self.finished.len(),
            remaining = self.pending.len(),
            rows = self.total_rows + self.inner.statistics().rows,
            bytes = self.total_bytes + self.inner.statistics().bytes,
            "extract in progress"
        );
    }
}

impl DataWriter for MultiBatchStagingWriter {
    fn open(&mut self) -> CoreResult<()> {
        self.current = self.pending.pop_front();
        if self.current.is_none() {
            return Err(CoreError::InvalidArgument(format!(
                "extract request {} has no batches",
                self.request.request_id
            )));
        }
        Ok(())
    }

    fn start_batch(&mut self, _batch: &Batch) -> CoreResult<()> {
        Ok(())
    }

    fn start_table(&mut self, table: &str) -> CoreResult<()> {
        if !self.inner.is_batch_open() {
            self.begin_current()?;
        }
        self.inner.start_table(table)?;
        self.table = Some(table.to_string());
        Ok(())
    }

    fn write(&mut self, row: &CaptureRow) -> CoreResult<()> {
        if self.inner.statistics().rows >= self.config.max_rows_per_batch
            && !self.pending.is_empty()
        {
            self.rotate()?;
        }
        self.inner.write(row)?;
        self.log_progress();
        Ok(())
    }

    fn end_table(&mut self, table: &str) -> CoreResult<()> {
        self.inner.end_table(table)?;
        self.table = None;
        Ok(())
    }

    fn end_batch(&mut self, _batch: &Batch) -> CoreResult<()> {
        Ok(())
    }

    fn close(&mut self) -> CoreResult<()> {
        if let Some(table) = self.table.take() {
            self.inner.end_table(&table)?;
        }
        self.finish_current()?;
        while let Some(batch) = self.pending.pop_front() {
            self.skip_empty(batch)?;
        }
        if !self.config.send_when_staged {
            self.release_finished()?;
        }
        self.inner.close()?;
        tracing::info!(
            request_id = self.request.request_id,
            node_id = %self.request.node_id,
            batches = self.finished.len(),
            copies = self.copies.len(),
            rows = self.total_rows,
            bytes = self.total_bytes,
            "extract request staged"
        );
        Ok(())
    }

    fn statistics(&self) -> &WriterStatistics {
        self.inner.statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SequenceConfig;
    use crate::extract::{transfer, RowStream};
    use crate::sequence::SequenceService;
    use nodesync_protocol::{decode_payload, ExtractStatus, ManualClock};
    use nodesync_store::{LocalStagingManager, MemoryStore, OutgoingBatchStore};
    use proptest::prelude::*;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        staging: Arc<LocalStagingManager>,
        clock: Arc<ManualClock>,
        outgoing: Arc<OutgoingBatchService>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let sequences = Arc::new(SequenceService::new(
            store.clone(),
            clock.clone(),
            SequenceConfig::default(),
        ));
        let outgoing = Arc::new(OutgoingBatchService::new(
            store.clone(),
            sequences,
            clock.clone(),
            "sender",
        ));
        let staging = Arc::new(LocalStagingManager::in_memory(clock.clone()));
        Fixture {
            store,
            staging,
            clock,
            outgoing,
        }
    }

    fn placeholders(fx: &Fixture, count: u64) -> (ExtractRequest, Vec<Batch>) {
        let batches: Vec<Batch> = (1..=count)
            .map(|id| {
                let mut batch =
                    Batch::new(id, "N2", "reload", BatchStatus::Requested).with_load_id(3);
                fx.outgoing.insert(&mut batch).unwrap();
                batch
            })
            .collect();
        let request = ExtractRequest {
            request_id: 1,
            node_id: "N2".into(),
            channel_id: "reload".into(),
            status: ExtractStatus::New,
            start_batch_id: 1,
            end_batch_id: count,
            load_id: 3,
            trigger_id: "item".into(),
            router_id: "corp_to_store".into(),
            last_update_time: None,
            create_time: None,
            parent_request_id: None,
        };
        (request, batches)
    }

    fn multi_writer(fx: &Fixture, config: ExtractConfig, count: u64) -> MultiBatchStagingWriter {
        let (request, batches) = placeholders(fx, count);
        MultiBatchStagingWriter::new(
            Arc::clone(&fx.outgoing),
            fx.staging.clone(),
            fx.clock.clone(),
            config,
            "N1",
            request,
            batches,
        )
    }

    fn rows(tables: &[(&str, u64)]) -> RowStream<'static> {
        let mut data_id = 0;
        let mut all: Vec<CoreResult<CaptureRow>> = Vec::new();
        for (table, count) in tables {
            for _ in 0..*count {
                data_id += 1;
                all.push(Ok(CaptureRow::insert(data_id, *table, vec![Some(data_id.to_string())])));
            }
        }
        Box::new(all.into_iter())
    }

    fn run(writer: &mut MultiBatchStagingWriter, stream: RowStream<'_>) -> CoreResult<u64> {
        writer.open()?;
        let count = transfer(writer, stream)?;
        writer.close()?;
        Ok(count)
    }

    fn staged_rows(fx: &Fixture, batch_id: u64) -> Option<usize> {
        let resource = fx.staging.find(&outgoing_path("N2", batch_id))?;
        let payloads = decode_payload(&resource.read_all().unwrap()).unwrap();
        Some(payloads[0].rows.len())
    }

    #[test]
    fn splits_stream_at_row_bound() {
        let fx = fixture();
        let config = ExtractConfig::default().with_max_rows_per_batch(3);
        let mut writer = multi_writer(&fx, config, 4);
        assert_eq!(run(&mut writer, rows(&[("a", 4), ("b", 3)])).unwrap(), 7);

        assert_eq!(staged_rows(&fx, 1), Some(3));
        assert_eq!(staged_rows(&fx, 2), Some(3));
        assert_eq!(staged_rows(&fx, 3), Some(1));
        assert_eq!(staged_rows(&fx, 4), None);

        let ledger = fx.store.outgoing_for_load(3).unwrap();
        assert_eq!(ledger[0].status, BatchStatus::New);
        assert_eq!(ledger[0].row_count, 3);
        assert_eq!(ledger[2].row_count, 1);
        assert_eq!(ledger[3].status, BatchStatus::Ok);
    }

    #[test]
    fn table_continues_across_batches() {
        let fx = fixture();
        let config = ExtractConfig::default().with_max_rows_per_batch(2);
        let mut writer = multi_writer(&fx, config, 2);
        run(&mut writer, rows(&[("a", 3)])).unwrap();

        let resource = fx.staging.find(&outgoing_path("N2", 2)).unwrap();
        let payloads = decode_payload(&resource.read_all().unwrap()).unwrap();
        assert_eq!(payloads[0].rows[0].table, "a");
        assert_eq!(payloads[0].rows[0].data_id, 3);
    }

    #[test]
    fn last_batch_absorbs_overflow() {
        let fx = fixture();
        let config = ExtractConfig::default().with_max_rows_per_batch(2);
        let mut writer = multi_writer(&fx, config, 2);
        run(&mut writer, rows(&[("a", 5)])).unwrap();
        assert_eq!(staged_rows(&fx, 1), Some(2));
        assert_eq!(staged_rows(&fx, 2), Some(3));
    }

    #[test]
    fn empty_stream_stages_nothing() {
        let fx = fixture();
        let mut writer = multi_writer(&fx, ExtractConfig::default(), 2);
        run(&mut writer, rows(&[])).unwrap();
        assert!(fx.staging.is_empty());
        assert!(fx
            .store
            .outgoing_for_load(3)
            .unwrap()
            .iter()
            .all(|b| b.status == BatchStatus::Ok));
    }

    #[test]
    fn batches_wait_for_the_request_unless_send_when_staged() {
        let fx = fixture();
        let config = ExtractConfig::default().with_max_rows_per_batch(1);
        let mut writer = multi_writer(&fx, config, 2);
        writer.open().unwrap();
        writer.start_table("a").unwrap();
        writer.write(&CaptureRow::insert(1, "a", vec![])).unwrap();
        writer.write(&CaptureRow::insert(2, "a", vec![])).unwrap();
        assert_eq!(
            fx.store.find_outgoing(1, "N2").unwrap().unwrap().status,
            BatchStatus::Requested
        );
        writer.close().unwrap();
        assert_eq!(
            fx.store.find_outgoing(1, "N2").unwrap().unwrap().status,
            BatchStatus::New
        );

        let fx = fixture();
        let config = ExtractConfig::default()
            .with_max_rows_per_batch(1)
            .with_send_when_staged(true);
        let mut writer = multi_writer(&fx, config, 2);
        writer.open().unwrap();
        writer.start_table("a").unwrap();
        writer.write(&CaptureRow::insert(1, "a", vec![])).unwrap();
        writer.write(&CaptureRow::insert(2, "a", vec![])).unwrap();
        assert_eq!(
            fx.store.find_outgoing(1, "N2").unwrap().unwrap().status,
            BatchStatus::New
        );
    }

    #[test]
    fn cancelled_load_is_not_released() {
        let fx = fixture();
        let config = ExtractConfig::default().with_max_rows_per_batch(1);
        let mut writer = multi_writer(&fx, config, 2);
        writer.open().unwrap();
        writer.start_table("a").unwrap();
        writer.write(&CaptureRow::insert(1, "a", vec![])).unwrap();
        writer.write(&CaptureRow::insert(2, "a", vec![])).unwrap();

        assert_eq!(fx.outgoing.cancel_load_batches(3).unwrap(), 2);
        let err = writer.close().unwrap_err();
        assert!(err.is_cancellation());

        let statuses: Vec<_> = fx
            .store
            .outgoing_for_load(3)
            .unwrap()
            .iter()
            .map(|b| b.status)
            .collect();
        assert_eq!(statuses, vec![BatchStatus::Ok, BatchStatus::Ok]);
        assert!(fx.staging.find(&outgoing_path("N2", 2)).is_none());
    }

    #[test]
    fn batch_resolved_after_staging_stays_resolved() {
        let fx = fixture();
        let config = ExtractConfig::default().with_max_rows_per_batch(1);
        let mut writer = multi_writer(&fx, config, 3);
        writer.open().unwrap();
        writer.start_table("a").unwrap();
        writer.write(&CaptureRow::insert(1, "a", vec![])).unwrap();
        writer.write(&CaptureRow::insert(2, "a", vec![])).unwrap();

        fx.outgoing
            .operator_resolve(1, "N2", BatchStatus::Ok)
            .unwrap();
        writer.end_table("a").unwrap();
        writer.close().unwrap();

        let statuses: Vec<_> = fx
            .store
            .outgoing_for_load(3)
            .unwrap()
            .iter()
            .map(|b| b.status)
            .collect();
        assert_eq!(
            statuses,
            vec![BatchStatus::Ok, BatchStatus::New, BatchStatus::Ok]
        );
        assert!(fx.staging.find(&outgoing_path("N2", 1)).is_none());
        assert_eq!(staged_rows(&fx, 2), Some(1));
        assert_eq!(writer.finished_batches().len(), 1);
    }

    #[test]
    fn finished_batches_are_copied_to_child_requests() {
        let fx = fixture();
        let (request, batches) = placeholders(&fx, 3);
        for id in 11..=13 {
            let mut batch = Batch::new(id, "N3", "reload", BatchStatus::Requested).with_load_id(8);
            fx.outgoing.insert(&mut batch).unwrap();
        }
        fx.outgoing
            .operator_resolve(12, "N3", BatchStatus::Ignored)
            .unwrap();
        let child = ExtractRequest {
            request_id: 2,
            node_id: "N3".into(),
            start_batch_id: 11,
            end_batch_id: 13,
            load_id: 8,
            parent_request_id: Some(request.request_id),
            ..request.clone()
        };
        let mut writer = MultiBatchStagingWriter::new(
            Arc::clone(&fx.outgoing),
            fx.staging.clone(),
            fx.clock.clone(),
            ExtractConfig::default().with_max_rows_per_batch(2),
            "N1",
            request,
            batches,
        )
        .with_children(vec![child]);
        run(&mut writer, rows(&[("a", 3)])).unwrap();

        let copy = fx.store.find_outgoing(11, "N3").unwrap().unwrap();
        assert_eq!(copy.status, BatchStatus::New);
        assert_eq!(copy.row_count, 2);
        let resource = fx.staging.find(&outgoing_path("N3", 11)).unwrap();
        assert_eq!(copy.byte_count, resource.size());
        let payloads = decode_payload(&resource.read_all().unwrap()).unwrap();
        assert_eq!(payloads[0].batch_id, 11);
        assert_eq!(payloads[0].load_id, Some(8));
        assert_eq!(payloads[0].rows.len(), 2);

        assert_eq!(
            fx.store.find_outgoing(12, "N3").unwrap().unwrap().status,
            BatchStatus::Ignored
        );
        assert!(fx.staging.find(&outgoing_path("N3", 12)).is_none());
        assert_eq!(
            fx.store.find_outgoing(13, "N3").unwrap().unwrap().status,
            BatchStatus::Requested
        );
        assert_eq!(writer.copied_batches().len(), 1);
    }

    #[test]
    fn ignoring_a_batch_cancels_the_extract() {
        let fx = fixture();
        let config = ExtractConfig::default()
            .with_max_rows_per_batch(1)
            .with_send_when_staged(true);
        let mut writer = multi_writer(&fx, config, 3);
        writer.open().unwrap();
        writer.start_table("a").unwrap();
        writer.write(&CaptureRow::insert(1, "a", vec![])).unwrap();

        fx.outgoing
            .operator_resolve(1, "N2", BatchStatus::Ignored)
            .unwrap();
        let err = writer
            .write(&CaptureRow::insert(2, "a", vec![]))
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(fx.staging.find(&outgoing_path("N2", 1)).is_none());
    }

    #[test]
    fn finished_batches_refresh_earlier_resources() {
        let fx = fixture();
        let config = ExtractConfig::default().with_max_rows_per_batch(1);
        let mut writer = multi_writer(&fx, config, 3);
        writer.open().unwrap();
        writer.start_table("a").unwrap();
        writer.write(&CaptureRow::insert(1, "a", vec![])).unwrap();
        writer.write(&CaptureRow::insert(2, "a", vec![])).unwrap();
        let first = fx.staging.find(&outgoing_path("N2", 1)).unwrap();
        let before = first.last_update_time();

        fx.clock.advance(Duration::from_secs(600));
        writer.write(&CaptureRow::insert(3, "a", vec![])).unwrap();
        assert!(first.last_update_time() > before);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn rows_are_conserved(row_count in 0u64..40, max_rows in 1u64..8) {
            let fx = fixture();
            let placeholders = row_count.div_ceil(max_rows).max(1) + 1;
            let config = ExtractConfig::default().with_max_rows_per_batch(max_rows);
            let mut writer = multi_writer(&fx, config, placeholders);
            run(&mut writer, rows(&[("a", row_count / 2), ("b", row_count - row_count / 2)])).unwrap();

            let staged: Vec<usize> = (1..=placeholders)
                .filter_map(|id| staged_rows(&fx, id))
                .collect();
            prop_assert_eq!(staged.len() as u64, row_count.div_ceil(max_rows));
            prop_assert!(staged.iter().all(|&n| n > 0 && n as u64 <= max_rows));
            prop_assert_eq!(staged.iter().sum::<usize>() as u64, row_count);
        }
    }
}
