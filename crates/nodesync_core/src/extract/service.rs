use super::multi::MultiBatchStagingWriter;
use super::writer::{DataWriter, StagingDataWriter};
use super::{transfer, CaptureReader};
use crate::cluster::{ClusterLockService, LockKind};
use crate::config::ExtractConfig;
use crate::error::{CoreError, CoreResult};
use crate::outgoing::OutgoingBatchService;
use crate::sequence::SequenceService;
use nodesync_protocol::{
    actions, sequences, Batch, BatchId, BatchStatus, Clock, ExtractRequest, ExtractStatus,
};
use nodesync_store::{outgoing_path, ExtractRequestStore, ResourceState, StagedResource, StagingManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Extracts outgoing batches into staged resources.
pub struct DataExtractorService {
    outgoing: Arc<OutgoingBatchService>,
    sequences: Arc<SequenceService>,
    requests: Arc<dyn ExtractRequestStore>,
    locks: Arc<ClusterLockService>,
    staging: Arc<dyn StagingManager>,
    capture: Arc<dyn CaptureReader>,
    clock: Arc<dyn Clock>,
    config: ExtractConfig,
    local_node_id: String,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DataExtractorService {
    /// Creates the extractor for batches produced by `local_node_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        outgoing: Arc<OutgoingBatchService>,
        sequences: Arc<SequenceService>,
        requests: Arc<dyn ExtractRequestStore>,
        locks: Arc<ClusterLockService>,
        staging: Arc<dyn StagingManager>,
        capture: Arc<dyn CaptureReader>,
        clock: Arc<dyn Clock>,
        config: ExtractConfig,
        local_node_id: impl Into<String>,
    ) -> Self {
        Self {
            outgoing,
            sequences,
            requests,
            locks,
            staging,
            capture,
            clock,
            config,
            local_node_id: local_node_id.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if the batch already has a complete staged payload.
    pub fn is_previously_extracted(&self, batch: &Batch) -> bool {
        self.staged(batch).is_some()
    }

    /// Stages one batch, reusing a previous extraction when there is one.
    ///
    /// `batch` is refreshed from the ledger. Ignored batches are staged as an
    /// empty marker so the receiver records them as ignored.
    pub fn extract_batch(&self, batch: &mut Batch) -> CoreResult<Arc<dyn StagedResource>> {
        let key = batch.node_batch_id();
        let gate = Arc::clone(self.in_flight.lock().entry(key.clone()).or_default());
        let result = {
            let _guard = gate.lock();
            self.extract_locked(batch)
        };
        drop(gate);
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&key)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            in_flight.remove(&key);
        }
        result
    }

    fn extract_locked(&self, batch: &mut Batch) -> CoreResult<Arc<dyn StagedResource>> {
        let mut current = self.outgoing.get(batch.batch_id, &batch.node_id)?;
        if let Some(resource) = self.staged(&current) {
            resource.refresh_last_update_time();
            *batch = current;
            return Ok(resource);
        }

        let ignored = current.status == BatchStatus::Ignored;
        if !ignored {
            current.status = BatchStatus::Querying;
        }
        current.extract_count += 1;
        self.outgoing.update(&mut current)?;

        let started = self.clock.now();
        let mut writer = StagingDataWriter::new(
            Arc::clone(&self.staging),
            self.local_node_id.clone(),
            self.config.memory_threshold,
        );
        let staged = self.write_batch(&mut writer, &current, ignored);
        let resource = match staged.and_then(|()| {
            writer.resource().ok_or_else(|| {
                CoreError::StagedResourceMissing(outgoing_path(&current.node_id, current.batch_id))
            })
        }) {
            Ok(resource) => resource,
            Err(err) => {
                writer.discard()?;
                if err.is_cancellation() {
                    return Err(err);
                }
                let (state, code) = match &err {
                    CoreError::Protocol(_) => (Some("PROTOCOL".to_string()), 0),
                    _ => (None, -1),
                };
                self.outgoing
                    .record_extract_failure(&mut current, state, code, err.to_string())?;
                *batch = current;
                return Err(err);
            }
        };

        writer.statistics().apply_to(&mut current);
        current.extract_millis = self.clock.now().since(started).as_millis() as u64;
        if !ignored {
            current.status = BatchStatus::New;
        }
        self.outgoing.update(&mut current)?;
        tracing::debug!(
            batch = %current.node_batch_id(),
            rows = current.row_count,
            bytes = current.byte_count,
            "extracted batch"
        );
        *batch = current;
        Ok(resource)
    }

    fn write_batch(
        &self,
        writer: &mut StagingDataWriter,
        batch: &Batch,
        ignored: bool,
    ) -> CoreResult<()> {
        writer.open()?;
        writer.start_batch(batch)?;
        if !ignored {
            let rows = self.capture.batch_rows(batch)?;
            transfer(writer, rows)?;
        }
        writer.end_batch(batch)?;
        writer.close()
    }

    /// Creates an extract request with a contiguous range of `RQ` batches.
    pub fn request_extract(
        &self,
        node_id: &str,
        channel_id: &str,
        load_id: u64,
        batch_count: u64,
        trigger_id: &str,
        router_id: &str,
    ) -> CoreResult<ExtractRequest> {
        let request = self.create_request(
            node_id,
            channel_id,
            load_id,
            batch_count,
            trigger_id,
            router_id,
            None,
        )?;
        tracing::info!(
            request_id = request.request_id,
            node_id,
            load_id,
            start_batch_id = request.start_batch_id,
            end_batch_id = request.end_batch_id,
            "requested load extract"
        );
        Ok(request)
    }

    /// Creates a request for another node that is staged from `parent`'s
    /// extraction instead of querying the source again.
    ///
    /// The child gets its own batch range of the same size, in `parent`'s
    /// channel. It is never executed on its own.
    pub fn request_child_extract(
        &self,
        parent: &ExtractRequest,
        node_id: &str,
        load_id: u64,
    ) -> CoreResult<ExtractRequest> {
        if parent.parent_request_id.is_some() {
            return Err(CoreError::InvalidArgument(format!(
                "extract request {} is itself a child request",
                parent.request_id
            )));
        }
        let request = self.create_request(
            node_id,
            &parent.channel_id,
            load_id,
            parent.batch_count(),
            &parent.trigger_id,
            &parent.router_id,
            Some(parent.request_id),
        )?;
        tracing::info!(
            request_id = request.request_id,
            parent_request_id = parent.request_id,
            node_id,
            load_id,
            "requested child load extract"
        );
        Ok(request)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_request(
        &self,
        node_id: &str,
        channel_id: &str,
        load_id: u64,
        batch_count: u64,
        trigger_id: &str,
        router_id: &str,
        parent_request_id: Option<u64>,
    ) -> CoreResult<ExtractRequest> {
        let (first, last) = self.sequences.next_range(sequences::OUTGOING_BATCH, batch_count)?;
        let start_batch_id = to_id(first)?;
        let end_batch_id = to_id(last)?;
        for batch_id in start_batch_id..=end_batch_id {
            let mut batch = Batch::new(batch_id, node_id, channel_id, BatchStatus::Requested)
                .with_load_id(load_id);
            self.outgoing.insert(&mut batch)?;
        }

        let now = self.clock.now();
        let request = ExtractRequest {
            request_id: to_id(self.sequences.next_val(sequences::EXTRACT_REQUEST)?)?,
            node_id: node_id.to_string(),
            channel_id: channel_id.to_string(),
            status: ExtractStatus::New,
            start_batch_id,
            end_batch_id,
            load_id,
            trigger_id: trigger_id.to_string(),
            router_id: router_id.to_string(),
            last_update_time: Some(now),
            create_time: Some(now),
            parent_request_id,
        };
        self.requests.insert_extract_request(&request)?;
        Ok(request)
    }

    /// Runs the pending extract requests of a node under the cluster-wide
    /// initial load extract lock. Returns how many requests completed.
    ///
    /// Child requests are skipped; they complete with their parent.
    pub fn execute_extract_requests(&self, node_id: &str) -> CoreResult<usize> {
        let requests: Vec<ExtractRequest> = self
            .requests
            .extract_requests_for_node(node_id, ExtractStatus::New)?
            .into_iter()
            .filter(|request| request.parent_request_id.is_none())
            .collect();
        if requests.is_empty() {
            return Ok(0);
        }
        if !self
            .locks
            .lock(actions::INITIAL_LOAD_EXTRACT, LockKind::Exclusive)?
            .is_acquired()
        {
            tracing::debug!(node_id, "initial load extract is running elsewhere");
            return Ok(0);
        }

        let result = self.run_requests(node_id, &requests);
        let released = self
            .locks
            .unlock(actions::INITIAL_LOAD_EXTRACT, LockKind::Exclusive);
        let completed = result?;
        released?;
        Ok(completed)
    }

    fn run_requests(&self, node_id: &str, requests: &[ExtractRequest]) -> CoreResult<usize> {
        let mut completed = 0;
        for request in requests {
            match self.execute_request(request) {
                Ok(()) => completed += 1,
                Err(err) if err.is_cancellation() => {
                    tracing::info!(request_id = request.request_id, "extract request was cancelled");
                    self.finish_request(request)?;
                    completed += 1;
                }
                Err(err) => {
                    tracing::error!(
                        request_id = request.request_id,
                        node_id,
                        error = %err,
                        "failed to execute extract request"
                    );
                }
            }
            self.locks.refresh_lock(actions::INITIAL_LOAD_EXTRACT)?;
        }
        Ok(completed)
    }

    fn execute_request(&self, request: &ExtractRequest) -> CoreResult<()> {
        let batches: Vec<Batch> = self
            .outgoing
            .batches_in_range(&request.node_id, request.start_batch_id, request.end_batch_id)?
            .into_iter()
            .filter(|b| b.status == BatchStatus::Requested)
            .collect();
        if batches.is_empty() {
            return self.finish_request(request);
        }

        let children: Vec<ExtractRequest> = self
            .requests
            .child_extract_requests(request.request_id)?
            .into_iter()
            .filter(|child| child.status == ExtractStatus::New)
            .collect();
        let mut writer = MultiBatchStagingWriter::new(
            Arc::clone(&self.outgoing),
            Arc::clone(&self.staging),
            Arc::clone(&self.clock),
            self.config.clone(),
            &self.local_node_id,
            request.clone(),
            batches,
        )
        .with_children(children);
        let result = writer
            .open()
            .and_then(|()| self.capture.load_rows(request))
            .and_then(|rows| transfer(&mut writer, rows))
            .and_then(|_| writer.close());
        if let Err(err) = result {
            if let Err(abort) = writer.abort() {
                tracing::warn!(
                    request_id = request.request_id,
                    error = %abort,
                    "failed to discard partial extract"
                );
            }
            return Err(err);
        }
        self.finish_request(request)
    }

    fn finish_request(&self, request: &ExtractRequest) -> CoreResult<()> {
        let now = self.clock.now();
        self.requests
            .update_extract_request_status(request.request_id, ExtractStatus::Ok, now)?;
        for child in self.requests.child_extract_requests(request.request_id)? {
            if child.status != ExtractStatus::New {
                continue;
            }
            self.settle_unstaged(&child)?;
            self.requests
                .update_extract_request_status(child.request_id, ExtractStatus::Ok, now)?;
        }
        Ok(())
    }

    /// Marks the batches of a child request that its parent never staged as `OK`.
    fn settle_unstaged(&self, child: &ExtractRequest) -> CoreResult<()> {
        let batches = self.outgoing.batches_in_range(
            &child.node_id,
            child.start_batch_id,
            child.end_batch_id,
        )?;
        for mut batch in batches {
            if batch.status != BatchStatus::Requested {
                continue;
            }
            self.staging
                .remove(&outgoing_path(&batch.node_id, batch.batch_id))?;
            batch.status = BatchStatus::Ok;
            if self.outgoing.update_if(&mut batch, BatchStatus::Requested)? {
                tracing::info!(
                    batch = %batch.node_batch_id(),
                    request_id = child.request_id,
                    "parent extract staged nothing for child batch, marking it OK"
                );
            }
        }
        Ok(())
    }

    fn staged(&self, batch: &Batch) -> Option<Arc<dyn StagedResource>> {
        self.staging
            .find(&outgoing_path(&batch.node_id, batch.batch_id))
            .filter(|resource| resource.state() != ResourceState::Create)
    }
}

fn to_id(value: i64) -> CoreResult<BatchId> {
    BatchId::try_from(value)
        .map_err(|_| CoreError::InvalidArgument(format!("negative sequence value {value}")))
}
