//! In-process implementation of every store capability.

use crate::backend::{
    ExtractRequestStore, IncomingBatchStore, LockStore, NodeCommunicationStore,
    OutgoingBatchStore, SequenceStore,
};
use crate::error::{StoreError, StoreResult};
use nodesync_protocol::{
    Batch, BatchId, BatchStatus, ClusterLock, CommunicationKey, CommunicationType,
    ExtractRequest, ExtractStatus, NodeCommunication, Sequence, Timestamp,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

type BatchKey = (BatchId, String);

/// An in-memory durable store.
///
/// Each table sits behind its own lock and every conditional update runs
/// under that table's write lock, which gives the single-row atomicity a
/// database provides. Share one instance through `Arc` between several
/// services to simulate cluster members on one database.
///
/// # Example
///
/// ```rust
/// use nodesync_store::{MemoryStore, SequenceStore};
/// use nodesync_protocol::{Sequence, Timestamp};
///
/// let store = MemoryStore::new();
/// assert!(store.insert_sequence(Sequence::new("outgoing_batch", 0)).unwrap());
/// assert!(store
///     .compare_and_set_sequence("outgoing_batch", 0, 1, Timestamp::from_millis(1))
///     .unwrap());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    sequences: RwLock<BTreeMap<String, Sequence>>,
    locks: RwLock<BTreeMap<String, ClusterLock>>,
    communications: RwLock<BTreeMap<CommunicationKey, NodeCommunication>>,
    outgoing: RwLock<BTreeMap<BatchKey, Batch>>,
    incoming: RwLock<BTreeMap<BatchKey, Batch>>,
    extract_requests: RwLock<BTreeMap<u64, ExtractRequest>>,
    failing_outgoing: RwLock<HashSet<BatchId>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every update of the given outgoing batch fail.
    ///
    /// Useful for testing partial-failure handling.
    pub fn fail_outgoing_updates(&self, batch_id: BatchId) {
        self.failing_outgoing.write().insert(batch_id);
    }

    /// Number of outgoing ledger rows.
    pub fn outgoing_count(&self) -> usize {
        self.outgoing.read().len()
    }

    /// Number of incoming ledger rows.
    pub fn incoming_count(&self) -> usize {
        self.incoming.read().len()
    }

    fn update_lock<F>(&self, action: &str, apply: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut ClusterLock) -> bool,
    {
        Ok(self.locks.write().get_mut(action).map_or(false, apply))
    }
}

fn batch_key(batch: &Batch) -> BatchKey {
    (batch.batch_id, batch.node_id.clone())
}

impl SequenceStore for MemoryStore {
    fn insert_sequence(&self, sequence: Sequence) -> StoreResult<bool> {
        let mut sequences = self.sequences.write();
        if sequences.contains_key(&sequence.name) {
            return Ok(false);
        }
        sequences.insert(sequence.name.clone(), sequence);
        Ok(true)
    }

    fn find_sequence(&self, name: &str) -> StoreResult<Option<Sequence>> {
        Ok(self.sequences.read().get(name).cloned())
    }

    fn compare_and_set_sequence(
        &self,
        name: &str,
        expected: i64,
        new: i64,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let mut sequences = self.sequences.write();
        match sequences.get_mut(name) {
            Some(sequence) if sequence.current_value == expected => {
                sequence.current_value = new;
                sequence.last_update_time = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl LockStore for MemoryStore {
    fn insert_lock(&self, lock: ClusterLock) -> StoreResult<bool> {
        let mut locks = self.locks.write();
        if locks.contains_key(&lock.lock_action) {
            return Ok(false);
        }
        locks.insert(lock.lock_action.clone(), lock);
        Ok(true)
    }

    fn find_lock(&self, action: &str) -> StoreResult<Option<ClusterLock>> {
        Ok(self.locks.read().get(action).cloned())
    }

    fn list_locks(&self) -> StoreResult<Vec<ClusterLock>> {
        Ok(self.locks.read().values().cloned().collect())
    }

    fn lock_exclusive(
        &self,
        action: &str,
        server_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> StoreResult<bool> {
        self.update_lock(action, |lock| lock.lock_exclusive(server_id, now, stale_cutoff))
    }

    fn lock_shared(
        &self,
        action: &str,
        server_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> StoreResult<bool> {
        self.update_lock(action, |lock| lock.lock_shared(server_id, now, stale_cutoff))
    }

    fn disable_shared(&self, action: &str) -> StoreResult<bool> {
        self.update_lock(action, ClusterLock::disable_shared)
    }

    fn release_exclusive(&self, action: &str, server_id: &str) -> StoreResult<bool> {
        self.update_lock(action, |lock| lock.release_exclusive(server_id))
    }

    fn release_shared(&self, action: &str) -> StoreResult<bool> {
        self.update_lock(action, ClusterLock::release_shared)
    }

    fn refresh_lock(
        &self,
        action: &str,
        server_id: &str,
        now: Timestamp,
        refresh_cutoff: Timestamp,
    ) -> StoreResult<bool> {
        self.update_lock(action, |lock| lock.refresh(server_id, now, refresh_cutoff))
    }

    fn reset_locks(&self, server_id: &str) -> StoreResult<usize> {
        let mut locks = self.locks.write();
        Ok(locks
            .values_mut()
            .map(|lock| lock.reset(server_id))
            .filter(|reset| *reset)
            .count())
    }
}

impl NodeCommunicationStore for MemoryStore {
    fn list_communications(&self, kind: CommunicationType) -> StoreResult<Vec<NodeCommunication>> {
        Ok(self
            .communications
            .read()
            .values()
            .filter(|c| c.key.communication_type == kind)
            .cloned()
            .collect())
    }

    fn insert_communication(&self, communication: NodeCommunication) -> StoreResult<bool> {
        let mut communications = self.communications.write();
        if communications.contains_key(&communication.key) {
            return Ok(false);
        }
        communications.insert(communication.key.clone(), communication);
        Ok(true)
    }

    fn delete_communication(&self, key: &CommunicationKey) -> StoreResult<bool> {
        Ok(self.communications.write().remove(key).is_some())
    }

    fn lock_communication(
        &self,
        key: &CommunicationKey,
        server_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> StoreResult<bool> {
        Ok(self
            .communications
            .write()
            .get_mut(key)
            .map_or(false, |c| c.try_lock(server_id, now, stale_cutoff)))
    }

    fn release_communication(
        &self,
        communication: &NodeCommunication,
        server_id: &str,
    ) -> StoreResult<bool> {
        let mut communications = self.communications.write();
        match communications.get_mut(&communication.key) {
            Some(row) if row.locking_server_id.as_deref() == Some(server_id) => {
                let last_lock_time = row.last_lock_time;
                *row = communication.clone();
                row.last_lock_time = last_lock_time;
                row.clear_lock();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear_communication_locks(&self, server_id: &str) -> StoreResult<usize> {
        let mut cleared = 0;
        for row in self.communications.write().values_mut() {
            if row.locking_server_id.as_deref() == Some(server_id) {
                row.clear_lock();
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

impl OutgoingBatchStore for MemoryStore {
    fn insert_outgoing(&self, batch: &Batch) -> StoreResult<()> {
        let mut outgoing = self.outgoing.write();
        let key = batch_key(batch);
        if outgoing.contains_key(&key) {
            return Err(StoreError::Duplicate {
                table: "outgoing_batch",
                key: batch.node_batch_id(),
            });
        }
        outgoing.insert(key, batch.clone());
        Ok(())
    }

    fn find_outgoing(&self, batch_id: BatchId, node_id: &str) -> StoreResult<Option<Batch>> {
        Ok(self
            .outgoing
            .read()
            .get(&(batch_id, node_id.to_string()))
            .cloned())
    }

    fn update_outgoing(&self, batch: &Batch) -> StoreResult<bool> {
        if self.failing_outgoing.read().contains(&batch.batch_id) {
            return Err(StoreError::Unavailable(format!(
                "update of outgoing batch {} failed",
                batch.node_batch_id()
            )));
        }
        let mut outgoing = self.outgoing.write();
        match outgoing.get_mut(&batch_key(batch)) {
            Some(row) => {
                *row = batch.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn update_outgoing_if(&self, batch: &Batch, expected: BatchStatus) -> StoreResult<bool> {
        if self.failing_outgoing.read().contains(&batch.batch_id) {
            return Err(StoreError::Unavailable(format!(
                "update of outgoing batch {} failed",
                batch.node_batch_id()
            )));
        }
        let mut outgoing = self.outgoing.write();
        match outgoing.get_mut(&batch_key(batch)) {
            Some(row) if row.status == expected => {
                *row = batch.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn outgoing_for_node(&self, node_id: &str, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>> {
        Ok(self
            .outgoing
            .read()
            .values()
            .filter(|b| b.node_id == node_id && statuses.contains(&b.status))
            .cloned()
            .collect())
    }

    fn outgoing_for_load(&self, load_id: u64) -> StoreResult<Vec<Batch>> {
        Ok(self
            .outgoing
            .read()
            .values()
            .filter(|b| b.load_id == Some(load_id))
            .cloned()
            .collect())
    }

    fn outgoing_with_status(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>> {
        Ok(self
            .outgoing
            .read()
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect())
    }

    fn outgoing_in_range(
        &self,
        node_id: &str,
        start: BatchId,
        end: BatchId,
    ) -> StoreResult<Vec<Batch>> {
        Ok(self
            .outgoing
            .read()
            .range((start, String::new())..)
            .take_while(|((id, _), _)| *id <= end)
            .filter(|(_, b)| b.node_id == node_id)
            .map(|(_, b)| b.clone())
            .collect())
    }
}

impl IncomingBatchStore for MemoryStore {
    fn insert_incoming(&self, batch: &Batch) -> StoreResult<()> {
        let mut incoming = self.incoming.write();
        let key = batch_key(batch);
        if incoming.contains_key(&key) {
            return Err(StoreError::Duplicate {
                table: "incoming_batch",
                key: batch.node_batch_id(),
            });
        }
        incoming.insert(key, batch.clone());
        Ok(())
    }

    fn find_incoming(&self, batch_id: BatchId, node_id: &str) -> StoreResult<Option<Batch>> {
        Ok(self
            .incoming
            .read()
            .get(&(batch_id, node_id.to_string()))
            .cloned())
    }

    fn update_incoming(&self, batch: &Batch) -> StoreResult<bool> {
        let mut incoming = self.incoming.write();
        match incoming.get_mut(&batch_key(batch)) {
            Some(row) => {
                *row = batch.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_incoming(&self, batch_id: BatchId, node_id: &str) -> StoreResult<bool> {
        Ok(self
            .incoming
            .write()
            .remove(&(batch_id, node_id.to_string()))
            .is_some())
    }

    fn incoming_with_status(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>> {
        let mut batches: Vec<Batch> = self
            .incoming
            .read()
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect();
        batches.sort_by(|a, b| (&a.node_id, a.batch_id).cmp(&(&b.node_id, b.batch_id)));
        Ok(batches)
    }
}

impl ExtractRequestStore for MemoryStore {
    fn insert_extract_request(&self, request: &ExtractRequest) -> StoreResult<()> {
        let mut requests = self.extract_requests.write();
        if requests.contains_key(&request.request_id) {
            return Err(StoreError::Duplicate {
                table: "extract_request",
                key: request.request_id.to_string(),
            });
        }
        requests.insert(request.request_id, request.clone());
        Ok(())
    }

    fn extract_requests_for_node(
        &self,
        node_id: &str,
        status: ExtractStatus,
    ) -> StoreResult<Vec<ExtractRequest>> {
        Ok(self
            .extract_requests
            .read()
            .values()
            .filter(|r| r.node_id == node_id && r.status == status)
            .cloned()
            .collect())
    }

    fn child_extract_requests(&self, parent_request_id: u64) -> StoreResult<Vec<ExtractRequest>> {
        Ok(self
            .extract_requests
            .read()
            .values()
            .filter(|r| r.parent_request_id == Some(parent_request_id))
            .cloned()
            .collect())
    }

    fn update_extract_request_status(
        &self,
        request_id: u64,
        status: ExtractStatus,
        now: Timestamp,
    ) -> StoreResult<bool> {
        Ok(match self.extract_requests.write().get_mut(&request_id) {
            Some(request) => {
                request.status = status;
                request.last_update_time = Some(now);
                true
            }
            None => false,
        })
    }
}
