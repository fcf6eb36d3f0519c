//! Capability traits for the durable store.

use crate::error::StoreResult;
use nodesync_protocol::{
    Batch, BatchId, BatchStatus, ClusterLock, CommunicationKey, CommunicationType,
    ExtractRequest, ExtractStatus, NodeCommunication, Sequence, Timestamp,
};

/// Sequence rows.
pub trait SequenceStore: Send + Sync {
    /// Inserts a sequence; returns false if the name exists.
    fn insert_sequence(&self, sequence: Sequence) -> StoreResult<bool>;

    /// Reads a sequence.
    fn find_sequence(&self, name: &str) -> StoreResult<Option<Sequence>>;

    /// Sets `current_value = new` where `current_value = expected`.
    fn compare_and_set_sequence(
        &self,
        name: &str,
        expected: i64,
        new: i64,
        now: Timestamp,
    ) -> StoreResult<bool>;
}

/// Cluster lock rows.
pub trait LockStore: Send + Sync {
    /// Inserts a lock row; returns false if the action exists.
    fn insert_lock(&self, lock: ClusterLock) -> StoreResult<bool>;

    /// Reads a lock row.
    fn find_lock(&self, action: &str) -> StoreResult<Option<ClusterLock>>;

    /// Returns every lock row ordered by action.
    fn list_locks(&self) -> StoreResult<Vec<ClusterLock>>;

    /// Exclusive acquisition.
    fn lock_exclusive(
        &self,
        action: &str,
        server_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> StoreResult<bool>;

    /// Shared acquisition.
    fn lock_shared(
        &self,
        action: &str,
        server_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> StoreResult<bool>;

    /// Stops admitting shared holders.
    fn disable_shared(&self, action: &str) -> StoreResult<bool>;

    /// Releases an exclusive lock held by `server_id`.
    fn release_exclusive(&self, action: &str, server_id: &str) -> StoreResult<bool>;

    /// Drops one shared holder.
    fn release_shared(&self, action: &str) -> StoreResult<bool>;

    /// Re-stamps a lock held by `server_id` whose stamp predates `refresh_cutoff`.
    fn refresh_lock(
        &self,
        action: &str,
        server_id: &str,
        now: Timestamp,
        refresh_cutoff: Timestamp,
    ) -> StoreResult<bool>;

    /// Clears every lock last taken by `server_id`; returns how many.
    fn reset_locks(&self, server_id: &str) -> StoreResult<usize>;
}

/// Node communication lease rows.
pub trait NodeCommunicationStore: Send + Sync {
    /// Lease rows of one type.
    fn list_communications(&self, kind: CommunicationType) -> StoreResult<Vec<NodeCommunication>>;

    /// Inserts a lease row; returns false if the key exists.
    fn insert_communication(&self, communication: NodeCommunication) -> StoreResult<bool>;

    /// Deletes a lease row.
    fn delete_communication(&self, key: &CommunicationKey) -> StoreResult<bool>;

    /// Takes the lease where it is free or its stamp predates `stale_cutoff`.
    fn lock_communication(
        &self,
        key: &CommunicationKey,
        server_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> StoreResult<bool>;

    /// Writes counters and clears the lease where `server_id` holds it.
    fn release_communication(
        &self,
        communication: &NodeCommunication,
        server_id: &str,
    ) -> StoreResult<bool>;

    /// Clears every lease held by `server_id`; returns how many.
    fn clear_communication_locks(&self, server_id: &str) -> StoreResult<usize>;
}

/// Outgoing batch ledger.
pub trait OutgoingBatchStore: Send + Sync {
    /// Inserts a batch; fails with `Duplicate` if the key exists.
    fn insert_outgoing(&self, batch: &Batch) -> StoreResult<()>;

    /// Reads a batch.
    fn find_outgoing(&self, batch_id: BatchId, node_id: &str) -> StoreResult<Option<Batch>>;

    /// Overwrites a batch; returns false if it does not exist.
    fn update_outgoing(&self, batch: &Batch) -> StoreResult<bool>;

    /// Overwrites a batch only while its stored status is `expected`.
    fn update_outgoing_if(&self, batch: &Batch, expected: BatchStatus) -> StoreResult<bool>;

    /// Batches for a node in any of `statuses`, ordered by batch id.
    fn outgoing_for_node(&self, node_id: &str, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>>;

    /// Batches of a load, ordered by batch id.
    fn outgoing_for_load(&self, load_id: u64) -> StoreResult<Vec<Batch>>;

    /// Batches in any of `statuses`, ordered by batch id.
    fn outgoing_with_status(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>>;

    /// Batches for a node within an inclusive id range, ordered by batch id.
    fn outgoing_in_range(
        &self,
        node_id: &str,
        start: BatchId,
        end: BatchId,
    ) -> StoreResult<Vec<Batch>>;
}

/// Incoming batch ledger.
pub trait IncomingBatchStore: Send + Sync {
    /// Inserts a batch; fails with `Duplicate` if the key exists.
    fn insert_incoming(&self, batch: &Batch) -> StoreResult<()>;

    /// Reads a batch.
    fn find_incoming(&self, batch_id: BatchId, node_id: &str) -> StoreResult<Option<Batch>>;

    /// Overwrites a batch; returns false if it does not exist.
    fn update_incoming(&self, batch: &Batch) -> StoreResult<bool>;

    /// Deletes a batch.
    fn delete_incoming(&self, batch_id: BatchId, node_id: &str) -> StoreResult<bool>;

    /// Batches in any of `statuses`, ordered by node then batch id.
    fn incoming_with_status(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>>;
}

/// Extract requests.
pub trait ExtractRequestStore: Send + Sync {
    /// Inserts a request; fails with `Duplicate` if the id exists.
    fn insert_extract_request(&self, request: &ExtractRequest) -> StoreResult<()>;

    /// Requests for a node in `status`, ordered by request id.
    fn extract_requests_for_node(
        &self,
        node_id: &str,
        status: ExtractStatus,
    ) -> StoreResult<Vec<ExtractRequest>>;

    /// Requests staged by the extraction of `parent_request_id`, ordered by request id.
    fn child_extract_requests(&self, parent_request_id: u64) -> StoreResult<Vec<ExtractRequest>>;

    /// Sets the status of a request.
    fn update_extract_request_status(
        &self,
        request_id: u64,
        status: ExtractStatus,
        now: Timestamp,
    ) -> StoreResult<bool>;
}

/// A store providing every capability.
pub trait DataStore:
    SequenceStore
    + LockStore
    + NodeCommunicationStore
    + OutgoingBatchStore
    + IncomingBatchStore
    + ExtractRequestStore
{
}

impl<T> DataStore for T where
    T: SequenceStore
        + LockStore
        + NodeCommunicationStore
        + OutgoingBatchStore
        + IncomingBatchStore
        + ExtractRequestStore
{
}
