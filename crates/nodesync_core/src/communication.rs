//! Per (node, channel, type) work leases.

use crate::config::LeaseConfig;
use crate::error::CoreResult;
use crate::node::NodeDirectory;
use nodesync_protocol::{Clock, CommunicationKey, CommunicationType, NodeCommunication};
use nodesync_store::NodeCommunicationStore;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of a lease attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The caller holds the lease.
    Acquired,
    /// Another worker holds it.
    Busy,
}

impl LeaseOutcome {
    /// Returns true if the lease was acquired.
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired)
    }
}

/// Node communication scheduler.
///
/// Leases let many (node, channel) pairs run concurrently while keeping at
/// most one worker per pair across the cluster.
pub struct NodeCommunicationService {
    store: Arc<dyn NodeCommunicationStore>,
    directory: Arc<dyn NodeDirectory>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    server_id: String,
    restart_cleared: AtomicBool,
}

impl NodeCommunicationService {
    /// Creates the scheduler.
    pub fn new(
        store: Arc<dyn NodeCommunicationStore>,
        directory: Arc<dyn NodeDirectory>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            config,
            server_id: server_id.into(),
            restart_cleared: AtomicBool::new(false),
        }
    }

    /// Worker count for a communication type.
    pub fn thread_count(&self, kind: CommunicationType) -> usize {
        self.config.thread_count(kind)
    }

    /// Lease rows for `kind`, starved pairs first.
    ///
    /// Rows are reconciled with the node directory: new pairs get a row,
    /// rows for nodes no longer targeted are deleted.
    pub fn list(&self, kind: CommunicationType) -> CoreResult<Vec<NodeCommunication>> {
        self.clear_locks_on_restart()?;

        let mut wanted = BTreeSet::new();
        let channels = self.directory.channels();
        for node in self.directory.targets(kind) {
            for channel in &channels {
                wanted.insert(CommunicationKey::new(node.node_id.clone(), channel.clone(), kind));
            }
        }

        let mut rows = Vec::with_capacity(wanted.len());
        for row in self.store.list_communications(kind)? {
            if wanted.remove(&row.key) {
                rows.push(row);
            } else {
                tracing::debug!(lease = %row.key, "removing lease for node that is no longer a target");
                self.store.delete_communication(&row.key)?;
            }
        }
        for key in wanted {
            let row = NodeCommunication::new(key);
            if self.store.insert_communication(row.clone())? {
                tracing::debug!(lease = %row.key, "created lease");
            }
            rows.push(row);
        }

        rows.sort_by(|a, b| a.last_lock_time.cmp(&b.last_lock_time));
        Ok(rows)
    }

    /// Tries to take the lease of one unit of work.
    pub fn try_lock(&self, communication: &mut NodeCommunication) -> CoreResult<LeaseOutcome> {
        let now = self.clock.now();
        let timeout = self.config.lock_timeout(communication.key.communication_type);
        let cutoff = now.minus(timeout);
        if !self
            .store
            .lock_communication(&communication.key, &self.server_id, now, cutoff)?
        {
            tracing::trace!(lease = %communication.key, "lease is held");
            return Ok(LeaseOutcome::Busy);
        }
        if communication.lock_time.is_some_and(|t| t < cutoff) {
            tracing::warn!(
                lease = %communication.key,
                previous_holder = ?communication.locking_server_id,
                "took over a stale lease"
            );
        }
        communication.lock_time = Some(now);
        communication.last_lock_time = Some(now);
        communication.locking_server_id = Some(self.server_id.clone());
        Ok(LeaseOutcome::Acquired)
    }

    /// Records the run and releases the lease.
    pub fn unlock(
        &self,
        communication: &mut NodeCommunication,
        success: bool,
        elapsed: Duration,
    ) -> CoreResult<()> {
        communication.record_run(success, elapsed);
        if !self
            .store
            .release_communication(communication, &self.server_id)?
        {
            tracing::warn!(lease = %communication.key, "lease was taken over before release");
        }
        communication.clear_lock();
        Ok(())
    }

    fn clear_locks_on_restart(&self) -> CoreResult<()> {
        if self.restart_cleared.load(Ordering::Acquire) {
            return Ok(());
        }
        let cleared = self.store.clear_communication_locks(&self.server_id)?;
        self.restart_cleared.store(true, Ordering::Release);
        if cleared > 0 {
            tracing::info!(server_id = %self.server_id, cleared, "cleared leases left by a previous run");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::StaticNodeDirectory;
    use nodesync_protocol::{ManualClock, Node, Timestamp};
    use nodesync_store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        directory: Arc<StaticNodeDirectory>,
    }

    impl Fixture {
        fn new() -> Self {
            let directory = StaticNodeDirectory::new(Node::new("N1", "corp"))
                .with_channels(["default", "config"])
                .with_push_target(Node::new("N2", "store"))
                .with_push_target(Node::new("N3", "store"));
            Self {
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::new(Timestamp::from_millis(50_000_000))),
                directory: Arc::new(directory),
            }
        }

        fn service(&self, server: &str) -> NodeCommunicationService {
            NodeCommunicationService::new(
                self.store.clone(),
                self.directory.clone(),
                self.clock.clone(),
                LeaseConfig::default(),
                server,
            )
        }
    }

    #[test]
    fn list_reconciles_with_directory() {
        let fx = Fixture::new();
        let leases = fx.service("a");
        assert_eq!(leases.list(CommunicationType::Push).unwrap().len(), 4);
        assert!(leases.list(CommunicationType::Pull).unwrap().is_empty());

        fx.directory.remove_node("N3");
        let rows = leases.list(CommunicationType::Push).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.key.node_id == "N2"));
        assert_eq!(
            fx.store
                .list_communications(CommunicationType::Push)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn one_worker_per_pair() {
        let fx = Fixture::new();
        let a = fx.service("a");
        let b = fx.service("b");
        let mut rows = a.list(CommunicationType::Push).unwrap();
        let mut copy = rows[0].clone();

        assert_eq!(a.try_lock(&mut rows[0]).unwrap(), LeaseOutcome::Acquired);
        assert_eq!(b.try_lock(&mut copy).unwrap(), LeaseOutcome::Busy);
        assert_eq!(a.try_lock(&mut rows[0].clone()).unwrap(), LeaseOutcome::Busy);

        a.unlock(&mut rows[0], true, Duration::from_millis(250)).unwrap();
        assert!(b.try_lock(&mut copy).unwrap().is_acquired());
    }

    #[test]
    fn stale_lease_is_taken_over() {
        let fx = Fixture::new();
        let a = fx.service("a");
        let b = fx.service("b");
        let mut row = a.list(CommunicationType::Push).unwrap().remove(0);
        let mut copy = row.clone();
        assert!(a.try_lock(&mut row).unwrap().is_acquired());

        fx.clock.advance(Duration::from_secs(2 * 60 * 60 + 1));
        assert!(b.try_lock(&mut copy).unwrap().is_acquired());
    }

    #[test]
    fn unlock_records_counters() {
        let fx = Fixture::new();
        let a = fx.service("a");
        let mut row = a.list(CommunicationType::Push).unwrap().remove(0);

        a.try_lock(&mut row).unwrap();
        a.unlock(&mut row, false, Duration::from_millis(100)).unwrap();
        a.try_lock(&mut row).unwrap();
        a.unlock(&mut row, false, Duration::from_millis(100)).unwrap();
        assert_eq!(row.fail_count, 2);

        a.try_lock(&mut row).unwrap();
        a.unlock(&mut row, true, Duration::from_millis(40)).unwrap();

        let stored = fx
            .store
            .list_communications(CommunicationType::Push)
            .unwrap()
            .into_iter()
            .find(|r| r.key == row.key)
            .unwrap();
        assert_eq!(stored.fail_count, 0);
        assert_eq!(stored.success_count, 1);
        assert_eq!(stored.total_fail_count, 2);
        assert_eq!(stored.total_fail_millis, 200);
        assert_eq!(stored.total_success_millis, 40);
        assert_eq!(stored.last_lock_millis, 40);
        assert!(stored.lock_time.is_none());
        assert!(stored.last_lock_time.is_some());
    }

    #[test]
    fn list_orders_starved_pairs_first() {
        let fx = Fixture::new();
        let a = fx.service("a");
        let rows = a.list(CommunicationType::Push).unwrap();
        for mut row in rows.into_iter().take(3) {
            fx.clock.advance(Duration::from_secs(1));
            a.try_lock(&mut row).unwrap();
            a.unlock(&mut row, true, Duration::ZERO).unwrap();
        }
        let rows = a.list(CommunicationType::Push).unwrap();
        assert!(rows[0].last_lock_time.is_none());
        assert!(rows
            .windows(2)
            .all(|w| w[0].last_lock_time <= w[1].last_lock_time));
    }

    #[test]
    fn restart_clears_own_leases_once() {
        let fx = Fixture::new();
        let first = fx.service("a");
        let mut row = first.list(CommunicationType::Push).unwrap().remove(0);
        assert!(first.try_lock(&mut row).unwrap().is_acquired());

        let restarted = fx.service("a");
        let mut rows = restarted.list(CommunicationType::Push).unwrap();
        let again = rows.iter_mut().find(|r| r.key == row.key).unwrap();
        assert!(restarted.try_lock(again).unwrap().is_acquired());

        let mut held = row.clone();
        assert!(!restarted.try_lock(&mut held).unwrap().is_acquired());
        restarted.list(CommunicationType::Push).unwrap();
        assert!(!restarted.try_lock(&mut held).unwrap().is_acquired());
    }
}
