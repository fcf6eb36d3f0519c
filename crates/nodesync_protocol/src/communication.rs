//! Node communication leases.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of work a lease protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CommunicationType {
    /// Pushing outgoing batches to a node.
    Push,
    /// Pulling batches from a node.
    Pull,
    /// Extracting load batches for a node.
    Extract,
}

impl CommunicationType {
    /// Returns the type name used in logs and lease rows.
    pub fn name(&self) -> &'static str {
        match self {
            CommunicationType::Push => "PUSH",
            CommunicationType::Pull => "PULL",
            CommunicationType::Extract => "EXTRACT",
        }
    }
}

impl fmt::Display for CommunicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a lease row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommunicationKey {
    /// Remote node.
    pub node_id: String,
    /// Channel.
    pub channel_id: String,
    /// Work type.
    pub communication_type: CommunicationType,
}

impl CommunicationKey {
    /// Creates a key.
    pub fn new(
        node_id: impl Into<String>,
        channel_id: impl Into<String>,
        communication_type: CommunicationType,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            channel_id: channel_id.into(),
            communication_type,
        }
    }
}

impl fmt::Display for CommunicationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.communication_type, self.node_id, self.channel_id
        )
    }
}

/// A lease row for one (node, channel, type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCommunication {
    /// Identity.
    pub key: CommunicationKey,
    /// When the lease was taken; `None` when free.
    pub lock_time: Option<Timestamp>,
    /// Server holding the lease.
    pub locking_server_id: Option<String>,
    /// When the lease was last taken, kept after release.
    pub last_lock_time: Option<Timestamp>,
    /// Duration of the last completed run.
    pub last_lock_millis: u64,
    /// Consecutive successful runs.
    pub success_count: u64,
    /// Consecutive failed runs; reset by a success.
    pub fail_count: u64,
    /// All successful runs.
    pub total_success_count: u64,
    /// All failed runs.
    pub total_fail_count: u64,
    /// Cumulative time of successful runs.
    pub total_success_millis: u64,
    /// Cumulative time of failed runs.
    pub total_fail_millis: u64,
}

impl NodeCommunication {
    /// Creates a free lease row.
    pub fn new(key: CommunicationKey) -> Self {
        Self {
            key,
            lock_time: None,
            locking_server_id: None,
            last_lock_time: None,
            last_lock_millis: 0,
            success_count: 0,
            fail_count: 0,
            total_success_count: 0,
            total_fail_count: 0,
            total_success_millis: 0,
            total_fail_millis: 0,
        }
    }

    /// Returns true if someone holds the lease.
    pub fn is_locked(&self) -> bool {
        self.lock_time.is_some()
    }

    /// Lease admission predicate.
    pub fn can_lock(&self, stale_cutoff: Timestamp) -> bool {
        self.lock_time.map_or(true, |t| t < stale_cutoff)
    }

    /// Takes the lease if it is free or stale.
    pub fn try_lock(&mut self, server_id: &str, now: Timestamp, stale_cutoff: Timestamp) -> bool {
        if !self.can_lock(stale_cutoff) {
            return false;
        }
        self.lock_time = Some(now);
        self.last_lock_time = Some(now);
        self.locking_server_id = Some(server_id.to_string());
        true
    }

    /// Records the outcome of a run.
    pub fn record_run(&mut self, success: bool, elapsed: Duration) {
        let millis = elapsed.as_millis() as u64;
        self.last_lock_millis = millis;
        if success {
            self.success_count += 1;
            self.fail_count = 0;
            self.total_success_count += 1;
            self.total_success_millis += millis;
        } else {
            self.fail_count += 1;
            self.total_fail_count += 1;
            self.total_fail_millis += millis;
        }
    }

    /// Clears the lease.
    pub fn clear_lock(&mut self) {
        self.lock_time = None;
        self.locking_server_id = None;
    }
}
