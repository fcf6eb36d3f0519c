//! Configuration for the push/pull pipeline.

use std::time::Duration;

/// Configuration for push cycles.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Bytes sent per session before the rest waits for the next cycle.
    pub max_bytes_to_sync: u64,
    /// Batches the extract stage may stage ahead of the transport stage.
    pub queue_capacity: usize,
}

impl PushConfig {
    /// Sets the byte budget of one session.
    pub fn with_max_bytes_to_sync(mut self, bytes: u64) -> Self {
        self.max_bytes_to_sync = bytes;
        self
    }

    /// Sets the hand-off queue capacity. At least one slot is kept.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_bytes_to_sync: 1024 * 1024,
            queue_capacity: 4,
        }
    }
}

/// Configuration for pull cycles.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Pulls repeated back to back while the remote keeps returning batches.
    pub max_immediate_pulls: u32,
}

impl PullConfig {
    /// Sets the number of back-to-back pulls. At least one pull is made.
    pub fn with_max_immediate_pulls(mut self, pulls: u32) -> Self {
        self.max_immediate_pulls = pulls.max(1);
        self
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            max_immediate_pulls: 10,
        }
    }
}

/// Configuration for a [`NodeEngine`](crate::NodeEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Push cycles.
    pub push: PushConfig,
    /// Pull cycles.
    pub pull: PullConfig,
    /// How long transport errors to one node are logged quietly.
    pub offline_escalation: Duration,
}

impl EngineConfig {
    /// Sets the push configuration.
    pub fn with_push(mut self, push: PushConfig) -> Self {
        self.push = push;
        self
    }

    /// Sets the pull configuration.
    pub fn with_pull(mut self, pull: PullConfig) -> Self {
        self.pull = pull;
        self
    }

    /// Sets the offline grace period.
    pub fn with_offline_escalation(mut self, escalation: Duration) -> Self {
        self.offline_escalation = escalation;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            push: PushConfig::default(),
            pull: PullConfig::default(),
            offline_escalation: Duration::from_secs(5 * 60),
        }
    }
}
