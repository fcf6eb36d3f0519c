//! Configuration for the core services.

use crate::retry::RetryPolicy;
use nodesync_protocol::CommunicationType;
use std::time::Duration;

/// Sequence generator configuration.
#[derive(Debug, Clone, Default)]
pub struct SequenceConfig {
    /// Retry policy for the conditional-update loop.
    pub retry: RetryPolicy,
}

impl SequenceConfig {
    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Cluster lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Whether cluster locking is enabled. When disabled every lock succeeds.
    pub enabled: bool,
    /// Explicit server id; resolved from the environment when `None`.
    pub server_id: Option<String>,
    /// A lock older than this is stale and may be taken over.
    pub lock_timeout: Duration,
    /// A holder re-stamps its lock once the stamp is older than this.
    pub refresh_interval: Duration,
    /// Poll interval for `lock_wait`.
    pub wait_poll: Duration,
}

impl LockConfig {
    /// Sets the server id.
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Enables or disables cluster locking.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the `lock_wait` poll interval.
    pub fn with_wait_poll(mut self, poll: Duration) -> Self {
        self.wait_poll = poll;
        self
    }

    /// Returns the configured id, else `HOSTNAME`, else a random uuid.
    pub fn resolve_server_id(&self) -> String {
        if let Some(id) = self.server_id.as_ref().filter(|id| !id.trim().is_empty()) {
            return id.clone();
        }
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.trim().is_empty() => host,
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_id: None,
            lock_timeout: Duration::from_secs(30 * 60),
            refresh_interval: Duration::from_secs(20 * 60),
            wait_poll: Duration::from_millis(50),
        }
    }
}

/// Node communication lease configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Push lease timeout.
    pub push_lock_timeout: Duration,
    /// Pull lease timeout.
    pub pull_lock_timeout: Duration,
    /// Extract lease timeout.
    pub extract_lock_timeout: Duration,
    /// Concurrent push workers.
    pub push_thread_count: usize,
    /// Concurrent pull workers.
    pub pull_thread_count: usize,
    /// Concurrent extract workers.
    pub extract_thread_count: usize,
}

impl LeaseConfig {
    /// Sets the lease timeout for one communication type.
    pub fn with_lock_timeout(mut self, kind: CommunicationType, timeout: Duration) -> Self {
        match kind {
            CommunicationType::Push => self.push_lock_timeout = timeout,
            CommunicationType::Pull => self.pull_lock_timeout = timeout,
            CommunicationType::Extract => self.extract_lock_timeout = timeout,
        }
        self
    }

    /// Sets the worker count for one communication type.
    pub fn with_thread_count(mut self, kind: CommunicationType, count: usize) -> Self {
        match kind {
            CommunicationType::Push => self.push_thread_count = count,
            CommunicationType::Pull => self.pull_thread_count = count,
            CommunicationType::Extract => self.extract_thread_count = count,
        }
        self
    }

    /// Lease timeout for a communication type.
    pub fn lock_timeout(&self, kind: CommunicationType) -> Duration {
        match kind {
            CommunicationType::Push => self.push_lock_timeout,
            CommunicationType::Pull => self.pull_lock_timeout,
            CommunicationType::Extract => self.extract_lock_timeout,
        }
    }

    /// Worker count for a communication type; zero is treated as one.
    pub fn thread_count(&self, kind: CommunicationType) -> usize {
        let count = match kind {
            CommunicationType::Push => self.push_thread_count,
            CommunicationType::Pull => self.pull_thread_count,
            CommunicationType::Extract => self.extract_thread_count,
        };
        count.max(1)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        let two_hours = Duration::from_secs(2 * 60 * 60);
        Self {
            push_lock_timeout: two_hours,
            pull_lock_timeout: two_hours,
            extract_lock_timeout: two_hours,
            push_thread_count: 1,
            pull_thread_count: 1,
            extract_thread_count: 1,
        }
    }
}

/// Staging extractor configuration.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Maximum rows per batch of a multi-batch load.
    pub max_rows_per_batch: u64,
    /// Mark each load batch `NE` as soon as it is staged.
    pub send_when_staged: bool,
    /// Interval between progress log lines.
    pub progress_interval: Duration,
    /// Bytes a staged resource buffers in memory before spilling to a file.
    pub memory_threshold: usize,
}

impl ExtractConfig {
    /// Sets the maximum rows per batch.
    pub fn with_max_rows_per_batch(mut self, rows: u64) -> Self {
        self.max_rows_per_batch = rows.max(1);
        self
    }

    /// Enables extract-and-send-when-staged.
    pub fn with_send_when_staged(mut self, enabled: bool) -> Self {
        self.send_when_staged = enabled;
        self
    }

    /// Sets the progress interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Sets the memory threshold.
    pub fn with_memory_threshold(mut self, bytes: usize) -> Self {
        self.memory_threshold = bytes;
        self
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_rows_per_batch: 10_000,
            send_when_staged: false,
            progress_interval: Duration::from_secs(60),
            memory_threshold: 256 * 1024,
        }
    }
}

/// Receiving side configuration.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Skip a retransmitted batch that already loaded `OK`.
    pub skip_duplicate_batches: bool,
    /// Keep ledger rows for batches that loaded `OK`.
    pub record_ok_batches: bool,
}

impl LoadConfig {
    /// Sets duplicate skipping.
    pub fn with_skip_duplicate_batches(mut self, enabled: bool) -> Self {
        self.skip_duplicate_batches = enabled;
        self
    }

    /// Sets OK batch recording.
    pub fn with_record_ok_batches(mut self, enabled: bool) -> Self {
        self.record_ok_batches = enabled;
        self
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            skip_duplicate_batches: true,
            record_ok_batches: true,
        }
    }
}

/// Configuration bundle for every core service of one node.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Sequence generator.
    pub sequence: SequenceConfig,
    /// Cluster locks.
    pub lock: LockConfig,
    /// Node communication leases.
    pub lease: LeaseConfig,
    /// Staging extractor.
    pub extract: ExtractConfig,
    /// Receiving side.
    pub load: LoadConfig,
}

impl CoreConfig {
    /// Sets the sequence configuration.
    pub fn with_sequence(mut self, sequence: SequenceConfig) -> Self {
        self.sequence = sequence;
        self
    }

    /// Sets the lock configuration.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Sets the lease configuration.
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    /// Sets the extract configuration.
    pub fn with_extract(mut self, extract: ExtractConfig) -> Self {
        self.extract = extract;
        self
    }

    /// Sets the load configuration.
    pub fn with_load(mut self, load: LoadConfig) -> Self {
        self.load = load;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_defaults() {
        let config = LeaseConfig::default();
        assert_eq!(
            config.lock_timeout(CommunicationType::Push),
            Duration::from_secs(7200)
        );
        assert_eq!(config.thread_count(CommunicationType::Pull), 1);
    }

    #[test]
    fn zero_thread_count_is_one() {
        let config = LeaseConfig::default().with_thread_count(CommunicationType::Push, 0);
        assert_eq!(config.thread_count(CommunicationType::Push), 1);
        let config = config.with_thread_count(CommunicationType::Push, 4);
        assert_eq!(config.thread_count(CommunicationType::Push), 4);
    }

    #[test]
    fn configured_server_id_wins() {
        let config = LockConfig::default().with_server_id("server-a");
        assert_eq!(config.resolve_server_id(), "server-a");
    }

    #[test]
    fn blank_server_id_falls_back() {
        let config = LockConfig::default().with_server_id("  ");
        assert!(!config.resolve_server_id().trim().is_empty());
    }

    #[test]
    fn max_rows_is_at_least_one() {
        let config = ExtractConfig::default().with_max_rows_per_batch(0);
        assert_eq!(config.max_rows_per_batch, 1);
    }
}
