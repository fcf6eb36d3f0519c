//! Tracks transport failures per remote node.

use nodesync_protocol::{Clock, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

/// Remembers when each remote node started failing.
///
/// An entry is created on the first failure and removed on the next
/// successful contact. Failures are logged at `info` until they have lasted
/// longer than the escalation period, then at `warn`.
pub struct TransportErrorTracker {
    first_failures: Mutex<HashMap<String, Timestamp>>,
    clock: Arc<dyn Clock>,
    escalation: Duration,
}

impl TransportErrorTracker {
    /// Creates a tracker.
    pub fn new(clock: Arc<dyn Clock>, escalation: Duration) -> Self {
        Self {
            first_failures: Mutex::new(HashMap::new()),
            clock,
            escalation,
        }
    }

    /// Records a failure and logs it. Returns true once the failure has
    /// persisted past the escalation period.
    pub fn record_failure(&self, node_id: &str, error: &dyn Display) -> bool {
        let now = self.clock.now();
        let first = *self
            .first_failures
            .lock()
            .entry(node_id.to_string())
            .or_insert(now);
        let failing_for = now.since(first);
        let escalated = failing_for > self.escalation;
        if escalated {
            tracing::warn!(
                node_id,
                failing_ms = failing_for.as_millis() as u64,
                error = %error,
                "node has been unreachable past the grace period"
            );
        } else {
            tracing::info!(node_id, error = %error, "could not reach node");
        }
        escalated
    }

    /// Clears the failure of a node after successful contact.
    pub fn record_success(&self, node_id: &str) {
        if self.first_failures.lock().remove(node_id).is_some() {
            tracing::info!(node_id, "node is reachable again");
        }
    }

    /// When the current run of failures started.
    pub fn first_failure(&self, node_id: &str) -> Option<Timestamp> {
        self.first_failures.lock().get(node_id).copied()
    }

    /// Nodes currently failing.
    pub fn failing_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.first_failures.lock().keys().cloned().collect();
        nodes.sort();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_protocol::ManualClock;

    #[test]
    fn escalates_after_grace_period() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let tracker = TransportErrorTracker::new(clock.clone(), Duration::from_secs(60));

        assert!(!tracker.record_failure("N2", &"refused"));
        clock.advance(Duration::from_secs(30));
        assert!(!tracker.record_failure("N2", &"refused"));
        assert_eq!(tracker.first_failure("N2"), Some(Timestamp::from_millis(1_000)));

        clock.advance(Duration::from_secs(31));
        assert!(tracker.record_failure("N2", &"refused"));
    }

    #[test]
    fn success_clears_the_node() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let tracker = TransportErrorTracker::new(clock.clone(), Duration::from_secs(1));

        tracker.record_failure("N3", &"refused");
        tracker.record_failure("N2", &"refused");
        assert_eq!(tracker.failing_nodes(), vec!["N2".to_string(), "N3".to_string()]);

        tracker.record_success("N2");
        assert_eq!(tracker.first_failure("N2"), None);

        clock.advance(Duration::from_secs(5));
        assert!(!tracker.record_failure("N2", &"refused"));
    }
}
