//! Cluster lock rows.
//!
//! A lock row exists per named action. Every method that mutates a row
//! mirrors one conditional update: it checks the predicate and applies the
//! change together, returning whether the "row" was updated.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Server id that parks a lock indefinitely (administrative stop).
pub const STOPPED_SERVER_ID: &str = "STOPPED";

/// Well-known lock actions.
pub mod actions {
    /// Routing job.
    pub const ROUTE: &str = "ROUTE";
    /// Push job.
    pub const PUSH: &str = "PUSH";
    /// Pull job.
    pub const PULL: &str = "PULL";
    /// Heartbeat job.
    pub const HEARTBEAT: &str = "HEARTBEAT";
    /// Incoming purge job.
    pub const PURGE_INCOMING: &str = "PURGE_INCOMING";
    /// Outgoing purge job.
    pub const PURGE_OUTGOING: &str = "PURGE_OUTGOING";
    /// Staging cleanup job.
    pub const STAGE_MANAGEMENT: &str = "STAGE_MANAGEMENT";
    /// Extract request processing.
    pub const INITIAL_LOAD_EXTRACT: &str = "INITIAL_LOAD_EXTRACT";
    /// Watchdog job.
    pub const WATCHDOG: &str = "WATCHDOG";
    /// Shared lock taken by file sync trackers.
    pub const FILE_SYNC_SHARED: &str = "FILE_SYNC_SHARED";

    /// Actions created as exclusive locks at startup.
    pub const EXCLUSIVE: [&str; 9] = [
        ROUTE,
        PUSH,
        PULL,
        HEARTBEAT,
        PURGE_INCOMING,
        PURGE_OUTGOING,
        STAGE_MANAGEMENT,
        INITIAL_LOAD_EXTRACT,
        WATCHDOG,
    ];

    /// Actions created as shared locks at startup.
    pub const SHARED: [&str; 1] = [FILE_SYNC_SHARED];
}

/// Kind of lock a holder has taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// One holder.
    Exclusive,
    /// Counted holders.
    Shared,
}

/// Lock type combined with the shared admission switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Exclusive lock.
    Exclusive,
    /// Shared lock admitting new holders.
    SharedEnabled,
    /// Shared lock draining: no new holders.
    SharedDisabled,
}

/// One lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLock {
    /// Action name.
    pub lock_action: String,
    /// Current lock type.
    pub lock_type: LockType,
    /// Server holding the lock.
    pub locking_server_id: Option<String>,
    /// When the lock was taken; `None` when free.
    pub lock_time: Option<Timestamp>,
    /// Number of shared holders.
    pub shared_count: u32,
    /// Whether new shared holders are admitted.
    pub shared_enable: bool,
    /// Previous holder.
    pub last_locking_server_id: Option<String>,
    /// When the previous holder took the lock.
    pub last_lock_time: Option<Timestamp>,
}

impl ClusterLock {
    /// Creates a free lock row.
    pub fn new(lock_action: impl Into<String>, lock_type: LockType) -> Self {
        Self {
            lock_action: lock_action.into(),
            lock_type,
            locking_server_id: None,
            lock_time: None,
            shared_count: 0,
            shared_enable: false,
            last_locking_server_id: None,
            last_lock_time: None,
        }
    }

    /// Returns the lock type combined with the shared admission switch.
    pub fn mode(&self) -> LockMode {
        match (self.lock_type, self.shared_enable) {
            (LockType::Exclusive, _) => LockMode::Exclusive,
            (LockType::Shared, true) => LockMode::SharedEnabled,
            (LockType::Shared, false) => LockMode::SharedDisabled,
        }
    }

    /// Returns true if someone holds the lock.
    pub fn is_held(&self) -> bool {
        self.lock_time.is_some()
    }

    /// Returns true if the holder's stamp is older than `stale_cutoff`.
    pub fn is_stale(&self, stale_cutoff: Timestamp) -> bool {
        self.lock_time.is_some_and(|t| t < stale_cutoff)
    }

    /// Exclusive admission predicate.
    pub fn can_lock_exclusive(&self, stale_cutoff: Timestamp) -> bool {
        self.lock_time.is_none()
            || self.is_stale(stale_cutoff)
            || (self.lock_type == LockType::Shared && self.shared_count == 0)
    }

    /// Takes the lock exclusively if the admission predicate holds.
    pub fn lock_exclusive(&mut self, server_id: &str, now: Timestamp, stale_cutoff: Timestamp) -> bool {
        if !self.can_lock_exclusive(stale_cutoff) {
            return false;
        }
        self.lock_type = LockType::Exclusive;
        self.locking_server_id = Some(server_id.to_string());
        self.lock_time = Some(now);
        self.shared_count = 0;
        true
    }

    /// Shared admission predicate.
    pub fn can_lock_shared(&self, stale_cutoff: Timestamp) -> bool {
        (self.lock_type == LockType::Shared
            || self.lock_time.is_none()
            || self.is_stale(stale_cutoff))
            && (self.shared_enable || self.shared_count == 0)
    }

    /// Adds a shared holder if the admission predicate holds.
    ///
    /// The first holder switches shared admission on. A stale lock is taken
    /// over with a fresh count.
    pub fn lock_shared(&mut self, server_id: &str, now: Timestamp, stale_cutoff: Timestamp) -> bool {
        if !self.can_lock_shared(stale_cutoff) {
            return false;
        }
        if self.lock_type == LockType::Exclusive || self.is_stale(stale_cutoff) {
            self.shared_count = 0;
        }
        self.lock_type = LockType::Shared;
        self.shared_count += 1;
        if self.shared_count == 1 {
            self.shared_enable = true;
        }
        self.locking_server_id = Some(server_id.to_string());
        self.lock_time = Some(now);
        true
    }

    /// Stops admitting new shared holders.
    pub fn disable_shared(&mut self) -> bool {
        if self.lock_type != LockType::Shared {
            return false;
        }
        self.shared_enable = false;
        true
    }

    /// Releases an exclusive lock held by `server_id`.
    pub fn release_exclusive(&mut self, server_id: &str) -> bool {
        if self.lock_type != LockType::Exclusive
            || self.locking_server_id.as_deref() != Some(server_id)
        {
            return false;
        }
        self.clear_holder();
        true
    }

    /// Drops one shared holder; the last one clears the holder fields.
    pub fn release_shared(&mut self) -> bool {
        if self.lock_type != LockType::Shared || self.shared_count == 0 {
            return false;
        }
        self.shared_count -= 1;
        if self.shared_count == 0 {
            self.clear_holder();
        }
        true
    }

    /// Re-stamps a lock held by `server_id` once its stamp predates `refresh_cutoff`.
    pub fn refresh(&mut self, server_id: &str, now: Timestamp, refresh_cutoff: Timestamp) -> bool {
        if self.locking_server_id.as_deref() != Some(server_id)
            || !self.lock_time.is_some_and(|t| t < refresh_cutoff)
        {
            return false;
        }
        self.lock_time = Some(now);
        true
    }

    /// Force-clears a lock last taken by `server_id`.
    pub fn reset(&mut self, server_id: &str) -> bool {
        if self.locking_server_id.as_deref() != Some(server_id) {
            return false;
        }
        self.clear_holder();
        self.shared_count = 0;
        true
    }

    fn clear_holder(&mut self) {
        self.last_locking_server_id = self.locking_server_id.take();
        self.last_lock_time = self.lock_time.take();
    }
}
