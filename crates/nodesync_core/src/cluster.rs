//! Cluster-wide locks keyed by action name.

use crate::config::LockConfig;
use crate::error::CoreResult;
use nodesync_protocol::{actions, Clock, ClusterLock, LockType, STOPPED_SERVER_ID};
use nodesync_store::LockStore;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Lock flavor requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// One holder in the cluster.
    Exclusive,
    /// Any number of holders while shared admission is on.
    Shared,
}

impl From<LockKind> for LockType {
    fn from(kind: LockKind) -> Self {
        match kind {
            LockKind::Exclusive => LockType::Exclusive,
            LockKind::Shared => LockType::Shared,
        }
    }
}

/// Result of a lock attempt. Not acquiring is a normal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now holds the lock.
    Acquired,
    /// Someone else holds it; skip this cycle.
    Busy,
}

impl LockOutcome {
    /// Returns true if the lock was acquired.
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired)
    }
}

/// Time an administrative stop parks a lock into the future.
const INFINITE_LOCK_SPAN: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Cluster lock manager.
pub struct ClusterLockService {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
    server_id: String,
}

impl ClusterLockService {
    /// Creates a lock manager and resolves this server's id.
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        let server_id = config.resolve_server_id();
        tracing::info!(server_id = %server_id, enabled = config.enabled, "cluster lock server id");
        Self {
            store,
            clock,
            config,
            server_id,
        }
    }

    /// This server's id as written into lock rows.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Returns true if cluster locking is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Inserts the well-known lock rows and clears locks this server held
    /// before a restart.
    pub fn init(&self) -> CoreResult<()> {
        for action in actions::EXCLUSIVE {
            self.store
                .insert_lock(ClusterLock::new(action, LockType::Exclusive))?;
        }
        for action in actions::SHARED {
            self.store.insert_lock(ClusterLock::new(action, LockType::Shared))?;
        }
        let cleared = self.store.reset_locks(&self.server_id)?;
        if cleared > 0 {
            tracing::info!(server_id = %self.server_id, cleared, "cleared locks left by a previous run");
        }
        Ok(())
    }

    /// Tries once to take a lock.
    pub fn lock(&self, action: &str, kind: LockKind) -> CoreResult<LockOutcome> {
        if !self.config.enabled {
            return Ok(LockOutcome::Acquired);
        }
        let existing = self.ensure_row(action, kind)?;
        let now = self.clock.now();
        let cutoff = now.minus(self.config.lock_timeout);
        let acquired = match kind {
            LockKind::Exclusive => self
                .store
                .lock_exclusive(action, &self.server_id, now, cutoff)?,
            LockKind::Shared => self.store.lock_shared(action, &self.server_id, now, cutoff)?,
        };
        if !acquired {
            tracing::debug!(action, ?kind, holder = ?existing.locking_server_id, "lock is busy");
            return Ok(LockOutcome::Busy);
        }
        if existing.is_stale(cutoff) {
            tracing::warn!(
                action,
                previous_holder = ?existing.locking_server_id,
                "took over a stale lock"
            );
        }
        Ok(LockOutcome::Acquired)
    }

    /// Retries [`lock`](Self::lock) until `wait` elapses. A failing exclusive
    /// attempt stops shared admission so current shared holders drain.
    pub fn lock_wait(&self, action: &str, kind: LockKind, wait: Duration) -> CoreResult<bool> {
        let started = self.clock.now();
        let mut drained = false;
        loop {
            if self.lock(action, kind)?.is_acquired() {
                return Ok(true);
            }
            if kind == LockKind::Exclusive && !drained {
                drained = self.store.disable_shared(action)?;
            }
            let elapsed = self.clock.now().since(started);
            if elapsed >= wait {
                return Ok(false);
            }
            thread::sleep(self.config.wait_poll.min(wait - elapsed));
        }
    }

    /// Releases a lock taken by this server.
    pub fn unlock(&self, action: &str, kind: LockKind) -> CoreResult<bool> {
        if !self.config.enabled {
            return Ok(true);
        }
        let released = match kind {
            LockKind::Exclusive => self.store.release_exclusive(action, &self.server_id)?,
            LockKind::Shared => self.store.release_shared(action)?,
        };
        if !released {
            tracing::warn!(action, ?kind, server_id = %self.server_id, "lock was not held at release");
        }
        Ok(released)
    }

    /// Re-stamps a lock this server holds once the stamp is older than the
    /// refresh interval.
    pub fn refresh_lock(&self, action: &str) -> CoreResult<bool> {
        if !self.config.enabled {
            return Ok(true);
        }
        let now = self.clock.now();
        let cutoff = now.minus(self.config.refresh_interval);
        Ok(self
            .store
            .refresh_lock(action, &self.server_id, now, cutoff)?)
    }

    /// Stops admitting new shared holders.
    pub fn disable_shared(&self, action: &str) -> CoreResult<bool> {
        Ok(self.store.disable_shared(action)?)
    }

    /// Parks a lock under the reserved `STOPPED` holder until it is cleared.
    pub fn acquire_infinite_lock(&self, action: &str) -> CoreResult<LockOutcome> {
        self.ensure_row(action, LockKind::Exclusive)?;
        let now = self.clock.now();
        let cutoff = now.minus(self.config.lock_timeout);
        let forever = now.plus(INFINITE_LOCK_SPAN);
        if self
            .store
            .lock_exclusive(action, STOPPED_SERVER_ID, forever, cutoff)?
        {
            tracing::info!(action, "stopped job with an infinite lock");
            Ok(LockOutcome::Acquired)
        } else {
            Ok(LockOutcome::Busy)
        }
    }

    /// Clears an infinite lock.
    pub fn clear_infinite_lock(&self, action: &str) -> CoreResult<bool> {
        let cleared = self.store.release_exclusive(action, STOPPED_SERVER_ID)?;
        if cleared {
            tracing::info!(action, "cleared infinite lock");
        }
        Ok(cleared)
    }

    /// Returns true if the lock is parked under `STOPPED`.
    pub fn is_infinite_locked(&self, action: &str) -> CoreResult<bool> {
        Ok(self
            .store
            .find_lock(action)?
            .is_some_and(|lock| lock.locking_server_id.as_deref() == Some(STOPPED_SERVER_ID)))
    }

    /// Every lock row, for diagnostics.
    pub fn find_locks(&self) -> CoreResult<Vec<ClusterLock>> {
        Ok(self.store.list_locks()?)
    }

    fn ensure_row(&self, action: &str, kind: LockKind) -> CoreResult<ClusterLock> {
        if let Some(lock) = self.store.find_lock(action)? {
            return Ok(lock);
        }
        let lock = ClusterLock::new(action, kind.into());
        self.store.insert_lock(lock.clone())?;
        Ok(lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_protocol::{ManualClock, SystemClock, Timestamp};
    use nodesync_store::MemoryStore;
    use std::sync::Barrier;

    fn service(
        store: &Arc<MemoryStore>,
        clock: &Arc<ManualClock>,
        server: &str,
    ) -> ClusterLockService {
        let store: Arc<dyn LockStore> = store.clone();
        let clock: Arc<dyn Clock> = clock.clone();
        ClusterLockService::new(store, clock, LockConfig::default().with_server_id(server))
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>) {
        (
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(Timestamp::from_millis(10_000_000))),
        )
    }

    #[test]
    fn exclusive_lock_is_exclusive() {
        let (store, clock) = setup();
        let a = service(&store, &clock, "a");
        let b = service(&store, &clock, "b");
        a.init().unwrap();

        assert_eq!(a.lock(actions::PUSH, LockKind::Exclusive).unwrap(), LockOutcome::Acquired);
        assert_eq!(b.lock(actions::PUSH, LockKind::Exclusive).unwrap(), LockOutcome::Busy);
        assert_eq!(a.lock(actions::PUSH, LockKind::Exclusive).unwrap(), LockOutcome::Busy);

        assert!(!b.unlock(actions::PUSH, LockKind::Exclusive).unwrap());
        assert!(a.unlock(actions::PUSH, LockKind::Exclusive).unwrap());
        assert!(b.lock(actions::PUSH, LockKind::Exclusive).unwrap().is_acquired());

        let lock = store.find_lock(actions::PUSH).unwrap().unwrap();
        assert_eq!(lock.locking_server_id.as_deref(), Some("b"));
        assert_eq!(lock.last_locking_server_id.as_deref(), Some("a"));
    }

    fn contend(
        store: &Arc<MemoryStore>,
        clock: &Arc<ManualClock>,
        kind: LockKind,
        servers: usize,
    ) -> usize {
        let barrier = Arc::new(Barrier::new(servers));
        let handles: Vec<_> = (0..servers)
            .map(|i| {
                let locks = service(store, clock, &format!("server-{i}"));
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    locks.lock(actions::ROUTE, kind).unwrap().is_acquired()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|acquired| *acquired)
            .count()
    }

    #[test]
    fn concurrent_exclusive_attempts_have_one_winner() {
        for _ in 0..20 {
            let (store, clock) = setup();
            assert_eq!(contend(&store, &clock, LockKind::Exclusive, 2), 1);
            assert_eq!(contend(&store, &clock, LockKind::Exclusive, 8), 0);

            let lock = store.find_lock(actions::ROUTE).unwrap().unwrap();
            assert!(lock.locking_server_id.is_some());
            assert_eq!(lock.shared_count, 0);
        }
    }

    #[test]
    fn concurrent_shared_attempts_all_hold_the_lock() {
        let (store, clock) = setup();
        assert_eq!(contend(&store, &clock, LockKind::Shared, 8), 8);

        let lock = store.find_lock(actions::ROUTE).unwrap().unwrap();
        assert_eq!(lock.shared_count, 8);
        assert!(!service(&store, &clock, "writer")
            .lock(actions::ROUTE, LockKind::Exclusive)
            .unwrap()
            .is_acquired());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let (store, clock) = setup();
        let a = service(&store, &clock, "a");
        let b = service(&store, &clock, "b");
        assert!(a.lock(actions::ROUTE, LockKind::Exclusive).unwrap().is_acquired());

        clock.advance(Duration::from_secs(29 * 60));
        assert!(!b.lock(actions::ROUTE, LockKind::Exclusive).unwrap().is_acquired());
        clock.advance(Duration::from_secs(2 * 60));
        assert!(b.lock(actions::ROUTE, LockKind::Exclusive).unwrap().is_acquired());
    }

    #[test]
    fn shared_lock_counts_holders() {
        let (store, clock) = setup();
        let a = service(&store, &clock, "a");
        a.init().unwrap();
        for _ in 0..3 {
            assert!(a.lock(actions::FILE_SYNC_SHARED, LockKind::Shared).unwrap().is_acquired());
        }
        let lock = store.find_lock(actions::FILE_SYNC_SHARED).unwrap().unwrap();
        assert_eq!(lock.shared_count, 3);
        assert!(!a.lock(actions::FILE_SYNC_SHARED, LockKind::Exclusive).unwrap().is_acquired());

        for _ in 0..3 {
            assert!(a.unlock(actions::FILE_SYNC_SHARED, LockKind::Shared).unwrap());
        }
        let lock = store.find_lock(actions::FILE_SYNC_SHARED).unwrap().unwrap();
        assert_eq!(lock.shared_count, 0);
        assert!(lock.locking_server_id.is_none());
        assert!(a.lock(actions::FILE_SYNC_SHARED, LockKind::Exclusive).unwrap().is_acquired());
    }

    #[test]
    fn disabled_shared_admits_no_new_holders() {
        let (store, clock) = setup();
        let a = service(&store, &clock, "a");
        assert!(a.lock("JOB", LockKind::Shared).unwrap().is_acquired());
        assert!(a.disable_shared("JOB").unwrap());
        assert!(!a.lock("JOB", LockKind::Shared).unwrap().is_acquired());
        assert!(a.unlock("JOB", LockKind::Shared).unwrap());
        assert!(a.lock("JOB", LockKind::Exclusive).unwrap().is_acquired());
    }

    #[test]
    fn init_resets_own_locks() {
        let (store, clock) = setup();
        let a = service(&store, &clock, "a");
        a.init().unwrap();
        assert!(a.lock(actions::PURGE_OUTGOING, LockKind::Exclusive).unwrap().is_acquired());

        let restarted = service(&store, &clock, "a");
        restarted.init().unwrap();
        assert!(restarted
            .lock(actions::PURGE_OUTGOING, LockKind::Exclusive)
            .unwrap()
            .is_acquired());
        assert_eq!(a.find_locks().unwrap().len(), 10);
    }

    #[test]
    fn refresh_restamps_after_interval() {
        let (store, clock) = setup();
        let a = service(&store, &clock, "a");
        let b = service(&store, &clock, "b");
        assert!(a.lock(actions::WATCHDOG, LockKind::Exclusive).unwrap().is_acquired());

        assert!(!a.refresh_lock(actions::WATCHDOG).unwrap());
        clock.advance(Duration::from_secs(21 * 60));
        assert!(a.refresh_lock(actions::WATCHDOG).unwrap());
        assert!(!b.refresh_lock(actions::WATCHDOG).unwrap());

        clock.advance(Duration::from_secs(15 * 60));
        assert!(!b.lock(actions::WATCHDOG, LockKind::Exclusive).unwrap().is_acquired());
    }

    #[test]
    fn infinite_lock_blocks_until_cleared() {
        let (store, clock) = setup();
        let a = service(&store, &clock, "a");
        assert!(a.acquire_infinite_lock(actions::PULL).unwrap().is_acquired());
        assert!(a.is_infinite_locked(actions::PULL).unwrap());

        clock.advance(Duration::from_secs(365 * 24 * 60 * 60));
        assert!(!a.lock(actions::PULL, LockKind::Exclusive).unwrap().is_acquired());

        assert!(a.clear_infinite_lock(actions::PULL).unwrap());
        assert!(!a.is_infinite_locked(actions::PULL).unwrap());
        assert!(a.lock(actions::PULL, LockKind::Exclusive).unwrap().is_acquired());
    }

    #[test]
    fn disabled_locking_always_succeeds() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
        let a = ClusterLockService::new(
            Arc::clone(&store),
            Arc::new(SystemClock),
            LockConfig::default().with_server_id("a").with_enabled(false),
        );
        assert!(a.lock(actions::PUSH, LockKind::Exclusive).unwrap().is_acquired());
        assert!(a.lock(actions::PUSH, LockKind::Exclusive).unwrap().is_acquired());
        assert!(store.find_lock(actions::PUSH).unwrap().is_none());
    }

    #[test]
    fn lock_wait_drains_shared_holders() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
        let config = LockConfig::default()
            .with_server_id("a")
            .with_wait_poll(Duration::from_millis(5));
        let locks = Arc::new(ClusterLockService::new(
            store,
            Arc::new(SystemClock),
            config,
        ));
        assert!(locks.lock("JOB", LockKind::Shared).unwrap().is_acquired());

        let releaser = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                locks.unlock("JOB", LockKind::Shared).unwrap()
            })
        };
        assert!(locks
            .lock_wait("JOB", LockKind::Exclusive, Duration::from_secs(5))
            .unwrap());
        assert!(releaser.join().unwrap());
        assert!(!locks.lock("JOB", LockKind::Shared).unwrap().is_acquired());
    }

    #[test]
    fn lock_wait_gives_up() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let a = ClusterLockService::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            LockConfig::default().with_server_id("a"),
        );
        let b = ClusterLockService::new(
            store,
            clock,
            LockConfig::default()
                .with_server_id("b")
                .with_wait_poll(Duration::from_millis(5)),
        );
        assert!(a.lock("JOB", LockKind::Exclusive).unwrap().is_acquired());
        assert!(!b
            .lock_wait("JOB", LockKind::Exclusive, Duration::from_millis(40))
            .unwrap());
    }
}
