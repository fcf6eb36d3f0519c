//! Hands (node, channel) pairs to workers under a lease and a local
//! per-type worker limit.

use crate::error::EngineResult;
use crate::status::{RemoteNodeStatus, RemoteNodeStatuses, RemoteStatus};
use nodesync_core::{LeaseOutcome, NodeCommunicationService};
use nodesync_protocol::{CommunicationKey, CommunicationType};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Dispatches units of work of one communication type.
pub struct CommunicationDispatcher {
    communications: Arc<NodeCommunicationService>,
    workers: HashMap<CommunicationType, Arc<Semaphore>>,
}

impl CommunicationDispatcher {
    /// Creates a dispatcher sized from the lease configuration.
    pub fn new(communications: Arc<NodeCommunicationService>) -> Self {
        let workers = [
            CommunicationType::Push,
            CommunicationType::Pull,
            CommunicationType::Extract,
        ]
        .into_iter()
        .map(|kind| {
            let permits = communications.thread_count(kind);
            (kind, Arc::new(Semaphore::new(permits)))
        })
        .collect();
        Self {
            communications,
            workers,
        }
    }

    /// Workers currently free for `kind`.
    pub fn available_workers(&self, kind: CommunicationType) -> usize {
        self.workers
            .get(&kind)
            .map_or(0, |workers| workers.available_permits())
    }

    /// Runs `worker` for every pair of `kind` that has a free local worker
    /// and whose lease can be taken, longest-waiting pairs first.
    ///
    /// Pairs left over once every worker is busy wait for the next cycle.
    /// Pairs whose lease is held elsewhere are reported as busy, and pairs
    /// whose lease could not be read are reported as failed. Every taken
    /// lease is released before this returns.
    pub async fn dispatch<F, Fut>(
        &self,
        kind: CommunicationType,
        worker: F,
    ) -> EngineResult<RemoteNodeStatuses>
    where
        F: Fn(CommunicationKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RemoteNodeStatus> + Send + 'static,
    {
        let communications = Arc::clone(&self.communications);
        let candidates =
            tokio::task::spawn_blocking(move || communications.list(kind)).await??;
        let Some(workers) = self.workers.get(&kind).cloned() else {
            return Ok(RemoteNodeStatuses::new());
        };

        let worker = Arc::new(worker);
        let mut statuses = RemoteNodeStatuses::new();
        let mut running = JoinSet::new();
        for mut communication in candidates {
            let Ok(permit) = Arc::clone(&workers).try_acquire_owned() else {
                tracing::debug!(
                    kind = %kind,
                    lease = %communication.key,
                    "no free worker, pair waits for the next cycle"
                );
                break;
            };

            let key = communication.key.clone();
            let communications = Arc::clone(&self.communications);
            let locked = tokio::task::spawn_blocking(move || {
                let outcome = communications.try_lock(&mut communication);
                (communication, outcome)
            })
            .await;
            let pair = RemoteNodeStatus::new(&key.node_id, &key.channel_id);
            let mut communication = match locked {
                Ok((communication, Ok(LeaseOutcome::Acquired))) => communication,
                Ok((_, Ok(LeaseOutcome::Busy))) => {
                    statuses.add(pair.with_status(RemoteStatus::Busy));
                    continue;
                }
                Ok((_, Err(err))) => {
                    tracing::warn!(lease = %key, error = %err, "could not take lease");
                    statuses.add(pair.failed(err.to_string()));
                    continue;
                }
                Err(err) => {
                    tracing::warn!(lease = %key, error = %err, "lease task failed");
                    statuses.add(pair.failed(err.to_string()));
                    continue;
                }
            };

            let communications = Arc::clone(&self.communications);
            let work = tokio::spawn((*worker)(key.clone()));
            running.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let status = match work.await {
                    Ok(status) => status,
                    Err(err) => {
                        tracing::error!(lease = %key, error = %err, "worker failed");
                        RemoteNodeStatus::new(&key.node_id, &key.channel_id).failed(err.to_string())
                    }
                };
                let success = !status.is_failure();
                let released = tokio::task::spawn_blocking(move || {
                    communications.unlock(&mut communication, success, started.elapsed())
                })
                .await;
                match released {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(lease = %key, error = %err, "could not release lease"),
                    Err(err) => tracing::warn!(lease = %key, error = %err, "lease release task failed"),
                }
                status
            });
        }

        let mut failure = None;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(status) => statuses.add(status),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = failure {
            return Err(err.into());
        }
        Ok(statuses)
    }
}
