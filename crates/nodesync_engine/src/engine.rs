//! The node engine: push, pull and extract cycles for one node.

use crate::config::EngineConfig;
use crate::dispatch::CommunicationDispatcher;
use crate::error::EngineResult;
use crate::offline::TransportErrorTracker;
use crate::pull::PullService;
use crate::push::PushService;
use crate::status::{RemoteNodeStatus, RemoteNodeStatuses};
use crate::transport::TransportManager;
use nodesync_core::NodeServices;
use nodesync_protocol::{actions, Batch, BatchAck, CommunicationType};
use std::sync::Arc;

/// Runs replication cycles of one node against its remote nodes.
///
/// # Example
///
/// ```rust,ignore
/// let engine = NodeEngine::new(services, transport, EngineConfig::default());
/// let statuses = engine.push(false).await?;
/// for status in statuses.iter() {
///     println!("{} {}: {}", status.node_id, status.channel_id, status.status);
/// }
/// ```
pub struct NodeEngine {
    services: Arc<NodeServices>,
    dispatcher: CommunicationDispatcher,
    push: Arc<PushService>,
    pull: Arc<PullService>,
    tracker: Arc<TransportErrorTracker>,
    config: EngineConfig,
}

impl NodeEngine {
    /// Creates an engine over the services of a node.
    pub fn new(
        services: Arc<NodeServices>,
        transport: Arc<dyn TransportManager>,
        config: EngineConfig,
    ) -> Self {
        let tracker = Arc::new(TransportErrorTracker::new(
            Arc::clone(&services.clock),
            config.offline_escalation,
        ));
        let push = Arc::new(PushService::new(
            Arc::clone(&services),
            Arc::clone(&transport),
            Arc::clone(&tracker),
            config.push.clone(),
        ));
        let pull = Arc::new(PullService::new(
            Arc::clone(&services),
            transport,
            Arc::clone(&tracker),
            config.pull.clone(),
        ));
        let dispatcher = CommunicationDispatcher::new(Arc::clone(&services.communications));
        Self {
            services,
            dispatcher,
            push,
            pull,
            tracker,
            config,
        }
    }

    /// Services of the node.
    pub fn services(&self) -> &Arc<NodeServices> {
        &self.services
    }

    /// Configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Transport failures per remote node.
    pub fn transport_errors(&self) -> &TransportErrorTracker {
        &self.tracker
    }

    /// Pushes pending batches to every push target.
    ///
    /// Unless `force` is set, nothing happens while an operator has stopped
    /// the push job with an infinite lock.
    pub async fn push(&self, force: bool) -> EngineResult<RemoteNodeStatuses> {
        if !force && self.is_stopped(actions::PUSH).await? {
            return Ok(RemoteNodeStatuses::new());
        }
        let push = Arc::clone(&self.push);
        self.dispatcher
            .dispatch(CommunicationType::Push, move |key| {
                let push = Arc::clone(&push);
                async move { push.push_to(&key).await }
            })
            .await
    }

    /// Pulls batches from every pull source.
    ///
    /// Unless `force` is set, nothing happens while an operator has stopped
    /// the pull job with an infinite lock.
    pub async fn pull(&self, force: bool) -> EngineResult<RemoteNodeStatuses> {
        if !force && self.is_stopped(actions::PULL).await? {
            return Ok(RemoteNodeStatuses::new());
        }
        let pull = Arc::clone(&self.pull);
        self.dispatcher
            .dispatch(CommunicationType::Pull, move |key| {
                let pull = Arc::clone(&pull);
                async move { pull.pull_from(&key).await }
            })
            .await
    }

    /// Runs pending extract requests of every node.
    pub async fn extract(&self) -> EngineResult<RemoteNodeStatuses> {
        let services = Arc::clone(&self.services);
        self.dispatcher
            .dispatch(CommunicationType::Extract, move |key| {
                let services = Arc::clone(&services);
                async move {
                    let status = RemoteNodeStatus::new(&key.node_id, &key.channel_id);
                    let node_id = key.node_id.clone();
                    let extracted = tokio::task::spawn_blocking(move || {
                        services.extractor.execute_extract_requests(&node_id)
                    })
                    .await;
                    match extracted {
                        Ok(Ok(requests)) => {
                            let mut status = status;
                            status.record_batches(requests, 0, 0);
                            status
                        }
                        Ok(Err(err)) => status.failed(err.to_string()),
                        Err(err) => status.failed(err.to_string()),
                    }
                }
            })
            .await
    }

    /// Applies one ack from a remote node.
    pub fn ack(&self, ack: &BatchAck) -> EngineResult<()> {
        self.services.acks.ack(ack)?;
        Ok(())
    }

    /// Admission control for a batch arriving from a remote node.
    pub fn acquire_incoming_batch(&self, batch: &mut Batch) -> EngineResult<bool> {
        Ok(self.services.incoming.acquire_incoming_batch(batch)?)
    }

    async fn is_stopped(&self, action: &'static str) -> EngineResult<bool> {
        let services = Arc::clone(&self.services);
        let stopped =
            tokio::task::spawn_blocking(move || services.locks.is_infinite_locked(action))
                .await??;
        if stopped {
            tracing::info!(action, "job is stopped by an operator, skipping");
        }
        Ok(stopped)
    }
}
