//! Push sessions: send pending outgoing batches to one remote node.

use crate::config::PushConfig;
use crate::error::{EngineError, EngineResult};
use crate::offline::TransportErrorTracker;
use crate::pipeline::{extract_stage, StagedItem};
use crate::status::{RemoteNodeStatus, RemoteStatus};
use crate::transport::{PushSession, TransportManager};
use nodesync_core::NodeServices;
use nodesync_protocol::{
    parse_acks, Batch, BatchStatus, BatchStatusRequest, CommunicationKey, CommunicationType, Node,
    PushRequest, ReservationRequest,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Pushes outgoing batches of one (node, channel) pair per call.
pub struct PushService {
    services: Arc<NodeServices>,
    transport: Arc<dyn TransportManager>,
    tracker: Arc<TransportErrorTracker>,
    config: PushConfig,
}

impl PushService {
    /// Creates the push service.
    pub fn new(
        services: Arc<NodeServices>,
        transport: Arc<dyn TransportManager>,
        tracker: Arc<TransportErrorTracker>,
        config: PushConfig,
    ) -> Self {
        Self {
            services,
            transport,
            tracker,
            config,
        }
    }

    /// Runs one push session. Failures are folded into the returned status.
    pub async fn push_to(&self, key: &CommunicationKey) -> RemoteNodeStatus {
        let status = RemoteNodeStatus::new(&key.node_id, &key.channel_id);
        match self.push_session(key, status.clone()).await {
            Ok(status) => status,
            Err(err) if err.is_rejection() => {
                tracing::debug!(node_id = %key.node_id, channel_id = %key.channel_id, error = %err, "push rejected");
                status.with_status(RemoteStatus::Busy)
            }
            Err(err) if err.is_offline() => {
                self.tracker.record_failure(&key.node_id, &err);
                status.with_status(RemoteStatus::Offline)
            }
            Err(err) => {
                tracing::error!(node_id = %key.node_id, channel_id = %key.channel_id, error = %err, "push failed");
                status.failed(err.to_string())
            }
        }
    }

    async fn push_session(
        &self,
        key: &CommunicationKey,
        mut status: RemoteNodeStatus,
    ) -> EngineResult<RemoteNodeStatus> {
        let remote = self
            .services
            .directory
            .find_node(&key.node_id)
            .ok_or_else(|| EngineError::UnknownNode(key.node_id.clone()))?;
        let local_node_id = self.services.local_node_id();

        let batches = self.sendable(key).await?;
        if batches.is_empty() {
            return Ok(status);
        }

        let reservation = self
            .blocking({
                let remote = remote.clone();
                let request = ReservationRequest {
                    node_id: local_node_id.clone(),
                    security_token: remote.security_token.clone(),
                    channel_id: key.channel_id.clone(),
                    communication_type: CommunicationType::Push,
                };
                move |_, transport| Ok(transport.reserve(&remote, &request)?)
            })
            .await?;
        self.tracker.record_success(&remote.node_id);

        let batches = if batches.iter().any(|b| b.status.is_in_flight()) {
            self.reconcile(&remote, &local_node_id, &batches).await?;
            self.sendable(key).await?
        } else {
            batches
        };
        if batches.is_empty() {
            return Ok(status);
        }

        let (tx, mut rx) = mpsc::channel(self.config.queue_capacity);
        let max_bytes = self.config.max_bytes_to_sync;
        let services = Arc::clone(&self.services);
        let extract =
            tokio::task::spawn_blocking(move || extract_stage(&services, batches, max_bytes, tx));

        let mut sent: Vec<Batch> = Vec::new();
        let mut session: Option<Box<dyn PushSession>> = None;
        let mut streamed: EngineResult<()> = Ok(());
        while let Some(item) = rx.recv().await {
            let staged = match item {
                StagedItem::Batch(staged) => staged,
                StagedItem::EndOfMeasurement => break,
            };
            let open = match session.take() {
                Some(open) => open,
                None => {
                    let remote = remote.clone();
                    let request = PushRequest {
                        reservation_id: reservation.reservation_id.clone(),
                        node_id: local_node_id.clone(),
                        security_token: remote.security_token.clone(),
                        payload: Vec::new(),
                    };
                    match self
                        .blocking(move |_, transport| Ok(transport.open_push(&remote, request)?))
                        .await
                    {
                        Ok(open) => open,
                        Err(err) => {
                            streamed = Err(err);
                            break;
                        }
                    }
                }
            };
            let (open, result) = tokio::task::spawn_blocking(move || {
                let mut open = open;
                let result = open.send_batch(&staged.payload);
                (open, result)
            })
            .await?;
            session = Some(open);
            sent.push(staged.batch);
            if let Err(err) = result {
                streamed = Err(err.into());
                break;
            }
        }
        drop(rx);
        let extracted = extract.await?;
        streamed?;
        if let Err(err) = &extracted {
            if err.is_cancellation() {
                tracing::info!(node_id = %key.node_id, error = %err, "push cancelled while extracting");
            } else {
                tracing::warn!(node_id = %key.node_id, error = %err, "extract stopped the push early");
            }
        }
        let Some(session) = session else {
            return match extracted {
                Err(err) if !err.is_cancellation() => Err(err),
                _ => Ok(status),
            };
        };

        let response = tokio::task::spawn_blocking(move || session.finish()).await??;
        self.tracker.record_success(&remote.node_id);

        let summary = self
            .blocking(move |services, _| {
                for batch in sent.iter_mut() {
                    if batch.status == BatchStatus::Sending {
                        batch.status = BatchStatus::Loading;
                        services.outgoing.update(batch)?;
                    }
                }
                let parsed = parse_acks(&remote.node_id, &response.acks, Some(response.extended.as_str()));
                for line in &parsed.unexpected {
                    tracing::warn!(node_id = %remote.node_id, line = %line, "unexpected ack line");
                }
                let rows = sent.iter().map(|b| b.row_count).sum::<u64>();
                let summary = services.acks.process_acks(parsed.acks, &sent);
                Ok((sent.len(), rows, summary))
            })
            .await?;
        let (count, rows, summary) = summary;
        status.record_batches(count, rows, summary.error);
        tracing::info!(
            node_id = %key.node_id,
            channel_id = %key.channel_id,
            batches = count,
            ok = summary.ok,
            error = summary.error,
            missing = summary.missing.len(),
            "pushed batches"
        );

        match extracted {
            Err(err) if !err.is_cancellation() => Ok(status.failed(err.to_string())),
            _ => Ok(status),
        }
    }

    async fn sendable(&self, key: &CommunicationKey) -> EngineResult<Vec<Batch>> {
        let node_id = key.node_id.clone();
        let channel_id = key.channel_id.clone();
        self.blocking(move |services, _| {
            Ok(services.outgoing.sendable_batches(&node_id, &channel_id)?)
        })
        .await
    }

    /// Asks the remote what happened to batches left in flight and applies
    /// the answer as acks.
    async fn reconcile(
        &self,
        remote: &Node,
        local_node_id: &str,
        batches: &[Batch],
    ) -> EngineResult<()> {
        let batch_ids: Vec<_> = batches
            .iter()
            .filter(|b| b.status.is_in_flight())
            .map(|b| b.batch_id)
            .collect();
        let remote = remote.clone();
        let request = BatchStatusRequest {
            node_id: local_node_id.to_string(),
            security_token: remote.security_token.clone(),
            batch_ids,
        };
        self.blocking(move |services, transport| {
            let response = transport.batch_status(&remote, request)?;
            let parsed = parse_acks(&remote.node_id, &response.acks, Some(response.extended.as_str()));
            for ack in &parsed.acks {
                tracing::info!(
                    node_id = %remote.node_id,
                    batch_id = ack.batch_id,
                    ok = ack.is_ok,
                    "reconciled batch left in flight"
                );
                if let Err(err) = services.acks.ack(ack) {
                    tracing::warn!(batch_id = ack.batch_id, error = %err, "could not apply reconciled status");
                }
            }
            Ok(())
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&NodeServices, &dyn TransportManager) -> EngineResult<T> + Send + 'static,
    {
        let services = Arc::clone(&self.services);
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || f(&services, transport.as_ref())).await?
    }
}
