//! Pull sessions: ask one remote node for batches and load them locally.

use crate::config::PullConfig;
use crate::error::{EngineError, EngineResult};
use crate::offline::TransportErrorTracker;
use crate::status::{RemoteNodeStatus, RemoteStatus};
use crate::transport::TransportManager;
use nodesync_core::NodeServices;
use nodesync_protocol::{
    encode_acks, AckRequest, AckResponse, BatchStatus, CommunicationKey, CommunicationType,
    PullRequest, ReservationRequest,
};
use std::sync::Arc;

/// Pulls batches of one (node, channel) pair per call.
pub struct PullService {
    services: Arc<NodeServices>,
    transport: Arc<dyn TransportManager>,
    tracker: Arc<TransportErrorTracker>,
    config: PullConfig,
}

impl PullService {
    /// Creates the pull service.
    pub fn new(
        services: Arc<NodeServices>,
        transport: Arc<dyn TransportManager>,
        tracker: Arc<TransportErrorTracker>,
        config: PullConfig,
    ) -> Self {
        Self {
            services,
            transport,
            tracker,
            config,
        }
    }

    /// Runs pull sessions until the remote has nothing left, a batch fails,
    /// or `max_immediate_pulls` is reached.
    pub async fn pull_from(&self, key: &CommunicationKey) -> RemoteNodeStatus {
        let status = RemoteNodeStatus::new(&key.node_id, &key.channel_id);
        match self.pull_sessions(key, status.clone()).await {
            Ok(status) => status,
            Err(err) if err.is_rejection() => {
                tracing::debug!(node_id = %key.node_id, channel_id = %key.channel_id, error = %err, "pull rejected");
                status.with_status(RemoteStatus::Busy)
            }
            Err(err) if err.is_offline() => {
                self.tracker.record_failure(&key.node_id, &err);
                status.with_status(RemoteStatus::Offline)
            }
            Err(err) => {
                tracing::error!(node_id = %key.node_id, channel_id = %key.channel_id, error = %err, "pull failed");
                status.failed(err.to_string())
            }
        }
    }

    async fn pull_sessions(
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

        for attempt in 1..=self.config.max_immediate_pulls {
            let services = Arc::clone(&self.services);
            let transport = Arc::clone(&self.transport);
            let remote = remote.clone();
            let local_node_id = local_node_id.clone();
            let channel_id = key.channel_id.clone();

            let outcome = tokio::task::spawn_blocking(move || -> EngineResult<_> {
                let reservation = transport.reserve(
                    &remote,
                    &ReservationRequest {
                        node_id: local_node_id.clone(),
                        security_token: remote.security_token.clone(),
                        channel_id: channel_id.clone(),
                        communication_type: CommunicationType::Pull,
                    },
                )?;
                let response = transport.pull(
                    &remote,
                    PullRequest {
                        reservation_id: reservation.reservation_id,
                        node_id: local_node_id.clone(),
                        security_token: remote.security_token.clone(),
                        channel_id,
                    },
                )?;
                if response.batch_count == 0 || response.payload.is_empty() {
                    return Ok(None);
                }

                let loaded = services.loader.load_payload(&response.payload)?;
                let acks = services.loader.acks_for(&loaded);
                let (ack_text, extended) = encode_acks(&acks);
                transport.send_acks(
                    &remote,
                    AckRequest {
                        node_id: local_node_id,
                        security_token: remote.security_token.clone(),
                        acks: AckResponse {
                            acks: ack_text,
                            extended,
                        },
                    },
                )?;

                let rows = loaded.iter().map(|l| l.batch.row_count).sum::<u64>();
                let in_error = loaded
                    .iter()
                    .filter(|l| l.batch.status == BatchStatus::Error)
                    .count();
                Ok(Some((loaded.len(), rows, in_error)))
            })
            .await??;
            self.tracker.record_success(&key.node_id);

            let Some((batches, rows, in_error)) = outcome else {
                break;
            };
            status.record_batches(batches, rows, in_error);
            tracing::info!(
                node_id = %key.node_id,
                channel_id = %key.channel_id,
                attempt,
                batches,
                in_error,
                "pulled batches"
            );
            if in_error > 0 {
                break;
            }
        }
        Ok(status)
    }
}
