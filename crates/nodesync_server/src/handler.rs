//! Request handlers for the sync endpoints.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use nodesync_core::{AckSummary, LoadedBatch, NodeServices};
use nodesync_engine::stage_batches;
use nodesync_protocol::{
    encode_acks, parse_acks, AckRequest, AckResponse, Batch, BatchStatus, BatchStatusRequest,
    CommunicationType, Node, PullRequest, PullResponse, PushRequest, ReservationRequest,
    ReservationResponse, Timestamp,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// State shared by every request.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Services of the local node.
    pub services: Arc<NodeServices>,
    validator: Option<TokenValidator>,
    reservations: RwLock<HashMap<String, Reservation>>,
}

/// A granted session slot.
#[derive(Debug, Clone)]
struct Reservation {
    node_id: String,
    channel_id: String,
    communication_type: CommunicationType,
    expires_at: Timestamp,
    in_use: bool,
}

/// Holds a reservation while its request runs and frees the slot on drop.
struct Session {
    context: Arc<HandlerContext>,
    reservation_id: String,
    channel_id: String,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.context.reservations.write().remove(&self.reservation_id);
    }
}

impl HandlerContext {
    /// Creates the context.
    pub fn new(config: ServerConfig, services: Arc<NodeServices>) -> Self {
        let validator = config
            .auth
            .clone()
            .map(|auth| TokenValidator::new(auth, Arc::clone(&services.clock)));
        Self {
            config,
            services,
            validator,
            reservations: RwLock::new(HashMap::new()),
        }
    }

    /// Token validator, when authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    /// Reservations currently held, expired ones excluded.
    pub fn active_reservations(&self) -> usize {
        let now = self.services.clock.now();
        let mut reservations = self.reservations.write();
        Self::purge_expired(&mut reservations, now);
        reservations.len()
    }

    fn authenticate(&self, node_id: &str, token: &[u8]) -> ServerResult<Node> {
        let node = self
            .services
            .directory
            .find_node(node_id)
            .ok_or_else(|| ServerError::NotAuthorized(format!("unknown node {}", node_id)))?;
        if !node.sync_enabled {
            return Err(ServerError::NotAuthorized(format!(
                "sync is disabled for {}",
                node_id
            )));
        }
        if let Some(validator) = &self.validator {
            validator.validate_token(token, node_id)?;
        }
        Ok(node)
    }

    fn reserve(&self, request: &ReservationRequest) -> ServerResult<String> {
        let now = self.services.clock.now();
        let mut reservations = self.reservations.write();
        Self::purge_expired(&mut reservations, now);

        let max = self.config.max_concurrent_sessions;
        if reservations.len() >= max {
            return Err(ServerError::Busy {
                active: reservations.len(),
                max,
            });
        }

        let reservation_id = Uuid::new_v4().to_string();
        reservations.insert(
            reservation_id.clone(),
            Reservation {
                node_id: request.node_id.clone(),
                channel_id: request.channel_id.clone(),
                communication_type: request.communication_type,
                expires_at: now.plus(self.config.reservation_timeout),
                in_use: false,
            },
        );
        Ok(reservation_id)
    }

    fn claim(
        self: &Arc<Self>,
        reservation_id: &str,
        node_id: &str,
        kind: CommunicationType,
    ) -> ServerResult<Session> {
        let now = self.services.clock.now();
        let mut reservations = self.reservations.write();
        Self::purge_expired(&mut reservations, now);

        let reservation = reservations
            .get_mut(reservation_id)
            .ok_or_else(|| ServerError::InvalidReservation(reservation_id.to_string()))?;
        if reservation.in_use
            || reservation.node_id != node_id
            || reservation.communication_type != kind
        {
            return Err(ServerError::InvalidReservation(reservation_id.to_string()));
        }
        reservation.in_use = true;
        let channel_id = reservation.channel_id.clone();
        drop(reservations);

        Ok(Session {
            context: Arc::clone(self),
            reservation_id: reservation_id.to_string(),
            channel_id,
        })
    }

    fn purge_expired(reservations: &mut HashMap<String, Reservation>, now: Timestamp) {
        reservations.retain(|_, r| r.in_use || r.expires_at > now);
    }
}

/// A push being received on a claimed reservation.
///
/// Each batch is loaded as it arrives. The reservation is freed when the
/// push is finished or dropped.
pub struct InboundPush {
    session: Session,
    node_id: String,
    loaded: Vec<LoadedBatch>,
}

impl InboundPush {
    /// Loads the batches framed in `payload`.
    pub fn receive(&mut self, payload: &[u8]) -> ServerResult<()> {
        let loaded = self.session.context.services.loader.load_payload(payload)?;
        self.loaded.extend(loaded);
        Ok(())
    }

    /// Batches loaded so far.
    pub fn loaded(&self) -> usize {
        self.loaded.len()
    }

    /// Ends the push and returns the acks of every loaded batch.
    pub fn finish(self) -> AckResponse {
        let acks = self.session.context.services.loader.acks_for(&self.loaded);
        tracing::info!(
            node_id = %self.node_id,
            channel_id = %self.session.channel_id,
            batches = self.loaded.len(),
            in_error = acks.iter().filter(|a| !a.is_ok).count(),
            "received pushed batches"
        );
        let (acks, extended) = encode_acks(&acks);
        AckResponse { acks, extended }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Grants a session slot.
    pub fn handle_reservation(
        &self,
        request: &ReservationRequest,
    ) -> ServerResult<ReservationResponse> {
        self.context
            .authenticate(&request.node_id, &request.security_token)?;
        if self
            .context
            .config
            .disabled_channels
            .contains(&request.channel_id)
        {
            return Err(ServerError::ChannelDisabled(request.channel_id.clone()));
        }
        let reservation_id = self.context.reserve(request)?;
        tracing::debug!(
            node_id = %request.node_id,
            channel_id = %request.channel_id,
            kind = %request.communication_type,
            reservation_id = %reservation_id,
            "granted reservation"
        );
        Ok(ReservationResponse { reservation_id })
    }

    /// Claims a push reservation and opens the stream its batches arrive on.
    pub fn open_push(&self, request: &PushRequest) -> ServerResult<InboundPush> {
        self.context
            .authenticate(&request.node_id, &request.security_token)?;
        let session = self.context.claim(
            &request.reservation_id,
            &request.node_id,
            CommunicationType::Push,
        )?;
        let mut inbound = InboundPush {
            session,
            node_id: request.node_id.clone(),
            loaded: Vec::new(),
        };
        if !request.payload.is_empty() {
            inbound.receive(&request.payload)?;
        }
        Ok(inbound)
    }

    /// Loads pushed batches and answers with their acks.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<AckResponse> {
        Ok(self.open_push(&request)?.finish())
    }

    /// Stages pending batches for the caller and marks them loading.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        self.context
            .authenticate(&request.node_id, &request.security_token)?;
        let session = self.context.claim(
            &request.reservation_id,
            &request.node_id,
            CommunicationType::Pull,
        )?;
        if session.channel_id != request.channel_id {
            return Err(ServerError::InvalidReservation(format!(
                "{} was granted for channel {}",
                session.reservation_id, session.channel_id
            )));
        }

        let services = &self.context.services;
        let batches = services
            .outgoing
            .sendable_batches(&request.node_id, &request.channel_id)?;
        let mut payload = Vec::new();
        let mut sent: Vec<Batch> = Vec::new();
        stage_batches(
            services,
            batches,
            self.context.config.max_pull_bytes,
            |staged| {
                payload.extend_from_slice(&staged.payload);
                sent.push(staged.batch);
                true
            },
        )?;
        for batch in sent
            .iter_mut()
            .filter(|b| b.status == BatchStatus::Sending)
        {
            batch.status = BatchStatus::Loading;
            services.outgoing.update(batch)?;
        }

        if !sent.is_empty() {
            tracing::info!(
                node_id = %request.node_id,
                channel_id = %request.channel_id,
                batches = sent.len(),
                bytes = payload.len(),
                "served pull"
            );
        }
        Ok(PullResponse {
            payload,
            batch_count: sent.len(),
        })
    }

    /// Applies acks for batches the caller pulled.
    pub fn handle_ack(&self, request: AckRequest) -> ServerResult<AckSummary> {
        self.context
            .authenticate(&request.node_id, &request.security_token)?;
        let parsed = parse_acks(
            &request.node_id,
            &request.acks.acks,
            Some(request.acks.extended.as_str()),
        );
        for line in &parsed.unexpected {
            tracing::warn!(node_id = %request.node_id, line = %line, "unexpected ack line");
        }
        let summary = self.context.services.acks.process_acks(parsed.acks, &[]);
        tracing::debug!(
            node_id = %request.node_id,
            ok = summary.ok,
            error = summary.error,
            ignored = summary.ignored,
            "applied acks"
        );
        Ok(summary)
    }

    /// Reports the incoming ledger view of batches the caller sent.
    pub fn handle_batch_status(&self, request: BatchStatusRequest) -> ServerResult<AckResponse> {
        self.context
            .authenticate(&request.node_id, &request.security_token)?;
        let services = &self.context.services;
        let acks = services.incoming.status_acks(
            &request.node_id,
            &request.batch_ids,
            &services.local_node_id(),
        )?;
        let (acks, extended) = encode_acks(&acks);
        Ok(AckResponse { acks, extended })
    }
}
