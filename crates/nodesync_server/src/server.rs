//! Main sync server.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::{HandlerContext, InboundPush, RequestHandler};
use nodesync_core::NodeServices;
use nodesync_engine::{LoopbackServer, PushSession};
use nodesync_protocol::{
    AckRequest, AckResponse, BatchStatusRequest, PullRequest, PullResponse, PushRequest,
    RemoteError, ReservationRequest, ReservationResponse,
};
use std::sync::Arc;

/// The receiving endpoint of one node.
///
/// Remote nodes reserve a session, then push batches to it or pull
/// batches from it. Failures reach the caller as a [`RemoteError`].
///
/// # Example
///
/// ```rust,ignore
/// use nodesync_engine::LoopbackTransport;
/// use nodesync_server::{ServerConfig, SyncServer};
///
/// let server = Arc::new(SyncServer::new(ServerConfig::default(), services));
/// let transport = LoopbackTransport::new();
/// transport.register("N2", server);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a server over the services of the local node.
    pub fn new(config: ServerConfig, services: Arc<NodeServices>) -> Self {
        let context = Arc::new(HandlerContext::new(config, services));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Shared request state.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Reservations currently held.
    pub fn active_sessions(&self) -> usize {
        self.context.active_reservations()
    }

    fn reply<T>(
        &self,
        operation: &'static str,
        node_id: &str,
        result: Result<T, ServerError>,
    ) -> Result<T, RemoteError> {
        result.map_err(|err| remote_error(operation, node_id, err))
    }
}

fn remote_error(operation: &'static str, node_id: &str, err: ServerError) -> RemoteError {
    if err.is_server_error() {
        tracing::error!(operation, node_id = %node_id, error = %err, "request failed");
    } else {
        tracing::debug!(operation, node_id = %node_id, error = %err, "request refused");
    }
    err.into_remote()
}

/// Push stream of a [`SyncServer`] as seen through the loopback transport.
struct LoopbackPush {
    inbound: InboundPush,
    node_id: String,
}

impl PushSession for LoopbackPush {
    fn send_batch(&mut self, payload: &[u8]) -> Result<(), RemoteError> {
        self.inbound
            .receive(payload)
            .map_err(|err| remote_error("push", &self.node_id, err))
    }

    fn finish(self: Box<Self>) -> Result<AckResponse, RemoteError> {
        Ok(self.inbound.finish())
    }
}

impl LoopbackServer for SyncServer {
    fn handle_reservation(
        &self,
        request: &ReservationRequest,
    ) -> Result<ReservationResponse, RemoteError> {
        let result = self.handler.handle_reservation(request);
        self.reply("reserve", &request.node_id, result)
    }

    fn open_push(&self, request: PushRequest) -> Result<Box<dyn PushSession>, RemoteError> {
        let result = self.handler.open_push(&request);
        let inbound = self.reply("push", &request.node_id, result)?;
        Ok(Box::new(LoopbackPush {
            inbound,
            node_id: request.node_id,
        }))
    }

    fn handle_pull(&self, request: PullRequest) -> Result<PullResponse, RemoteError> {
        let node_id = request.node_id.clone();
        let result = self.handler.handle_pull(request);
        self.reply("pull", &node_id, result)
    }

    fn handle_ack(&self, request: AckRequest) -> Result<(), RemoteError> {
        let node_id = request.node_id.clone();
        let result = self.handler.handle_ack(request).map(|_| ());
        self.reply("ack", &node_id, result)
    }

    fn handle_batch_status(
        &self,
        request: BatchStatusRequest,
    ) -> Result<AckResponse, RemoteError> {
        let node_id = request.node_id.clone();
        let result = self.handler.handle_batch_status(request);
        self.reply("batch_status", &node_id, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_protocol::CommunicationType;
    use nodesync_testkit::TestNode;

    #[test]
    fn refusals_map_to_remote_errors() {
        let (_, receiver) = TestNode::pair("N1", "N2");
        let server = SyncServer::new(
            ServerConfig::new().with_disabled_channel("reload"),
            Arc::clone(&receiver.services),
        );
        let mut request = ReservationRequest {
            node_id: "N1".to_string(),
            security_token: Vec::new(),
            channel_id: "reload".to_string(),
            communication_type: CommunicationType::Push,
        };

        assert_eq!(
            server.handle_reservation(&request),
            Err(RemoteError::ChannelDisabled("reload".to_string()))
        );

        request.channel_id = "default".to_string();
        assert!(server.handle_reservation(&request).is_ok());
        assert_eq!(server.active_sessions(), 1);

        request.node_id = "N7".to_string();
        assert_eq!(
            server.handle_reservation(&request),
            Err(RemoteError::ConnectionRejected)
        );
    }

    #[test]
    fn malformed_push_is_an_internal_failure() {
        let (_, receiver) = TestNode::pair("N1", "N2");
        let server = SyncServer::new(ServerConfig::new(), Arc::clone(&receiver.services));
        let granted = server
            .handle_reservation(&ReservationRequest {
                node_id: "N1".to_string(),
                security_token: Vec::new(),
                channel_id: "default".to_string(),
                communication_type: CommunicationType::Push,
            })
            .unwrap();

        let mut session = server
            .open_push(PushRequest {
                reservation_id: granted.reservation_id,
                node_id: "N1".to_string(),
                security_token: Vec::new(),
                payload: Vec::new(),
            })
            .unwrap();
        assert_eq!(server.active_sessions(), 1);
        let result = session.send_batch(b"not a frame\n");
        drop(session);
        assert!(matches!(result, Err(RemoteError::Internal(_))));
        assert_eq!(server.active_sessions(), 0);
    }
}
