//! In-process transport that routes requests straight to a server.

use crate::transport::{PushSession, TransportManager};
use nodesync_protocol::{
    AckRequest, AckResponse, BatchStatusRequest, Node, PullRequest, PullResponse, PushRequest,
    RemoteError, ReservationRequest, ReservationResponse,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a reservation request.
    fn handle_reservation(
        &self,
        request: &ReservationRequest,
    ) -> Result<ReservationResponse, RemoteError>;

    /// Opens a push stream; batches are loaded as they arrive.
    fn open_push(&self, request: PushRequest) -> Result<Box<dyn PushSession>, RemoteError>;

    /// Handles a pull.
    fn handle_pull(&self, request: PullRequest) -> Result<PullResponse, RemoteError>;

    /// Handles acks for pulled batches.
    fn handle_ack(&self, request: AckRequest) -> Result<(), RemoteError>;

    /// Handles a batch status query.
    fn handle_batch_status(&self, request: BatchStatusRequest)
        -> Result<AckResponse, RemoteError>;
}

/// A transport that connects nodes living in one process.
///
/// Each remote node id maps to a server. Unknown or disconnected nodes are
/// reported as unreachable.
#[derive(Default)]
pub struct LoopbackTransport {
    servers: RwLock<HashMap<String, Arc<dyn LoopbackServer>>>,
    disconnected: RwLock<HashSet<String>>,
}

impl LoopbackTransport {
    /// Creates a transport with no servers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes requests for `node_id` to `server`.
    pub fn register(&self, node_id: impl Into<String>, server: Arc<dyn LoopbackServer>) {
        self.servers.write().insert(node_id.into(), server);
    }

    /// Simulates a network failure to `node_id`.
    pub fn set_connected(&self, node_id: &str, connected: bool) {
        if connected {
            self.disconnected.write().remove(node_id);
        } else {
            self.disconnected.write().insert(node_id.to_string());
        }
    }

    fn server(&self, remote: &Node) -> Result<Arc<dyn LoopbackServer>, RemoteError> {
        if self.disconnected.read().contains(&remote.node_id) {
            return Err(RemoteError::Unreachable(format!(
                "{} is disconnected",
                remote.sync_url
            )));
        }
        self.servers
            .read()
            .get(&remote.node_id)
            .cloned()
            .ok_or_else(|| RemoteError::Unreachable(format!("no server at {}", remote.sync_url)))
    }
}

impl TransportManager for LoopbackTransport {
    fn reserve(
        &self,
        remote: &Node,
        request: &ReservationRequest,
    ) -> Result<ReservationResponse, RemoteError> {
        self.server(remote)?.handle_reservation(request)
    }

    fn open_push(
        &self,
        remote: &Node,
        request: PushRequest,
    ) -> Result<Box<dyn PushSession>, RemoteError> {
        self.server(remote)?.open_push(request)
    }

    fn pull(&self, remote: &Node, request: PullRequest) -> Result<PullResponse, RemoteError> {
        self.server(remote)?.handle_pull(request)
    }

    fn send_acks(&self, remote: &Node, request: AckRequest) -> Result<(), RemoteError> {
        self.server(remote)?.handle_ack(request)
    }

    fn batch_status(
        &self,
        remote: &Node,
        request: BatchStatusRequest,
    ) -> Result<AckResponse, RemoteError> {
        self.server(remote)?.handle_batch_status(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_protocol::CommunicationType;

    struct Busy;

    impl LoopbackServer for Busy {
        fn handle_reservation(
            &self,
            _request: &ReservationRequest,
        ) -> Result<ReservationResponse, RemoteError> {
            Err(RemoteError::ServiceUnavailable)
        }

        fn open_push(&self, _request: PushRequest) -> Result<Box<dyn PushSession>, RemoteError> {
            Err(RemoteError::ServiceUnavailable)
        }

        fn handle_pull(&self, _request: PullRequest) -> Result<PullResponse, RemoteError> {
            Ok(PullResponse::default())
        }

        fn handle_ack(&self, _request: AckRequest) -> Result<(), RemoteError> {
            Ok(())
        }

        fn handle_batch_status(
            &self,
            _request: BatchStatusRequest,
        ) -> Result<AckResponse, RemoteError> {
            Ok(AckResponse::default())
        }
    }

    fn reservation() -> ReservationRequest {
        ReservationRequest {
            node_id: "N1".into(),
            security_token: Vec::new(),
            channel_id: "default".into(),
            communication_type: CommunicationType::Pull,
        }
    }

    #[test]
    fn routes_to_registered_server() {
        let transport = LoopbackTransport::new();
        transport.register("N2", Arc::new(Busy));
        let remote = Node::new("N2", "store");

        assert_eq!(
            transport.reserve(&remote, &reservation()),
            Err(RemoteError::ServiceUnavailable)
        );
    }

    #[test]
    fn unknown_and_disconnected_nodes_are_unreachable() {
        let transport = LoopbackTransport::new();
        transport.register("N2", Arc::new(Busy));

        let err = transport
            .reserve(&Node::new("N3", "store"), &reservation())
            .unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable(_)));

        transport.set_connected("N2", false);
        let remote = Node::new("N2", "store");
        assert!(matches!(
            transport.reserve(&remote, &reservation()),
            Err(RemoteError::Unreachable(_))
        ));
        transport.set_connected("N2", true);
        assert_eq!(
            transport.reserve(&remote, &reservation()),
            Err(RemoteError::ServiceUnavailable)
        );
    }
}
