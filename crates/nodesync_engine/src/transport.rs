//! Transport layer abstraction for push and pull sessions.

use nodesync_protocol::{
    AckRequest, AckResponse, BatchStatusRequest, Node, PullRequest, PullResponse, PushRequest,
    RemoteError, ReservationRequest, ReservationResponse,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Carries requests to a remote node.
///
/// Calls block until the remote answers. Rejections are reported as
/// [`RemoteError`] values that [`RemoteError::is_rejection`] recognizes.
pub trait TransportManager: Send + Sync {
    /// Reserves a session on the remote.
    fn reserve(
        &self,
        remote: &Node,
        request: &ReservationRequest,
    ) -> Result<ReservationResponse, RemoteError>;

    /// Opens a push stream on a reserved session. `request.payload`, when
    /// not empty, is sent ahead of the first batch.
    fn open_push(
        &self,
        remote: &Node,
        request: PushRequest,
    ) -> Result<Box<dyn PushSession>, RemoteError>;

    /// Asks the remote for batches addressed to the caller.
    fn pull(&self, remote: &Node, request: PullRequest) -> Result<PullResponse, RemoteError>;

    /// Sends load outcomes of pulled batches back to the remote.
    fn send_acks(&self, remote: &Node, request: AckRequest) -> Result<(), RemoteError>;

    /// Asks the remote for its ledger view of batches.
    fn batch_status(
        &self,
        remote: &Node,
        request: BatchStatusRequest,
    ) -> Result<AckResponse, RemoteError>;
}

/// An open push stream.
///
/// Each staged batch is handed over as soon as it is dequeued, so the
/// remote can load it while the next one is extracted.
pub trait PushSession: Send {
    /// Sends the frames of one staged batch.
    fn send_batch(&mut self, payload: &[u8]) -> Result<(), RemoteError>;

    /// Ends the stream and waits for the acks of every batch sent.
    fn finish(self: Box<Self>) -> Result<AckResponse, RemoteError>;
}

type PushObserver = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// A request recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedRequest {
    /// Reservation for a node.
    Reserve(String),
    /// Push to a node.
    Push(String, PushRequest),
    /// Pull from a node.
    Pull(String, PullRequest),
    /// Acks sent to a node.
    Ack(String, AckRequest),
    /// Status query to a node.
    BatchStatus(String, BatchStatusRequest),
}

/// A scripted transport for testing.
///
/// Responses are queued per operation and handed out in order. An empty
/// queue answers with a default response. A push is recorded once its
/// stream is finished, with the frames of every streamed batch.
#[derive(Default)]
pub struct MockTransport {
    reservations: Mutex<VecDeque<Result<ReservationResponse, RemoteError>>>,
    pulls: Mutex<VecDeque<Result<PullResponse, RemoteError>>>,
    statuses: Mutex<VecDeque<Result<AckResponse, RemoteError>>>,
    shared: Arc<MockShared>,
}

#[derive(Default)]
struct MockShared {
    pushes: Mutex<VecDeque<Result<AckResponse, RemoteError>>>,
    failure: Mutex<Option<RemoteError>>,
    requests: Mutex<Vec<RecordedRequest>>,
    streamed: Mutex<Vec<(String, Vec<u8>)>>,
    observer: Mutex<Option<PushObserver>>,
}

impl MockShared {
    fn record(&self, request: RecordedRequest) -> Result<(), RemoteError> {
        self.requests.lock().push(request);
        self.check()
    }

    fn check(&self) -> Result<(), RemoteError> {
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("requests", &self.shared.requests.lock().len())
            .field("streamed", &self.shared.streamed.lock().len())
            .finish_non_exhaustive()
    }
}

struct MockPushSession {
    node_id: String,
    request: PushRequest,
    shared: Arc<MockShared>,
}

impl PushSession for MockPushSession {
    fn send_batch(&mut self, payload: &[u8]) -> Result<(), RemoteError> {
        self.shared.check()?;
        let observer = self.shared.observer.lock().clone();
        if let Some(observer) = observer {
            (*observer)(&self.node_id, payload);
        }
        self.shared
            .streamed
            .lock()
            .push((self.node_id.clone(), payload.to_vec()));
        self.request.payload.extend_from_slice(payload);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<AckResponse, RemoteError> {
        let MockPushSession {
            node_id,
            request,
            shared,
        } = *self;
        shared.record(RecordedRequest::Push(node_id, request))?;
        let next = shared.pushes.lock().pop_front();
        next.unwrap_or_else(|| Ok(AckResponse::default()))
    }
}

impl MockTransport {
    /// Creates a transport that grants every reservation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reservation outcome.
    pub fn queue_reservation(&self, result: Result<ReservationResponse, RemoteError>) {
        self.reservations.lock().push_back(result);
    }

    /// Queues a push outcome.
    pub fn queue_push(&self, result: Result<AckResponse, RemoteError>) {
        self.shared.pushes.lock().push_back(result);
    }

    /// Queues a pull outcome.
    pub fn queue_pull(&self, result: Result<PullResponse, RemoteError>) {
        self.pulls.lock().push_back(result);
    }

    /// Queues a batch status outcome.
    pub fn queue_batch_status(&self, result: Result<AckResponse, RemoteError>) {
        self.statuses.lock().push_back(result);
    }

    /// Fails every request with `error` until cleared with `None`.
    pub fn set_failure(&self, error: Option<RemoteError>) {
        *self.shared.failure.lock() = error;
    }

    /// Calls `observer` with every batch streamed by a push, before it is
    /// recorded.
    pub fn observe_pushed_batches(&self, observer: impl Fn(&str, &[u8]) + Send + Sync + 'static) {
        let observer: PushObserver = Arc::new(observer);
        *self.shared.observer.lock() = Some(observer);
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.requests.lock().clone()
    }

    /// Batches streamed so far, in arrival order, with their remote node id.
    pub fn streamed_batches(&self) -> Vec<(String, Vec<u8>)> {
        self.shared.streamed.lock().clone()
    }

    /// Push requests seen so far.
    pub fn pushed(&self) -> Vec<PushRequest> {
        self.shared
            .requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                RecordedRequest::Push(_, request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Ack requests seen so far.
    pub fn acks_sent(&self) -> Vec<AckRequest> {
        self.shared
            .requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                RecordedRequest::Ack(_, request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, request: RecordedRequest) -> Result<(), RemoteError> {
        self.shared.record(request)
    }
}

impl TransportManager for MockTransport {
    fn reserve(
        &self,
        remote: &Node,
        _request: &ReservationRequest,
    ) -> Result<ReservationResponse, RemoteError> {
        self.record(RecordedRequest::Reserve(remote.node_id.clone()))?;
        self.reservations.lock().pop_front().unwrap_or_else(|| {
            Ok(ReservationResponse {
                reservation_id: format!("mock-{}", remote.node_id),
            })
        })
    }

    fn open_push(
        &self,
        remote: &Node,
        request: PushRequest,
    ) -> Result<Box<dyn PushSession>, RemoteError> {
        self.shared.check()?;
        Ok(Box::new(MockPushSession {
            node_id: remote.node_id.clone(),
            request,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn pull(&self, remote: &Node, request: PullRequest) -> Result<PullResponse, RemoteError> {
        self.record(RecordedRequest::Pull(remote.node_id.clone(), request))?;
        self.pulls
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(PullResponse::default()))
    }

    fn send_acks(&self, remote: &Node, request: AckRequest) -> Result<(), RemoteError> {
        self.record(RecordedRequest::Ack(remote.node_id.clone(), request))
    }

    fn batch_status(
        &self,
        remote: &Node,
        request: BatchStatusRequest,
    ) -> Result<AckResponse, RemoteError> {
        self.record(RecordedRequest::BatchStatus(remote.node_id.clone(), request))?;
        self.statuses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(AckResponse::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_protocol::CommunicationType;

    fn reservation() -> ReservationRequest {
        ReservationRequest {
            node_id: "N1".into(),
            security_token: Vec::new(),
            channel_id: "default".into(),
            communication_type: CommunicationType::Push,
        }
    }

    #[test]
    fn mock_grants_by_default() {
        let transport = MockTransport::new();
        let remote = Node::new("N2", "store");
        let response = transport.reserve(&remote, &reservation()).unwrap();
        assert_eq!(response.reservation_id, "mock-N2");
        assert_eq!(
            transport.requests(),
            vec![RecordedRequest::Reserve("N2".into())]
        );
    }

    #[test]
    fn mock_answers_in_order() {
        let transport = MockTransport::new();
        let remote = Node::new("N2", "store");
        transport.queue_reservation(Err(RemoteError::ServiceUnavailable));

        assert_eq!(
            transport.reserve(&remote, &reservation()),
            Err(RemoteError::ServiceUnavailable)
        );
        assert!(transport.reserve(&remote, &reservation()).is_ok());
    }

    #[test]
    fn mock_push_records_streamed_batches() {
        let transport = MockTransport::new();
        let remote = Node::new("N2", "store");
        let mut session = transport
            .open_push(
                &remote,
                PushRequest {
                    reservation_id: "r1".into(),
                    node_id: "N1".into(),
                    security_token: Vec::new(),
                    payload: Vec::new(),
                },
            )
            .unwrap();
        session.send_batch(b"first\n").unwrap();
        assert_eq!(transport.streamed_batches().len(), 1);
        assert!(transport.pushed().is_empty());

        session.send_batch(b"second\n").unwrap();
        session.finish().unwrap();
        let pushed = transport.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].payload, b"first\nsecond\n".to_vec());
    }

    #[test]
    fn mock_failure_applies_to_every_request() {
        let transport = MockTransport::new();
        let remote = Node::new("N2", "store");
        transport.set_failure(Some(RemoteError::Unreachable("refused".into())));

        let err = transport
            .send_acks(
                &remote,
                AckRequest {
                    node_id: "N1".into(),
                    security_token: Vec::new(),
                    acks: AckResponse::default(),
                },
            )
            .unwrap_err();
        assert!(!err.is_rejection());
        assert_eq!(transport.acks_sent().len(), 1);

        transport.set_failure(None);
        assert!(transport.reserve(&remote, &reservation()).is_ok());
    }
}
