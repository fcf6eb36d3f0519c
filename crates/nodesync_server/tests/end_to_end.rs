//! Two nodes exchanging batches through the loopback transport.

use nodesync_core::{LoadFailure, LoadFailureKind};
use nodesync_engine::{EngineConfig, LoopbackTransport, NodeEngine, RemoteStatus};
use nodesync_protocol::{BatchStatus, Node};
use nodesync_server::{AuthConfig, ServerConfig, SyncServer};
use nodesync_testkit::prelude::*;
use std::sync::Arc;

struct Cluster {
    sender: TestNode,
    receiver: TestNode,
    transport: Arc<LoopbackTransport>,
    sender_engine: NodeEngine,
    receiver_engine: NodeEngine,
}

impl Cluster {
    fn new() -> Self {
        init_test_logging();
        let (sender, receiver) = TestNode::pair("N1", "N2");
        Self::connect(sender, receiver, ServerConfig::default())
    }

    fn connect(sender: TestNode, receiver: TestNode, receiver_config: ServerConfig) -> Self {
        let transport = Arc::new(LoopbackTransport::new());
        transport.register(
            "N1",
            Arc::new(SyncServer::new(
                ServerConfig::default(),
                Arc::clone(&sender.services),
            )),
        );
        transport.register(
            "N2",
            Arc::new(SyncServer::new(
                receiver_config,
                Arc::clone(&receiver.services),
            )),
        );
        let sender_engine = NodeEngine::new(
            Arc::clone(&sender.services),
            transport.clone(),
            EngineConfig::default(),
        );
        let receiver_engine = NodeEngine::new(
            Arc::clone(&receiver.services),
            transport.clone(),
            EngineConfig::default(),
        );
        Self {
            sender,
            receiver,
            transport,
            sender_engine,
            receiver_engine,
        }
    }
}

#[tokio::test]
async fn push_delivers_and_acknowledges_batches() {
    let cluster = Cluster::new();
    let first = cluster.sender.route_batch("N2", "default", 3);
    let second = cluster.sender.route_batch("N2", "default", 2);

    let statuses = cluster.sender_engine.push(false).await.unwrap();

    let status = statuses.get("N2", "default").unwrap();
    assert_eq!(status.status, RemoteStatus::DataProcessed);
    assert_eq!(status.rows_processed, 5);
    assert_eq!(
        cluster.receiver.applier.applied_ids(),
        vec![first.batch_id, second.batch_id]
    );
    for batch in [&first, &second] {
        assert_eq!(
            cluster.sender.outgoing_status(batch.batch_id, "N2"),
            BatchStatus::Ok
        );
        let incoming = cluster.receiver.incoming(batch.batch_id, "N1").unwrap();
        assert_eq!(incoming.status, BatchStatus::Ok);
    }

    // Nothing is left to send.
    let statuses = cluster.sender_engine.push(false).await.unwrap();
    assert_eq!(statuses.count(RemoteStatus::NoData), 1);
}

#[tokio::test]
async fn pull_loads_batches_and_acks_the_sender() {
    let cluster = Cluster::new();
    let batch = cluster.sender.route_batch("N2", "default", 4);

    let statuses = cluster.receiver_engine.pull(false).await.unwrap();

    let status = statuses.get("N1", "default").unwrap();
    assert_eq!(status.status, RemoteStatus::DataProcessed);
    assert_eq!(status.batches_processed, 1);
    assert_eq!(cluster.receiver.applier.row_count(), 4);
    assert_eq!(
        cluster.sender.outgoing_status(batch.batch_id, "N2"),
        BatchStatus::Ok
    );
}

#[tokio::test]
async fn failed_batch_is_resent_once_fixed() {
    let cluster = Cluster::new();
    let batch = cluster.sender.route_batch("N2", "default", 2);
    cluster.receiver.applier.fail_batch(
        batch.batch_id,
        LoadFailure::new(LoadFailureKind::Conflict, 2, "duplicate key"),
    );

    let statuses = cluster.sender_engine.push(false).await.unwrap();
    assert!(statuses.has_failure());

    let failed = cluster.sender.outgoing(batch.batch_id, "N2");
    assert_eq!(failed.status, BatchStatus::Error);
    assert_eq!(failed.sql_state.as_deref(), Some("CONFLICT"));
    assert!(!failed.error_flag);
    assert_eq!(failed.failed_data_id, batch.batch_id * 1_000 + 1);

    cluster.receiver.applier.clear_failure(batch.batch_id);
    cluster.sender_engine.push(false).await.unwrap();

    assert_eq!(
        cluster.sender.outgoing_status(batch.batch_id, "N2"),
        BatchStatus::Ok
    );
    let incoming = cluster.receiver.incoming(batch.batch_id, "N1").unwrap();
    assert_eq!(incoming.status, BatchStatus::Ok);
    assert_eq!(incoming.load_count, 2);
    assert!(incoming.retry_flag);
}

#[tokio::test]
async fn lost_push_response_is_reconciled_without_reloading() {
    let cluster = Cluster::new();
    let batch = cluster.sender.route_batch("N2", "default", 1);

    // The receiver loaded the batch but the sender never saw the acks.
    cluster
        .receiver
        .services
        .loader
        .load_payload(&batch_payload(
            "N1",
            "default",
            batch.batch_id,
            &capture_rows(1, "item", 1),
        ))
        .unwrap();
    let mut row = cluster.sender.outgoing(batch.batch_id, "N2");
    row.status = BatchStatus::Sending;
    cluster.sender.services.outgoing.update(&mut row).unwrap();

    cluster.sender_engine.push(false).await.unwrap();

    assert_eq!(
        cluster.sender.outgoing_status(batch.batch_id, "N2"),
        BatchStatus::Ok
    );
    assert_eq!(cluster.receiver.applier.applied_ids(), vec![batch.batch_id]);
}

#[tokio::test]
async fn ignored_batch_is_recorded_on_both_sides() {
    let cluster = Cluster::new();
    let batch = cluster.sender.route_batch("N2", "default", 2);
    cluster
        .sender
        .services
        .outgoing
        .operator_resolve(batch.batch_id, "N2", BatchStatus::Ignored)
        .unwrap();

    cluster.sender_engine.push(false).await.unwrap();

    assert!(cluster.receiver.applier.applied().is_empty());
    let incoming = cluster.receiver.incoming(batch.batch_id, "N1").unwrap();
    assert_eq!(incoming.status, BatchStatus::Ignored);

    let outgoing = cluster.sender.outgoing(batch.batch_id, "N2");
    assert_eq!(outgoing.status, BatchStatus::Ok);
    assert_eq!(outgoing.ignore_count, 2);
}

#[tokio::test]
async fn offline_receiver_gets_batches_after_reconnecting() {
    let cluster = Cluster::new();
    let batch = cluster.sender.route_batch("N2", "default", 1);
    cluster.transport.set_connected("N2", false);

    let statuses = cluster.sender_engine.push(false).await.unwrap();
    assert_eq!(statuses.count(RemoteStatus::Offline), 1);
    assert_eq!(
        cluster.sender.outgoing_status(batch.batch_id, "N2"),
        BatchStatus::New
    );
    assert!(cluster
        .sender_engine
        .transport_errors()
        .first_failure("N2")
        .is_some());

    cluster.transport.set_connected("N2", true);
    cluster.sender_engine.push(false).await.unwrap();

    assert_eq!(
        cluster.sender.outgoing_status(batch.batch_id, "N2"),
        BatchStatus::Ok
    );
    assert!(cluster.sender_engine.transport_errors().failing_nodes().is_empty());
}

#[tokio::test]
async fn receiver_checks_node_tokens() {
    init_test_logging();
    let secret = b"cluster-secret".to_vec();
    let receiver = TestNode::builder("N2")
        .pull_from(Node::new("N1", "test"))
        .build();
    let issuer = SyncServer::new(
        ServerConfig::default().with_auth(AuthConfig::new(secret.clone())),
        Arc::clone(&receiver.services),
    );
    let token = issuer
        .context()
        .validator()
        .unwrap()
        .create_token("N1")
        .unwrap();

    let sender = TestNode::builder("N1")
        .push_to(Node::new("N2", "test").with_security_token(token))
        .build();
    let batch = sender.route_batch("N2", "default", 1);
    let cluster = Cluster::connect(
        sender,
        receiver,
        ServerConfig::default().with_auth(AuthConfig::new(secret)),
    );

    cluster.sender_engine.push(false).await.unwrap();

    assert_eq!(
        cluster.sender.outgoing_status(batch.batch_id, "N2"),
        BatchStatus::Ok
    );
}

#[tokio::test]
async fn bad_token_is_rejected_as_busy() {
    init_test_logging();
    let sender = TestNode::builder("N1")
        .push_to(Node::new("N2", "test").with_security_token(vec![0; 40]))
        .build();
    let receiver = TestNode::builder("N2")
        .pull_from(Node::new("N1", "test"))
        .build();
    let batch = sender.route_batch("N2", "default", 1);
    let cluster = Cluster::connect(
        sender,
        receiver,
        ServerConfig::default().with_auth(AuthConfig::new(b"cluster-secret".to_vec())),
    );

    let statuses = cluster.sender_engine.push(false).await.unwrap();

    assert_eq!(statuses.count(RemoteStatus::Busy), 1);
    assert_eq!(
        cluster.sender.outgoing_status(batch.batch_id, "N2"),
        BatchStatus::New
    );
}
