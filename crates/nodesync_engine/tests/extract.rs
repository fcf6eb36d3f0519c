//! Extract cycles and worker limits.

use nodesync_core::{CoreConfig, LeaseConfig};
use nodesync_engine::{EngineConfig, MockTransport, NodeEngine, RemoteStatus};
use nodesync_protocol::{CommunicationType, Node};
use nodesync_testkit::prelude::*;
use std::sync::Arc;

fn node_with_extract_workers(workers: usize) -> TestNode {
    init_test_logging();
    TestNode::builder("N1")
        .push_to(Node::new("N2", "test"))
        .push_to(Node::new("N3", "test"))
        .config(CoreConfig::default().with_lease(
            LeaseConfig::default().with_thread_count(CommunicationType::Extract, workers),
        ))
        .build()
}

#[tokio::test]
async fn extract_visits_every_known_node() {
    let node = node_with_extract_workers(2);
    let engine = NodeEngine::new(
        Arc::clone(&node.services),
        Arc::new(MockTransport::new()),
        EngineConfig::default(),
    );

    let statuses = engine.extract().await.unwrap();

    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses.count(RemoteStatus::NoData), 2);
}

#[tokio::test]
async fn pairs_beyond_the_worker_limit_wait_for_the_next_cycle() {
    let node = node_with_extract_workers(1);
    let engine = NodeEngine::new(
        Arc::clone(&node.services),
        Arc::new(MockTransport::new()),
        EngineConfig::default(),
    );

    let first = engine.extract().await.unwrap();
    assert_eq!(first.len(), 1);
    let second = engine.extract().await.unwrap();
    assert_eq!(second.len(), 1);

    let visited: Vec<_> = first.iter().chain(second.iter()).map(|s| s.node_id.clone()).collect();
    assert_ne!(visited[0], visited[1]);
}
