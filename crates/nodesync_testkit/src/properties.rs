//! Ledger properties checked against a wired node.

use crate::fixtures::TestNode;
use crate::generators::*;
use nodesync_protocol::{decode_payload, Batch, BatchAck, BatchStatus, Node};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn sender(target: &str) -> TestNode {
    TestNode::builder("N1")
        .push_to(Node::new(target, "test"))
        .build()
}

fn insert_sent(node: &TestNode, batch_id: u64, target: &str) -> Batch {
    let mut batch = Batch::new(batch_id, target, "default", BatchStatus::Sending);
    node.services.outgoing.insert(&mut batch).unwrap();
    batch
}

fn acks_with_unacked() -> impl Strategy<Value = (String, Vec<BatchAck>, BTreeSet<u64>)> {
    node_id_strategy().prop_flat_map(|node_id| {
        (
            Just(node_id.clone()),
            batch_acks_strategy(node_id, 12),
            prop::collection::btree_set(batch_id_strategy(), 0..6),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn acks_settle_the_ledger_up_to_the_first_error(
        (target, acks, unacked) in acks_with_unacked(),
    ) {
        let node = sender(&target);
        let acked: BTreeSet<u64> = acks.iter().map(|a| a.batch_id).collect();
        let unacked: BTreeSet<u64> = unacked.difference(&acked).copied().collect();
        let expected: Vec<Batch> = acked
            .iter()
            .chain(unacked.iter())
            .map(|&id| insert_sent(&node, id, &target))
            .collect();

        let summary = node.services.acks.process_acks(acks.clone(), &expected);

        let first_error_id = acks
            .iter()
            .filter(|a| !a.is_ok)
            .map(|a| a.batch_id)
            .min()
            .unwrap_or(u64::MAX);
        let missing: Vec<u64> = unacked
            .iter()
            .copied()
            .filter(|&id| id < first_error_id)
            .collect();
        prop_assert_eq!(&summary.missing, &missing);
        prop_assert_eq!(summary.ok + summary.ignored + summary.error, acks.len());
        prop_assert_eq!(summary.failed, 0);

        for ack in &acks {
            let batch = node.outgoing(ack.batch_id, &target);
            if ack.is_ok {
                prop_assert_eq!(batch.status, BatchStatus::Ok);
                prop_assert!(!batch.error_flag);
                prop_assert_eq!(batch.ignore_count, u32::from(ack.is_ignored));
            } else {
                prop_assert_eq!(batch.status, BatchStatus::Error);
                prop_assert!(batch.error_flag);
                prop_assert_eq!(batch.sql_code, ack.sql_code);
            }
        }
        for &id in &unacked {
            prop_assert_eq!(node.outgoing_status(id, &target), BatchStatus::Sending);
        }
    }

    #[test]
    fn later_acks_never_reopen_an_ok_batch(
        (target, acks, _) in acks_with_unacked(),
    ) {
        let node = sender(&target);
        let expected: Vec<Batch> = acks
            .iter()
            .map(|a| insert_sent(&node, a.batch_id, &target))
            .collect();
        let ok: Vec<BatchAck> = acks
            .iter()
            .map(|a| BatchAck::ok(a.batch_id, target.clone()))
            .collect();
        node.services.acks.process_acks(ok, &expected);

        let summary = node.services.acks.process_acks(acks.clone(), &expected);
        prop_assert_eq!(summary.skipped, acks.len());
        for ack in &acks {
            prop_assert_eq!(node.outgoing_status(ack.batch_id, &target), BatchStatus::Ok);
        }
    }

    #[test]
    fn operators_resolve_only_to_ok_or_ignored(
        start in batch_status_strategy(),
        target in batch_status_strategy(),
    ) {
        let node = sender("N2");
        let mut batch = Batch::new(7, "N2", "default", start);
        node.services.outgoing.insert(&mut batch).unwrap();

        let resolved = node.services.outgoing.operator_resolve(7, "N2", target);
        if matches!(target, BatchStatus::Ok | BatchStatus::Ignored) {
            prop_assert_eq!(resolved.unwrap().status, target);
            prop_assert_eq!(node.outgoing_status(7, "N2"), target);
        } else {
            prop_assert!(resolved.is_err());
            prop_assert_eq!(node.outgoing_status(7, "N2"), start);
        }
    }

    #[test]
    fn extraction_stages_every_captured_row(rows in capture_rows_strategy(16)) {
        let node = sender("N2");
        let mut batch = node.route_batch_with("N2", "default", |_| rows.clone());

        let resource = node.services.extractor.extract_batch(&mut batch).unwrap();
        let payloads = decode_payload(&resource.read_all().unwrap()).unwrap();
        prop_assert_eq!(payloads.len(), 1);
        prop_assert_eq!(&payloads[0].rows, &rows);
        prop_assert_eq!(batch.row_count, rows.len() as u64);
    }
}
