/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Tests for the external invocation surface: `ExternalCaller` and the `ShardIterator`
//! fan-out across shard representatives.

mod common;

use std::sync::Arc;
use std::time::Duration;

use borsh::BorshSerialize;
use common::*;
use shardcast::replicated::SendError;
use shardcast::rpc::ArgList;
use shardcast::types::data_types::{NodeId, SubgroupId, SubgroupTypeId};
use shardcast::{ExternalCaller, ShardIterator};

const SUBGROUP: SubgroupId = SubgroupId::new(0);
const TYPE_ID: SubgroupTypeId = SubgroupTypeId::new(1);

fn external_caller(node: &TestNode, local: NodeId) -> ExternalCaller<KvStore> {
    ExternalCaller::new(
        TYPE_ID,
        local,
        SUBGROUP,
        Arc::clone(&node.rpc_manager),
        Arc::clone(&node.view_manager),
        node.config.rpc.max_p2p_request_payload_size,
    )
}

#[test]
fn fan_out_preserves_representative_order() {
    let local = NodeId::new(10);
    let reps = vec![NodeId::new(11), NodeId::new(21), NodeId::new(31)];
    let node = test_node(local, reps.clone(), SUBGROUP, true);

    let caller = external_caller(&node, local);
    let iterator = ShardIterator::new(caller, reps.clone());

    let results = iterator.p2p_send::<()>(PING, ArgList::new()).unwrap();
    assert_eq!(results.len(), reps.len());

    let outgoing = node.rpc_manager.take_outgoing_p2p();
    assert_eq!(outgoing.len(), reps.len());
    for (message, rep) in outgoing.iter().zip(&reps) {
        assert_eq!(message.dest, *rep);
    }

    // Fulfill each invocation out of order; every future still answers for its own
    // representative. The reply echoes the invocation id from the message header.
    for message in outgoing.iter().rev() {
        let mut reply = message.bytes[8..16].to_vec();
        reply.extend_from_slice(&().try_to_vec().unwrap());
        assert!(node
            .rpc_manager
            .receive_reply(SUBGROUP, message.dest, &reply)
            .unwrap());
    }
    for (result, rep) in results.iter().zip(&reps) {
        let (from, ()) = result.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(from, *rep);
    }
}

#[test]
fn external_caller_rejects_non_members() {
    let local = NodeId::new(10);
    let node = test_node(local, vec![NodeId::new(11)], SUBGROUP, true);
    let caller = external_caller(&node, local);

    let err = caller
        .p2p_send::<()>(NodeId::new(40), PING, ArgList::new())
        .unwrap_err();
    assert!(matches!(err, SendError::InvalidNode(node) if node == NodeId::new(40)));
}

#[test]
#[should_panic(expected = "p2p send to the local node")]
fn external_caller_rejects_the_local_node() {
    let local = NodeId::new(10);
    let node = test_node(local, vec![local, NodeId::new(11)], SUBGROUP, true);
    let caller = external_caller(&node, local);
    let _ = caller.p2p_send::<()>(local, PING, ArgList::new());
}

#[test]
#[should_panic(expected = "no shard representatives")]
fn shard_iterator_requires_a_representative() {
    let local = NodeId::new(10);
    let node = test_node(local, vec![NodeId::new(11)], SUBGROUP, true);
    let caller = external_caller(&node, local);
    let _ = ShardIterator::new(caller, Vec::new());
}
