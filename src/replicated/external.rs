/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The invocation surface for nodes outside a shard: [`ExternalCaller`], and the
//! [`ShardIterator`] fan-out helper across a subgroup's shard representatives.

use borsh::BorshDeserialize;
use std::sync::{Arc, Mutex};

use crate::logging;
use crate::object::ReplicatedObject;
use crate::rpc::{ArgList, InvocableWrapper, QueryResults, RequestType, RpcManager};
use crate::types::data_types::{MethodTag, NodeId, SubgroupId, SubgroupTypeId};
use crate::view::ViewManager;

use super::SendError;

/// Handle through which a non-member of a shard invokes methods on it. Identical in
/// surface to [`Replicated`](super::Replicated) minus ownership of a user object and
/// minus `ordered_send`: `p2p_send` is the only operation.
pub struct ExternalCaller<T: ReplicatedObject> {
    node_id: NodeId,
    subgroup_id: SubgroupId,
    rpc_manager: Arc<RpcManager>,
    view_manager: Arc<ViewManager>,
    max_p2p_request_payload_size: usize,
    invoker: InvocableWrapper<T>,
}

impl<T: ReplicatedObject> ExternalCaller<T> {
    pub fn new(
        type_id: SubgroupTypeId,
        node_id: NodeId,
        subgroup_id: SubgroupId,
        rpc_manager: Arc<RpcManager>,
        view_manager: Arc<ViewManager>,
        max_p2p_request_payload_size: usize,
    ) -> ExternalCaller<T> {
        // The invoker only marshals: its object slot stays empty forever.
        let invoker = InvocableWrapper::new(
            type_id,
            Arc::new(Mutex::new(None)),
            T::register_methods(),
        );
        ExternalCaller {
            node_id,
            subgroup_id,
            rpc_manager,
            view_manager,
            max_p2p_request_payload_size,
            invoker,
        }
    }

    pub fn subgroup_id(&self) -> SubgroupId {
        self.subgroup_id
    }

    /// Send a point-to-point RPC to one member of the target shard.
    ///
    /// # Panics
    /// Panics if `dest` is the local node: an external caller has nothing to invoke
    /// locally.
    pub fn p2p_send<R: BorshDeserialize>(
        &self,
        dest: NodeId,
        tag: MethodTag,
        args: ArgList,
    ) -> Result<QueryResults<R>, SendError> {
        assert_ne!(dest, self.node_id, "p2p send to the local node");
        if !self
            .view_manager
            .with_current_view(|view| view.is_member(dest))
        {
            return Err(SendError::InvalidNode(dest));
        }

        let size = self.invoker.size_for_ordered_send(&args);
        if size > self.max_p2p_request_payload_size {
            return Err(SendError::PayloadTooLarge {
                size,
                max: self.max_p2p_request_payload_size,
            });
        }

        let mut buffer = self
            .rpc_manager
            .get_send_buffer(dest, RequestType::P2pRequest, size);
        let (results, pending) = self
            .invoker
            .marshal_into(buffer.as_mut_slice(), tag, &args)
            .map_err(SendError::Rpc)?;
        self.rpc_manager
            .finish_p2p_send(dest, self.subgroup_id, pending, buffer);

        logging::log_p2p_send(self.subgroup_id, dest, tag);
        Ok(results)
    }
}

/// Fan-out helper across a subgroup: one representative node per shard, in a fixed
/// stored order.
pub struct ShardIterator<T: ReplicatedObject> {
    caller: ExternalCaller<T>,
    shard_reps: Vec<NodeId>,
}

impl<T: ReplicatedObject> ShardIterator<T> {
    /// # Panics
    /// Panics if `shard_reps` is empty: a subgroup has at least one shard.
    pub fn new(caller: ExternalCaller<T>, shard_reps: Vec<NodeId>) -> ShardIterator<T> {
        assert!(!shard_reps.is_empty(), "no shard representatives");
        ShardIterator { caller, shard_reps }
    }

    pub fn shard_reps(&self) -> &[NodeId] {
        &self.shard_reps
    }

    /// Invoke `(tag, args)` on every shard representative, in the stored order. The
    /// returned futures correspond positionally to the representatives.
    pub fn p2p_send<R: BorshDeserialize>(
        &self,
        tag: MethodTag,
        args: ArgList,
    ) -> Result<Vec<QueryResults<R>>, SendError> {
        let mut results = Vec::with_capacity(self.shard_reps.len());
        for rep in &self.shard_reps {
            results.push(self.caller.p2p_send(*rep, tag, args.clone())?);
        }
        Ok(results)
    }
}
