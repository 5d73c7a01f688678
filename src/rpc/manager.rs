/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The shared RPC manager: owner of send buffers, registry of invocable wrappers, and
//! router of delivered replies into the matching pending results.
//!
//! One `RpcManager` is shared by every replicated handle and external caller in the
//! enclosing group. Handles register their invocable wrapper under their subgroup id at
//! construction and deregister it exactly once on drop. Senders borrow P2P send buffers
//! from the manager inside the send path and hand them back, filled, through
//! [`finish_p2p_send`](RpcManager::finish_p2p_send); the transport glue drains the
//! outgoing queue and feeds received messages back in through the `receive_*` methods.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::data_types::{NodeId, SubgroupId, SubgroupTypeId};

use super::results::PendingResults;
use super::wrapper::{parse_reply, RpcError};

/// The kind of slot a sender asks the manager's buffer pool for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    P2pRequest,
    P2pReply,
    RpcReply,
}

/// Object-safe dispatch surface of an invocable wrapper, as the manager sees it.
pub trait Dispatcher: Send + Sync {
    fn type_id(&self) -> SubgroupTypeId;

    /// Dispatch a delivered invocation to the wrapped object, returning the serialized
    /// reply message.
    fn dispatch(&self, from: NodeId, payload: &[u8]) -> Result<Vec<u8>, RpcError>;
}

impl<D: Dispatcher + ?Sized> Dispatcher for std::sync::Arc<D> {
    fn type_id(&self) -> SubgroupTypeId {
        (**self).type_id()
    }

    fn dispatch(&self, from: NodeId, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        (**self).dispatch(from, payload)
    }
}

/// A manager-owned send buffer borrowed by one P2P send. Returned to the manager through
/// [`RpcManager::finish_p2p_send`].
pub struct P2pSendBuffer {
    dest: NodeId,
    request_type: RequestType,
    bytes: Vec<u8>,
}

impl P2pSendBuffer {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// A filled P2P message waiting for the transport glue to pick it up.
pub struct OutgoingP2p {
    pub dest: NodeId,
    pub subgroup_id: SubgroupId,
    pub request_type: RequestType,
    pub bytes: Vec<u8>,
}

pub struct RpcManager {
    local_node_id: NodeId,
    receivers: Mutex<HashMap<SubgroupId, Box<dyn Dispatcher>>>,
    pending: Mutex<HashMap<(SubgroupId, u64), PendingResults>>,
    outgoing_p2p: Mutex<VecDeque<OutgoingP2p>>,
}

impl RpcManager {
    pub fn new(local_node_id: NodeId) -> RpcManager {
        RpcManager {
            local_node_id,
            receivers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            outgoing_p2p: Mutex::new(VecDeque::new()),
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Register the invocable wrapper serving `subgroup_id`. At most one wrapper serves
    /// a subgroup on one node; registering a second replaces the first.
    pub fn register_invocable(&self, subgroup_id: SubgroupId, dispatcher: Box<dyn Dispatcher>) {
        self.receivers.lock().unwrap().insert(subgroup_id, dispatcher);
    }

    /// Remove the invocable wrapper serving `subgroup_id`. Called from the owning
    /// handle's drop; a no-op if nothing is registered.
    pub fn destroy_invocable(&self, subgroup_id: SubgroupId) {
        self.receivers.lock().unwrap().remove(&subgroup_id);
    }

    /// Whether an invocable wrapper currently serves `subgroup_id`.
    pub fn is_registered(&self, subgroup_id: SubgroupId) -> bool {
        self.receivers.lock().unwrap().contains_key(&subgroup_id)
    }

    /// Borrow a send buffer of `size` bytes scoped to `dest` and `request_type`. The
    /// buffer must come back through [`finish_p2p_send`](RpcManager::finish_p2p_send).
    pub fn get_send_buffer(
        &self,
        dest: NodeId,
        request_type: RequestType,
        size: usize,
    ) -> P2pSendBuffer {
        P2pSendBuffer {
            dest,
            request_type,
            bytes: vec![0u8; size],
        }
    }

    /// Complete a P2P send: queue the filled buffer for transmission and register the
    /// pending results so the reply routes back to the caller's future.
    pub fn finish_p2p_send(
        &self,
        dest: NodeId,
        subgroup_id: SubgroupId,
        pending: PendingResults,
        buffer: P2pSendBuffer,
    ) {
        debug_assert_eq!(dest, buffer.dest);
        self.pending
            .lock()
            .unwrap()
            .insert((subgroup_id, pending.invocation_id().int()), pending);
        self.outgoing_p2p.lock().unwrap().push_back(OutgoingP2p {
            dest: buffer.dest,
            subgroup_id,
            request_type: buffer.request_type,
            bytes: buffer.bytes,
        });
    }

    /// Complete an ordered send: register the pending results under the subgroup so
    /// replies delivered for this invocation route back to the caller's future. The
    /// message itself was committed into the multicast transport by the caller.
    pub fn finish_rpc_send(&self, subgroup_id: SubgroupId, pending: PendingResults) {
        self.pending
            .lock()
            .unwrap()
            .insert((subgroup_id, pending.invocation_id().int()), pending);
    }

    /// Dispatch a received invocation (ordered or P2P) to the wrapper serving
    /// `subgroup_id`, returning the serialized reply message to be sent back to `from`.
    pub fn receive_invocation(
        &self,
        subgroup_id: SubgroupId,
        from: NodeId,
        payload: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let receivers = self.receivers.lock().unwrap();
        let dispatcher = receivers
            .get(&subgroup_id)
            .ok_or(RpcError::EmptyObject)?;
        dispatcher.dispatch(from, payload)
    }

    /// Route a received reply into the pending results registered for its invocation.
    /// Returns true if a matching invocation was found and still had a listener.
    pub fn receive_reply(
        &self,
        subgroup_id: SubgroupId,
        from: NodeId,
        reply: &[u8],
    ) -> Result<bool, RpcError> {
        let (invocation_id, result_bytes) = parse_reply(reply)?;
        let pending = self.pending.lock().unwrap();
        match pending.get(&(subgroup_id, invocation_id.int())) {
            Some(pending_results) => Ok(pending_results.fulfill(from, result_bytes)),
            None => Ok(false),
        }
    }

    /// Retire an invocation: drop its pending results so the caller's
    /// [`QueryResults`](super::results::QueryResults) observes end-of-replies.
    pub fn retire(&self, subgroup_id: SubgroupId, invocation_id: u64) {
        self.pending
            .lock()
            .unwrap()
            .remove(&(subgroup_id, invocation_id));
    }

    /// Drain the queue of filled P2P messages for transmission.
    pub fn take_outgoing_p2p(&self) -> Vec<OutgoingP2p> {
        self.outgoing_p2p.lock().unwrap().drain(..).collect()
    }
}
