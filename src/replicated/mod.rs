/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The in-process handle to a replicated object: ordered and peer-to-peer invocation,
//! state transfer, and the persistence control surface.
//!
//! ## Ordered sends and the view
//!
//! [`ordered_send`](Replicated::ordered_send) probes the invocable wrapper for the exact
//! serialized size, then acquires the view in *shared* mode and waits on the view
//! condition until the multicast transport accepts a send of that size into the current
//! view's channel for this subgroup. The transport runs the serializer inside its own
//! buffer as part of accepting; the pending results are registered with the RPC manager
//! before the shared hold is released, so the message is committed into a known view.
//! The condition is signaled both when the transport frees a window slot and when a view
//! change completes; either can unblock the sender.
//!
//! ## Validity
//!
//! A handle is constructed with a [factory](crate::object::Factory) (member of the
//! shard) or
//! [without one](Replicated::new_placeholder) (non-member placeholder that can still
//! receive state). [`take`](Replicated::take) transfers the handle's contents the way
//! the enclosing group moves shards around; the source is left invalid, every public
//! operation on it fails with an empty-handle error, and only the live handle
//! deregisters from the RPC manager on drop.

pub mod external;

use borsh::BorshDeserialize;
use std::fmt::{self, Display, Formatter};
use std::io::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Configuration;
use crate::logging;
use crate::object::{DeserializationContext, GroupRef, ReplicatedObject};
use crate::persistence::{
    PersistenceError, PersistentRegistry, TemporalQueryFrontierProvider,
};
use crate::rpc::{
    ArgList, InvocableWrapper, PendingResults, QueryResults, RequestType, RpcError, RpcManager,
};
use crate::types::crypto_primitives::{Ed25519Signer, KeyLoadError, Signer};
use crate::types::data_types::{
    Hlc, MethodTag, NodeId, ShardNum, SubgroupId, SubgroupIndex, SubgroupTypeId, Version,
};
use crate::view::ViewManager;

/// The parts of a handle that move wholesale when the enclosing group relocates a shard.
struct HandleCore<T: ReplicatedObject> {
    user_object: Arc<Mutex<Option<T>>>,
    registry: Mutex<PersistentRegistry>,
    signer: Mutex<Option<Ed25519Signer>>,
    signature_size: usize,
    wrapper: Arc<InvocableWrapper<T>>,
    frontier_provider: Arc<SubgroupStabilityFrontier>,
}

/// Handle to the replicated object of one shard.
pub struct Replicated<T: ReplicatedObject> {
    node_id: NodeId,
    subgroup_id: SubgroupId,
    subgroup_index: SubgroupIndex,
    shard_num: ShardNum,
    type_id: SubgroupTypeId,
    rpc_manager: Arc<RpcManager>,
    view_manager: Arc<ViewManager>,
    max_p2p_request_payload_size: usize,
    core: Option<HandleCore<T>>,
    next_version: AtomicI64,
    next_timestamp_us: AtomicU64,
}

impl<T: ReplicatedObject> Replicated<T> {
    /// Construct a member handle: the factory builds the user object against the
    /// shard's fresh registry.
    pub fn new(
        config: &Configuration,
        type_id: SubgroupTypeId,
        node_id: NodeId,
        subgroup_id: SubgroupId,
        subgroup_index: SubgroupIndex,
        shard_num: ShardNum,
        rpc_manager: Arc<RpcManager>,
        view_manager: Arc<ViewManager>,
        factory: impl FnOnce(&mut PersistentRegistry, SubgroupId) -> T,
    ) -> Result<Replicated<T>, KeyLoadError> {
        let mut registry = PersistentRegistry::new(
            T::type_name(),
            subgroup_index,
            shard_num,
            config.persistence.storage_root.clone(),
        );
        let mut object = factory(&mut registry, subgroup_id);
        if T::uses_group_reference() {
            object.install_group_ref(GroupRef::new(node_id, subgroup_index, &rpc_manager));
        }
        Self::build(
            config,
            type_id,
            node_id,
            subgroup_id,
            subgroup_index,
            shard_num,
            rpc_manager,
            view_manager,
            registry,
            Some(object),
        )
    }

    /// Construct a non-member placeholder: no user object yet, but a registered
    /// wrapper, so the handle can receive state and serve P2P once state arrives.
    pub fn new_placeholder(
        config: &Configuration,
        type_id: SubgroupTypeId,
        node_id: NodeId,
        subgroup_id: SubgroupId,
        subgroup_index: SubgroupIndex,
        shard_num: ShardNum,
        rpc_manager: Arc<RpcManager>,
        view_manager: Arc<ViewManager>,
    ) -> Result<Replicated<T>, KeyLoadError> {
        let registry = PersistentRegistry::new(
            T::type_name(),
            subgroup_index,
            shard_num,
            config.persistence.storage_root.clone(),
        );
        Self::build(
            config,
            type_id,
            node_id,
            subgroup_id,
            subgroup_index,
            shard_num,
            rpc_manager,
            view_manager,
            registry,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        config: &Configuration,
        type_id: SubgroupTypeId,
        node_id: NodeId,
        subgroup_id: SubgroupId,
        subgroup_index: SubgroupIndex,
        shard_num: ShardNum,
        rpc_manager: Arc<RpcManager>,
        view_manager: Arc<ViewManager>,
        mut registry: PersistentRegistry,
        object: Option<T>,
    ) -> Result<Replicated<T>, KeyLoadError> {
        let (signer, signature_size) = if config.persistence.signed_persistent_log {
            let key_file = config
                .persistence
                .private_key_file
                .as_ref()
                .ok_or(KeyLoadError::NotConfigured)?;
            let signer = Ed25519Signer::from_key_file(key_file)?;
            let signature_size = signer.max_signature_size();
            (Some(signer), signature_size)
        } else {
            (None, 0)
        };

        let frontier_provider = Arc::new(SubgroupStabilityFrontier {
            view_manager: Arc::clone(&view_manager),
            subgroup_id,
        });
        registry.update_frontier_provider(downgrade_provider(&frontier_provider));

        let user_object = Arc::new(Mutex::new(object));
        let wrapper = Arc::new(InvocableWrapper::new(
            type_id,
            Arc::clone(&user_object),
            T::register_methods(),
        ));
        rpc_manager.register_invocable(subgroup_id, Box::new(Arc::clone(&wrapper)));

        Ok(Replicated {
            node_id,
            subgroup_id,
            subgroup_index,
            shard_num,
            type_id,
            rpc_manager,
            view_manager,
            max_p2p_request_payload_size: config.rpc.max_p2p_request_payload_size,
            core: Some(HandleCore {
                user_object,
                registry: Mutex::new(registry),
                signer: Mutex::new(signer),
                signature_size,
                wrapper,
                frontier_provider,
            }),
            next_version: AtomicI64::new(Version::INVALID.int()),
            next_timestamp_us: AtomicU64::new(0),
        })
    }

    /// Transfer this handle's contents into a fresh handle, the way the enclosing group
    /// relocates shards. The source is left invalid: every public operation on it fails
    /// with [`SendError::EmptyHandle`], and its drop no longer touches the RPC manager.
    pub fn take(&mut self) -> Replicated<T> {
        let moved = Replicated {
            node_id: self.node_id,
            subgroup_id: self.subgroup_id,
            subgroup_index: self.subgroup_index,
            shard_num: self.shard_num,
            type_id: self.type_id,
            rpc_manager: Arc::clone(&self.rpc_manager),
            view_manager: Arc::clone(&self.view_manager),
            max_p2p_request_payload_size: self.max_p2p_request_payload_size,
            core: self.core.take(),
            next_version: AtomicI64::new(self.next_version.load(Ordering::Relaxed)),
            next_timestamp_us: AtomicU64::new(self.next_timestamp_us.load(Ordering::Relaxed)),
        };
        if let Some(core) = &moved.core {
            // Re-seat the registry's non-owning back-reference at the new location.
            core.registry
                .lock()
                .unwrap()
                .update_frontier_provider(downgrade_provider(&core.frontier_provider));
        }
        moved
    }

    /// Whether the underlying invocable wrapper is attached. False only for handles
    /// whose contents were [taken](Replicated::take).
    pub fn is_valid(&self) -> bool {
        self.core.is_some()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn subgroup_id(&self) -> SubgroupId {
        self.subgroup_id
    }

    pub fn subgroup_index(&self) -> SubgroupIndex {
        self.subgroup_index
    }

    pub fn shard_num(&self) -> ShardNum {
        self.shard_num
    }

    pub fn type_id(&self) -> SubgroupTypeId {
        self.type_id
    }

    /// The signature length of the configured signer; 0 when signing is disabled.
    pub fn signature_size(&self) -> usize {
        self.core.as_ref().map(|core| core.signature_size).unwrap_or(0)
    }

    /// Read the user object through `f`. `None` is passed for a placeholder that has
    /// not received state yet.
    pub fn with_object<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> Result<R, SendError> {
        let core = self.core.as_ref().ok_or(SendError::EmptyHandle)?;
        let object = core.user_object.lock().unwrap();
        Ok(f(object.as_ref()))
    }

    /* ↓↓↓ Send paths ↓↓↓ */

    /// Atomically publish a totally-ordered multicast of method `tag` with `args` to all
    /// replicas of this shard. The returned future yields one reply per responding
    /// replica.
    pub fn ordered_send<R: BorshDeserialize>(
        &self,
        tag: MethodTag,
        args: ArgList,
    ) -> Result<QueryResults<R>, SendError> {
        let core = self.core.as_ref().ok_or(SendError::EmptyHandle)?;
        let size = core.wrapper.size_for_ordered_send(&args);
        if let Some(max) = self.view_manager.max_payload_size(self.subgroup_id) {
            if size > max {
                return Err(SendError::PayloadTooLarge { size, max });
            }
        }

        let mut marshalled: Option<Result<(QueryResults<R>, PendingResults), RpcError>> = None;
        let (view_guard, ()) = self.view_manager.view().wait_read_until(|view| {
            let accepted = view.multicast_group().send(
                self.subgroup_id,
                size,
                &mut |buffer| {
                    marshalled = Some(core.wrapper.marshal_into(buffer, tag, &args));
                },
                true,
            );
            if accepted {
                Some(())
            } else {
                None
            }
        });

        let (results, pending) = marshalled
            .expect("transport accepted the send without running the fill callback")
            .unwrap_or_else(|err| {
                // The size predicate and the serializer come from the same wrapper, so
                // overflowing the transport's buffer cannot be recovered from.
                panic!("serialization overflowed the transport buffer: {}", err)
            });
        self.rpc_manager.finish_rpc_send(self.subgroup_id, pending);
        drop(view_guard);

        logging::log_ordered_send(self.subgroup_id, tag, size);
        Ok(results)
    }

    /// Send a point-to-point RPC to one node in the current view.
    pub fn p2p_send<R: BorshDeserialize>(
        &self,
        dest: NodeId,
        tag: MethodTag,
        args: ArgList,
    ) -> Result<QueryResults<R>, SendError> {
        let core = self.core.as_ref().ok_or(SendError::EmptyHandle)?;
        if !self
            .view_manager
            .with_current_view(|view| view.is_member(dest))
        {
            return Err(SendError::InvalidNode(dest));
        }

        let size = core.wrapper.size_for_ordered_send(&args);
        if size > self.max_p2p_request_payload_size {
            return Err(SendError::PayloadTooLarge {
                size,
                max: self.max_p2p_request_payload_size,
            });
        }

        let mut buffer =
            self.rpc_manager
                .get_send_buffer(dest, RequestType::P2pRequest, size);
        let (results, pending) = core
            .wrapper
            .marshal_into(buffer.as_mut_slice(), tag, &args)
            .map_err(SendError::Rpc)?;
        self.rpc_manager
            .finish_p2p_send(dest, self.subgroup_id, pending, buffer);

        logging::log_p2p_send(self.subgroup_id, dest, tag);
        Ok(results)
    }

    /// Raw path: ask the view manager to transport a `payload_size`-byte message whose
    /// body is written by `fill` into a transport-owned buffer.
    pub fn send(&self, payload_size: usize, fill: impl FnMut(&mut [u8])) -> Result<(), SendError> {
        if self.core.is_none() {
            return Err(SendError::EmptyHandle);
        }
        self.view_manager.send(self.subgroup_id, payload_size, fill);
        Ok(())
    }

    /* ↓↓↓ Delivery ↓↓↓ */

    /// Entry point for the ordered-multicast delivery path: post the version this
    /// delivery produces, then dispatch the invocation to the user object. Returns the
    /// serialized reply message for routing back to the sender.
    pub fn deliver_ordered(
        &self,
        version: Version,
        timestamp_us: u64,
        from: NodeId,
        payload: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let core = self.core.as_ref().ok_or(RpcError::EmptyObject)?;
        self.post_next_version(version, timestamp_us);
        let reply = core.wrapper.dispatch(from, payload)?;
        logging::log_deliver(self.subgroup_id, version, parse_tag(payload));
        Ok(reply)
    }

    /// One-slot mailbox set by the delivery path before the user method is invoked.
    pub fn post_next_version(&self, version: Version, timestamp_us: u64) {
        self.next_version.store(version.int(), Ordering::Release);
        self.next_timestamp_us.store(timestamp_us, Ordering::Release);
    }

    /// Read by the user method to discover the version it is producing.
    pub fn get_next_version(&self) -> (Version, u64) {
        (
            Version::new(self.next_version.load(Ordering::Acquire)),
            self.next_timestamp_us.load(Ordering::Acquire),
        )
    }

    /* ↓↓↓ State transfer ↓↓↓ */

    /// Length of the serialized user object in the compact wire format.
    pub fn object_size(&self) -> Result<usize, StateTransferError> {
        Ok(self.serialized_object()?.len())
    }

    /// Transmit a little-endian size prefix, then stream the serialized user object.
    pub fn send_object(&self, receiver: &mut impl Write) -> Result<(), StateTransferError> {
        let bytes = self.serialized_object()?;
        receiver
            .write_all(&(bytes.len() as u64).to_le_bytes())
            .map_err(StateTransferError::Io)?;
        receiver.write_all(&bytes).map_err(StateTransferError::Io)?;
        logging::log_send_object(self.subgroup_id, bytes.len());
        Ok(())
    }

    /// Stream the serialized user object without the size prefix. Used when the size is
    /// already known by the receiver.
    pub fn send_object_raw(&self, receiver: &mut impl Write) -> Result<(), StateTransferError> {
        let bytes = self.serialized_object()?;
        receiver.write_all(&bytes).map_err(StateTransferError::Io)
    }

    /// Deserialize the user object from `buffer`, rebinding its persistent fields to
    /// this handle's registry. Returns the number of bytes consumed.
    pub fn receive_object(&self, buffer: &[u8]) -> Result<usize, StateTransferError> {
        let core = self.core.as_ref().ok_or(StateTransferError::EmptyHandle)?;
        let mut registry = core.registry.lock().unwrap();
        let mut ctx = DeserializationContext {
            registry: &mut *registry,
            rpc_manager: Arc::clone(&self.rpc_manager),
        };
        let (mut object, consumed) =
            T::from_bytes(&mut ctx, buffer).map_err(StateTransferError::Io)?;
        if T::uses_group_reference() {
            object.install_group_ref(GroupRef::new(
                self.node_id,
                self.subgroup_index,
                &self.rpc_manager,
            ));
        }
        *core.user_object.lock().unwrap() = Some(object);
        logging::log_receive_object(self.subgroup_id, consumed);
        Ok(consumed)
    }

    fn serialized_object(&self) -> Result<Vec<u8>, StateTransferError> {
        let core = self.core.as_ref().ok_or(StateTransferError::EmptyHandle)?;
        let object = core.user_object.lock().unwrap();
        let object = object.as_ref().ok_or(StateTransferError::NoObject)?;
        object.to_bytes().map_err(StateTransferError::Io)
    }

    /* ↓↓↓ Persistence control surface ↓↓↓ */

    /// Fan-out: materialize the current value of every persistent field under
    /// `version`, stamped with `hlc`.
    pub fn make_version(&self, version: Version, hlc: Hlc) -> Result<(), PersistControlError> {
        let core = self.core.as_ref().ok_or(PersistControlError::EmptyHandle)?;
        core.registry.lock().unwrap().make_version(version, hlc);
        Ok(())
    }

    /// Flush (and, with signing enabled, sign) everything up to `version`.
    ///
    /// Loops because more versions may become ready while a batch is flushing: each
    /// iteration reads the minimum latest version across fields, signs and persists it,
    /// and repeats until the requested `version` is covered. With no registered fields
    /// the requested version is reported covered immediately.
    ///
    /// `signature_out` must hold [`signature_size`](Replicated::signature_size) bytes;
    /// it ends up holding the signature of the last version signed.
    pub fn persist(
        &self,
        version: Version,
        signature_out: &mut [u8],
    ) -> Result<(), PersistControlError> {
        let core = self.core.as_ref().ok_or(PersistControlError::EmptyHandle)?;
        loop {
            let mut registry = core.registry.lock().unwrap();
            let mut next_persisted = registry.min_latest_version();
            let mut signer = core.signer.lock().unwrap();
            if let Some(signer) = signer.as_mut() {
                registry
                    .sign(next_persisted, &mut *signer, signature_out)
                    .map_err(PersistControlError::Persistence)?;
            }
            registry
                .persist(next_persisted)
                .map_err(PersistControlError::Persistence)?;
            if next_persisted.is_invalid() {
                // No persistent fields: report the requested version as covered.
                next_persisted = version;
            }
            if next_persisted >= version {
                return Ok(());
            }
        }
    }

    /// Fan-out: discard versions strictly older than `earliest_version`.
    pub fn trim(&self, earliest_version: Version) -> Result<(), PersistControlError> {
        let core = self.core.as_ref().ok_or(PersistControlError::EmptyHandle)?;
        core.registry.lock().unwrap().trim(earliest_version);
        Ok(())
    }

    /// Fan-out: discard versions strictly newer than `latest_version`.
    pub fn truncate(&self, latest_version: Version) -> Result<(), PersistControlError> {
        let core = self.core.as_ref().ok_or(PersistControlError::EmptyHandle)?;
        core.registry.lock().unwrap().truncate(latest_version);
        Ok(())
    }

    /// Minimum over fields of each field's latest-persisted marker.
    pub fn min_latest_persisted(&self) -> Result<Version, PersistControlError> {
        let core = self.core.as_ref().ok_or(PersistControlError::EmptyHandle)?;
        Ok(core.registry.lock().unwrap().min_latest_persisted())
    }

    /// Run `f` against this handle's registry. How the persistence pipeline reaches
    /// registry-level operations the handle does not re-export.
    pub fn with_registry<R>(
        &self,
        f: impl FnOnce(&mut PersistentRegistry) -> R,
    ) -> Result<R, PersistControlError> {
        let core = self.core.as_ref().ok_or(PersistControlError::EmptyHandle)?;
        Ok(f(&mut core.registry.lock().unwrap()))
    }

    /// The highest timestamp known to be delivered at every member of this shard.
    pub fn compute_global_stability_frontier(&self) -> u64 {
        self.view_manager
            .compute_global_stability_frontier(self.subgroup_id)
    }
}

impl<T: ReplicatedObject> Drop for Replicated<T> {
    fn drop(&mut self) {
        // A taken-from handle performs no deregistration.
        if self.core.is_some() {
            self.rpc_manager.destroy_invocable(self.subgroup_id);
        }
    }
}

/// Provider of the temporal query frontier for one subgroup, owned by the handle and
/// held weakly by its registry.
pub(crate) struct SubgroupStabilityFrontier {
    view_manager: Arc<ViewManager>,
    subgroup_id: SubgroupId,
}

impl TemporalQueryFrontierProvider for SubgroupStabilityFrontier {
    fn temporal_query_frontier(&self) -> Hlc {
        Hlc::new(
            self.view_manager
                .compute_global_stability_frontier(self.subgroup_id),
            0,
        )
    }
}

fn downgrade_provider(
    provider: &Arc<SubgroupStabilityFrontier>,
) -> std::sync::Weak<dyn TemporalQueryFrontierProvider> {
    let provider: Arc<dyn TemporalQueryFrontierProvider> = Arc::clone(provider) as _;
    Arc::downgrade(&provider)
}

fn parse_tag(payload: &[u8]) -> MethodTag {
    if payload.len() >= 8 {
        MethodTag::new(u64::from_le_bytes(payload[0..8].try_into().unwrap()))
    } else {
        MethodTag::new(u64::MAX)
    }
}

/// Error surfaced by a send path.
#[derive(Debug)]
pub enum SendError {
    /// Operation on a handle whose contents were taken.
    EmptyHandle,
    /// P2P target is not a member of the current view.
    InvalidNode(NodeId),
    /// Serialized args exceed the configured maximum.
    PayloadTooLarge { size: usize, max: usize },
    Rpc(RpcError),
}

impl Display for SendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SendError::EmptyHandle => write!(f, "attempted to use an empty replicated handle"),
            SendError::InvalidNode(node) => write!(
                f,
                "cannot send a p2p request to node {}: it is not a member of the group",
                node
            ),
            SendError::PayloadTooLarge { size, max } => write!(
                f,
                "the size of serialized args ({}) exceeds the maximum message size ({})",
                size, max
            ),
            SendError::Rpc(source) => write!(f, "{}", source),
        }
    }
}

/// Error surfaced by the persistence control surface.
#[derive(Debug)]
pub enum PersistControlError {
    EmptyHandle,
    Persistence(PersistenceError),
}

impl Display for PersistControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PersistControlError::EmptyHandle => {
                write!(f, "attempted to use an empty replicated handle")
            }
            PersistControlError::Persistence(source) => write!(f, "{}", source),
        }
    }
}

/// Error surfaced by the state-transfer primitives.
#[derive(Debug)]
pub enum StateTransferError {
    EmptyHandle,
    /// The handle holds no user object to serialize.
    NoObject,
    Io(std::io::Error),
}

impl Display for StateTransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StateTransferError::EmptyHandle => {
                write!(f, "attempted to use an empty replicated handle")
            }
            StateTransferError::NoObject => write!(f, "the handle holds no user object"),
            StateTransferError::Io(source) => write!(f, "{}", source),
        }
    }
}
