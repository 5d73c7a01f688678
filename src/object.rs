/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The trait implemented by user-supplied replicated objects, and the contexts the
//! runtime hands them.
//!
//! A replicated object is an opaque, serializable state machine. The library invokes it
//! only through the method table it registers, serializes it for state transfer through
//! [`to_bytes`](ReplicatedObject::to_bytes) / [`from_bytes`](ReplicatedObject::from_bytes),
//! and constructs it through a [`Factory`] so the object can declare its
//! [`Persistent`](crate::persistence::Persistent) fields against the shard's registry.

use std::sync::{Arc, Weak};

use crate::persistence::PersistentRegistry;
use crate::rpc::{MethodTable, RpcManager};
use crate::types::data_types::{NodeId, SubgroupId, SubgroupIndex};

/// Constructor for a replicated object: given the shard's persistent registry and the
/// subgroup id, produce the object. Called once when a member handle is built, and the
/// only place where the object's `Persistent` fields may register themselves.
pub trait Factory<T>: FnOnce(&mut PersistentRegistry, SubgroupId) -> T {}

impl<T, F: FnOnce(&mut PersistentRegistry, SubgroupId) -> T> Factory<T> for F {}

/// Non-owning re-entry point into the enclosing group, injected into objects that
/// declare the group-reference capability.
#[derive(Clone)]
pub struct GroupRef {
    pub node_id: NodeId,
    pub subgroup_index: SubgroupIndex,
    rpc_manager: Weak<RpcManager>,
}

impl GroupRef {
    pub(crate) fn new(
        node_id: NodeId,
        subgroup_index: SubgroupIndex,
        rpc_manager: &Arc<RpcManager>,
    ) -> GroupRef {
        GroupRef {
            node_id,
            subgroup_index,
            rpc_manager: Arc::downgrade(rpc_manager),
        }
    }

    /// The shared RPC manager, if the group is still alive.
    pub fn rpc_manager(&self) -> Option<Arc<RpcManager>> {
        self.rpc_manager.upgrade()
    }
}

/// Context handed to [`ReplicatedObject::from_bytes`] during state transfer, seeded with
/// the receiving replica's registry (so persistent fields rebind locally) and the shared
/// RPC manager (for deserializers registered there).
pub struct DeserializationContext<'a> {
    pub registry: &'a mut PersistentRegistry,
    pub rpc_manager: Arc<RpcManager>,
}

/// A user-supplied state-machine object replicated across one shard.
pub trait ReplicatedObject: Send + 'static + Sized {
    /// The stable type identity hashed into the shard's persistent-storage prefix.
    /// Distinct replicated object types must return distinct names.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// The table of tagged methods remote callers may invoke.
    fn register_methods() -> MethodTable<Self>;

    /// Serialize the object in the compact wire format used for state transfer.
    ///
    /// Implementations serialize their `Persistent` fields through
    /// [`Persistent::to_bytes`](crate::persistence::Persistent::to_bytes), which honors
    /// the calling thread's earliest-version-to-serialize frontier.
    fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error>;

    /// Deserialize an object from `bytes`, rebinding its persistent fields to the
    /// registry seeded into `ctx`. Returns the object and the number of bytes consumed.
    fn from_bytes(
        ctx: &mut DeserializationContext,
        bytes: &[u8],
    ) -> Result<(Self, usize), std::io::Error>;

    /// Whether this type declares the group-reference capability. When true, the
    /// enclosing handle calls [`install_group_ref`](ReplicatedObject::install_group_ref)
    /// after construction and after every [`from_bytes`](ReplicatedObject::from_bytes).
    fn uses_group_reference() -> bool {
        false
    }

    /// Receive the group back-reference. Only called when
    /// [`uses_group_reference`](ReplicatedObject::uses_group_reference) is true.
    fn install_group_ref(&mut self, _group: GroupRef) {}
}
