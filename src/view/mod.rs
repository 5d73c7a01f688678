/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Views, the pluggable multicast transport, and the view manager that senders
//! coordinate with.
//!
//! A [`View`] is the committed membership at a point in time; only sends in the current
//! view are valid. Membership-change algorithms, leader election, and failure detection
//! live outside this library: the [`ViewManager`] holds whatever view the external
//! view-change controller last [installed](ViewManager::install_view), and exposes the
//! locking discipline senders rely on — *senders are writers of messages but readers of
//! the view*.
//!
//! The multicast transport is pluggable through the [`MulticastGroup`] trait, mirroring
//! how the networking provider is pluggable elsewhere in the stack.

pub(crate) mod lock;

use indexmap::IndexSet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::types::data_types::{NodeId, SubgroupId, ViewId};

use lock::ViewMutex;

/// Trait for the pluggable reliable-multicast transport of one view.
///
/// `send` is a try-send: it returns false when the send window for `subgroup_id` cannot
/// accept a `size`-byte message right now. When it returns true, `fill` has already been
/// called exactly once with a transport-owned buffer of exactly `size` bytes, and the
/// message is committed into the subgroup's total order. Implementations must call
/// [`ViewManager::notify_send_window_free`] when a window slot frees up, so blocked
/// senders re-evaluate.
///
/// `cooked` distinguishes RPC-framed messages (true) from raw payloads (false).
pub trait MulticastGroup: Send + Sync {
    fn send(
        &self,
        subgroup_id: SubgroupId,
        size: usize,
        fill: &mut dyn FnMut(&mut [u8]),
        cooked: bool,
    ) -> bool;
}

/// The committed membership at a point in time, together with the multicast transport
/// bound to it.
pub struct View {
    view_id: ViewId,
    /// Members in rank order. Rank is a node's index in this set.
    members: IndexSet<NodeId>,
    multicast_group: Arc<dyn MulticastGroup>,
}

impl View {
    pub fn new(
        view_id: ViewId,
        members: Vec<NodeId>,
        multicast_group: Arc<dyn MulticastGroup>,
    ) -> View {
        View {
            view_id,
            members: members.into_iter().collect(),
            multicast_group,
        }
    }

    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    /// The rank of `node` in this view, or `None` if it is not a member.
    pub fn rank_of(&self, node: NodeId) -> Option<usize> {
        self.members.get_index_of(&node)
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    pub fn multicast_group(&self) -> &Arc<dyn MulticastGroup> {
        &self.multicast_group
    }
}

/// Holder of the current view and the locking discipline around it.
///
/// The view-change controller (external to this library) calls
/// [`install_view`](ViewManager::install_view) with exclusive access; send paths hold
/// the view in shared mode for the whole span between entering their transport wait and
/// finishing registration of the send, so every message that leaves is committed into a
/// known view.
pub struct ViewManager {
    view: ViewMutex<View>,
    max_payload_sizes: HashMap<SubgroupId, usize>,
    stability_frontiers: Mutex<HashMap<SubgroupId, u64>>,
}

impl ViewManager {
    pub fn new(initial_view: View, max_payload_sizes: HashMap<SubgroupId, usize>) -> ViewManager {
        ViewManager {
            view: ViewMutex::new(initial_view),
            max_payload_sizes,
            stability_frontiers: Mutex::new(HashMap::new()),
        }
    }

    /// Read something out of the current view under a shared hold.
    pub fn with_current_view<R>(&self, f: impl FnOnce(&View) -> R) -> R {
        let guard = self.view.read();
        f(&guard)
    }

    /// Install a new committed view, then wake every sender blocked on the view
    /// condition.
    pub fn install_view(&self, new_view: View) {
        let view_id = new_view.view_id();
        let num_members = new_view.num_members();
        {
            let mut guard = self.view.write();
            *guard = new_view;
        }
        crate::logging::log_install_view(view_id, num_members);
    }

    /// Wake senders blocked on the view condition because the transport freed a send
    /// window slot.
    pub fn notify_send_window_free(&self) {
        self.view.notify_changed();
    }

    /// The configured maximum multicast payload size for `subgroup_id`.
    pub fn max_payload_size(&self, subgroup_id: SubgroupId) -> Option<usize> {
        self.max_payload_sizes.get(&subgroup_id).copied()
    }

    /// Record the stability frontier reported by the transport for `subgroup_id`.
    pub fn update_stability_frontier(&self, subgroup_id: SubgroupId, frontier_us: u64) {
        self.stability_frontiers
            .lock()
            .unwrap()
            .insert(subgroup_id, frontier_us);
    }

    /// The highest timestamp (in microseconds) known to be delivered at every member of
    /// `subgroup_id`'s shard.
    pub fn compute_global_stability_frontier(&self, subgroup_id: SubgroupId) -> u64 {
        self.stability_frontiers
            .lock()
            .unwrap()
            .get(&subgroup_id)
            .copied()
            .unwrap_or(0)
    }

    /// Transport a `size`-byte raw payload whose body is written by `fill` into a
    /// transport-owned buffer, blocking until the current view's multicast channel
    /// accepts it.
    pub fn send(&self, subgroup_id: SubgroupId, size: usize, mut fill: impl FnMut(&mut [u8])) {
        let (_guard, ()) = self.view.wait_read_until(|view| {
            if view
                .multicast_group()
                .send(subgroup_id, size, &mut fill, false)
            {
                Some(())
            } else {
                None
            }
        });
    }

    pub(crate) fn view(&self) -> &ViewMutex<View> {
        &self.view
    }
}
