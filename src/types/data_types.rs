/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected, but have no active behavior.
//!
//! These types follow the newtype pattern, and the API for using them is defined in this
//! module. Identifiers ([`NodeId`], [`SubgroupId`], [`SubgroupIndex`], [`ShardNum`],
//! [`SubgroupTypeId`]) locate a replicated object inside a group; [`Version`] and [`Hlc`]
//! stamp each totally-ordered delivery; [`MethodTag`] and [`InvocationId`] identify RPC
//! invocations on the wire.

use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// Id of a node in the group. Assigned by the operator through
/// [configuration](crate::config::IdentityConfig).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Id of a subgroup: a logical grouping of shards sharing a replicated object type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct SubgroupId(u32);

impl SubgroupId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for SubgroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Index of a subgroup among the subgroups instantiated with the same replicated object
/// type. Part of the [subgroup prefix](crate::persistence::PersistentRegistry::subgroup_prefix).
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SubgroupIndex(u32);

impl SubgroupIndex {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Number of a shard within its subgroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ShardNum(u32);

impl ShardNum {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Numeric id registered for a replicated object type when its invocable wrapper is
/// registered with the [RPC manager](crate::rpc::RpcManager).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct SubgroupTypeId(u32);

impl SubgroupTypeId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

/// Tag identifying one method in a replicated object's
/// [method table](crate::object::MethodTable). Serialized as a fixed-width integer at the
/// front of every invocation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct MethodTag(u64);

impl MethodTag {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for MethodTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Per-sender identifier linking an invocation to the replies it produces. Generated by
/// the invocable wrapper at marshalling time and echoed back in every reply header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct InvocationId(u64);

impl InvocationId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Version assigned by the ordered-multicast delivery path to each ordered operation,
/// reflected into the persistent log.
///
/// Versions are signed 64-bit integers; [`Version::INVALID`] (−1) marks "no version",
/// e.g., the latest persisted version of a field that has never persisted anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Version(i64);

impl Version {
    pub const INVALID: Version = Version(-1);

    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }

    pub const fn is_invalid(&self) -> bool {
        self.0 == -1
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Add<i64> for Version {
    type Output = Version;

    fn add(self, rhs: i64) -> Self::Output {
        Version(self.0.add(rhs))
    }
}

impl AddAssign<i64> for Version {
    fn add_assign(&mut self, rhs: i64) {
        self.0.add_assign(rhs)
    }
}

impl Sub<Version> for Version {
    type Output = i64;

    fn sub(self, rhs: Version) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Hybrid logical clock stamp accompanying a [`Version`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct Hlc {
    /// Real-time component, in microseconds since the Unix epoch.
    pub rtc_us: u64,
    /// Logical component, incremented to break ties within one real-time tick.
    pub logical: u64,
}

impl Hlc {
    pub const fn new(rtc_us: u64, logical: u64) -> Self {
        Self { rtc_us, logical }
    }
}

/// Id of an installed view. Strictly increasing across view changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct ViewId(u64);

impl ViewId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Signature represented in bytes. The length is signer-dependent
/// ([`max_signature_size`](crate::types::crypto_primitives::Signer::max_signature_size)).
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes(Vec<u8>);

impl SignatureBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The all-zeroes "genesis signature" that seeds a signature chain.
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn copy_from(&mut self, bytes: &[u8]) {
        self.0.clear();
        self.0.extend_from_slice(bytes);
    }
}
