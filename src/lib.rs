/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Shardcast is a Rust library for totally-ordered, reliable multicast to replicated
//! objects, with a persistent, cryptographically signed log of every ordered delivery.
//!
//! A *subgroup* groups shards that share one replicated object type; a *shard* is the
//! set of nodes collectively owning one replica group. On each member, a
//! [`Replicated`](replicated::Replicated) handle binds the user's state-machine object
//! to the runtime: [`ordered_send`](replicated::Replicated::ordered_send) publishes a
//! totally-ordered multicast invocation to every replica of the shard, and
//! [`p2p_send`](replicated::Replicated::p2p_send) invokes one node directly. Every
//! ordered delivery is assigned a [`Version`](types::data_types::Version), which the
//! object's [`Persistent`](persistence::Persistent) fields reflect into durable,
//! optionally signature-chained logs.
//!
//! The pieces the library deliberately does not provide — the reliable multicast
//! transport, the view-change controller, sockets, failure detection — plug in behind
//! the [`MulticastGroup`](view::MulticastGroup) trait and the
//! [`ViewManager`](view::ViewManager)'s install/notify surface.

pub mod config;

pub mod object;

pub mod persistence;

pub mod replicated;

pub mod rpc;

pub mod types;

pub mod view;

pub(crate) mod logging;

// Re-exports
pub use object::{DeserializationContext, Factory, GroupRef, ReplicatedObject};
pub use replicated::external::{ExternalCaller, ShardIterator};
pub use replicated::Replicated;
