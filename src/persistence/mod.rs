/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persistent, cryptographically signed log behind every replicated object.
//!
//! A replicated object declares its durable state as [`Persistent<T>`](field::Persistent)
//! fields, each a versioned append-only log of one value. The fields of one object are
//! collected into a [`PersistentRegistry`](registry::PersistentRegistry), which fans out
//! version creation, flushing, trimming, and truncation, computes the minimum frontier
//! across fields, and drives the chained signature
//! ([`SignatureChain`](chain::SignatureChain)) that covers every persisted version.
//!
//! The registry is driven from a single dedicated persistence thread by the owning
//! [replicated handle](crate::replicated::Replicated); it is not internally synchronized.

pub mod field;

pub mod registry;

pub(crate) mod chain;

pub use field::{Persistent, PersistentField};
pub use registry::{
    generate_prefix, match_prefix, PersistenceError, PersistentRegistry,
    SerializeFrontierGuard, TemporalQueryFrontierProvider,
};
