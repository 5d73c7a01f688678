/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are common across the library's subsystems.
//!
//! Types specific to one subsystem live in the subsystem's own module; what is defined
//! here is shared by at least two of them:
//! 1. "Inert" newtypes ([`data_types`]) that are sent around and inspected but have no
//!    active behavior.
//! 2. Cryptographic primitives ([`crypto_primitives`]): the [`Signer`] and [`Verifier`]
//!    capabilities used by the signed persistent log, and their Ed25519 implementations.
//!
//! [`Signer`]: crypto_primitives::Signer
//! [`Verifier`]: crypto_primitives::Verifier

pub mod data_types;

pub mod crypto_primitives;
