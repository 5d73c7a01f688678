/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! State of the chained signature over successive versions of a replicated object's
//! persistent log.
//!
//! Each signature covers the concatenation of every field's bytes at a version followed
//! by the signature of the previous non-empty version:
//! `sig(v) = sign(field_bytes(v) ++ sig(prev_nonempty))`. Tampering with any historical
//! version is therefore detectable from the latest signature alone.

use crate::types::data_types::{SignatureBytes, Version};

/// `last_signature` and `last_signed_version` for one registry. Written only from the
/// persistence thread.
pub(crate) struct SignatureChain {
    last_signed_version: Version,
    last_signature: SignatureBytes,
}

impl SignatureChain {
    /// A chain that has signed nothing. `last_signature` starts empty and is sized to
    /// the signer's signature length on first use.
    pub(crate) fn new() -> SignatureChain {
        SignatureChain {
            last_signed_version: Version::INVALID,
            last_signature: SignatureBytes::default(),
        }
    }

    pub(crate) fn last_signed_version(&self) -> Version {
        self.last_signed_version
    }

    pub(crate) fn last_signature(&self) -> &SignatureBytes {
        &self.last_signature
    }

    /// Make sure `last_signature` has exactly `signature_size` bytes, zero-filling on
    /// first call: the all-zeroes signature is the chain's genesis signature.
    pub(crate) fn ensure_signature_size(&mut self, signature_size: usize) {
        if self.last_signature.len() != signature_size {
            self.last_signature = SignatureBytes::zeroed(signature_size);
        }
    }

    /// Seed the chain from recovered state. Only advances the chain: a `version` at or
    /// below `last_signed_version` is ignored, which makes re-seeding idempotent.
    pub(crate) fn initialize(&mut self, version: Version, signature: &[u8]) {
        self.ensure_signature_size(signature.len());
        if !signature.is_empty()
            && !version.is_invalid()
            && (self.last_signed_version.is_invalid() || self.last_signed_version < version)
        {
            self.last_signature.copy_from(signature);
            self.last_signed_version = version;
        }
    }

    /// Record a freshly finalized signature for `version`. Called only after the signer
    /// finalize succeeded, so a failed sign never moves the chain.
    pub(crate) fn advance(&mut self, version: Version, signature: &[u8]) {
        self.last_signature.copy_from(signature);
        self.last_signed_version = version;
    }
}
