/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-object collection of persistent fields, and the fan-out of version, persist,
//! sign, trim, and truncate operations across them.
//!
//! ## Iteration order
//!
//! Fields are kept in a `BTreeMap` keyed by a hash of the field's registered name, so the
//! registry walks them in one explicit total order that does not depend on insertion
//! interleavings or process layout. The signing fan-outs
//! ([`sign`](PersistentRegistry::sign) streaming bytes, attaching signatures) and the
//! verification fan-out ([`verify`](PersistentRegistry::verify)) all share this order; a
//! signer and a verifier in different processes therefore agree on the byte stream.
//!
//! ## Subgroup prefix
//!
//! Every field persists under a prefix derived deterministically from the replicated
//! object's type identity and the subgroup's coordinates:
//! `hex(sha256(type_name)) "-" subgroup_index "-" shard_num`. Collisions must be
//! prevented by the caller-chosen type identity.

use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::sync::Weak;

use crate::types::crypto_primitives::{Signer, SignerError, Verifier};
use crate::types::data_types::{Hlc, ShardNum, SignatureBytes, SubgroupIndex, Version};

use super::chain::SignatureChain;
use super::field::PersistentField;

thread_local! {
    /// The lowest version the current thread wants included when serializing persistent
    /// fields for state transfer. [`Version::INVALID`] means "everything".
    static EARLIEST_VERSION_TO_SERIALIZE: Cell<i64> = Cell::new(Version::INVALID.int());
}

/// Provider of the temporal query frontier: the highest hybrid-logical-clock timestamp
/// at which the enclosing group can answer temporal queries for this subgroup.
pub trait TemporalQueryFrontierProvider: Send + Sync {
    fn temporal_query_frontier(&self) -> Hlc;
}

/// Ordered collection of the persistent fields belonging to one replicated object.
///
/// The registry is not internally synchronized: the owning replicated handle serializes
/// `make_version`, `persist`, `trim`, `truncate`, and `sign` on a single dedicated
/// persistence thread.
pub struct PersistentRegistry {
    subgroup_prefix: String,
    storage_root: Option<PathBuf>,
    fields: BTreeMap<u64, Box<dyn PersistentField>>,
    chain: SignatureChain,
    temporal_frontier_provider: Weak<dyn TemporalQueryFrontierProvider>,
}

impl PersistentRegistry {
    pub fn new(
        type_name: &str,
        subgroup_index: SubgroupIndex,
        shard_num: ShardNum,
        storage_root: Option<PathBuf>,
    ) -> PersistentRegistry {
        PersistentRegistry {
            subgroup_prefix: generate_prefix(type_name, subgroup_index, shard_num),
            storage_root,
            fields: BTreeMap::new(),
            chain: SignatureChain::new(),
            temporal_frontier_provider: Weak::<NullFrontierProvider>::new(),
        }
    }

    /// The deterministic prefix under which this registry's fields persist.
    pub fn subgroup_prefix(&self) -> &str {
        &self.subgroup_prefix
    }

    /// Register `field` under `name`, keyed by a stable hash of the name.
    ///
    /// A second registration with the same name overrides the first; there is no
    /// unregister operation.
    pub fn register_field(&mut self, name: &str, field: Box<dyn PersistentField>) {
        self.fields.insert(field_key(name), field);
    }

    /// The path under which the field registered as `name` writes its log file, or
    /// `None` when the registry is memory-only.
    pub fn field_storage_path(&self, name: &str) -> Option<PathBuf> {
        self.storage_root.as_ref().map(|root| {
            root.join(&self.subgroup_prefix)
                .join(format!("{:016x}.log", field_key(name)))
        })
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Fan-out: materialize the current value of every field under `version`.
    pub fn make_version(&mut self, version: Version, hlc: Hlc) {
        for field in self.fields.values() {
            field.make_version(version, hlc);
        }
        crate::logging::log_make_version(&self.subgroup_prefix, version);
    }

    /// Minimum over all fields of each field's latest materialized version.
    /// [`Version::INVALID`] with zero registered fields.
    pub fn min_latest_version(&self) -> Version {
        self.fields
            .values()
            .map(|field| field.latest_version())
            .min()
            .unwrap_or(Version::INVALID)
    }

    /// Fan-out: flush every field up to `version`. No ordering among fields is required.
    pub fn persist(&mut self, version: Version) -> Result<(), PersistenceError> {
        for field in self.fields.values() {
            field.persist(version)?;
        }
        crate::logging::log_persist(&self.subgroup_prefix, version);
        Ok(())
    }

    /// Fan-out: discard versions strictly older than `earliest_version`.
    pub fn trim(&mut self, earliest_version: Version) {
        for field in self.fields.values() {
            field.trim(earliest_version);
        }
        crate::logging::log_trim(&self.subgroup_prefix, earliest_version);
    }

    /// Fan-out: discard versions strictly newer than `latest_version`. Used to roll back
    /// incomplete tails on recovery.
    pub fn truncate(&mut self, latest_version: Version) {
        for field in self.fields.values() {
            field.truncate(latest_version);
        }
        crate::logging::log_truncate(&self.subgroup_prefix, latest_version);
    }

    /// Minimum over fields of each field's latest-persisted marker.
    /// [`Version::INVALID`] with zero registered fields.
    pub fn min_latest_persisted(&self) -> Version {
        self.fields
            .values()
            .map(|field| field.latest_persisted())
            .min()
            .unwrap_or(Version::INVALID)
    }

    /// Walk versions from just past the last signed version through `latest_version`
    /// inclusive, producing the chained signature for each.
    ///
    /// For each candidate version: every field streams its bytes at that version into
    /// `signer` (in the registry's iteration order); if any bytes were streamed, the
    /// previous signature is mixed in; the finalized signature is handed back to every
    /// field and recorded as the chain's new tip. An empty version (no field has an
    /// entry) still advances `last_signed_version` but does not mix the previous
    /// signature.
    ///
    /// `signature_out` must hold at least
    /// [`signer.max_signature_size()`](Signer::max_signature_size) bytes; on return it
    /// holds the signature of `latest_version` (or of the last non-walked version if the
    /// range was empty). The chain tip is only moved after a successful finalize, so a
    /// failed sign leaves `last_signed_version` untouched.
    pub fn sign(
        &mut self,
        latest_version: Version,
        signer: &mut dyn Signer,
        signature_out: &mut [u8],
    ) -> Result<(), PersistenceError> {
        self.chain.ensure_signature_size(signer.max_signature_size());
        let start = self.chain.last_signed_version().int() + 1;
        for version_int in start..=latest_version.int() {
            let version = Version::new(version_int);

            signer.init();
            let mut bytes_signed = 0;
            for field in self.fields.values() {
                bytes_signed += field.update_signature(version, signer);
            }
            if bytes_signed > 0 {
                // A non-empty log entry chains onto the previous version's signature.
                signer.add_bytes(self.chain.last_signature().bytes());
            }
            let written = signer
                .finalize(signature_out)
                .map_err(PersistenceError::Signer)?;

            for field in self.fields.values() {
                field.add_signature(version, &signature_out[..written]);
            }
            self.chain.advance(version, &signature_out[..written]);
            crate::logging::log_sign(&self.subgroup_prefix, version, &signature_out[..written]);
        }
        Ok(())
    }

    /// Check `signature` against this registry's state at `version`.
    ///
    /// Every field streams its bytes at `version` into `verifier` in the registry's
    /// iteration order; if any bytes were streamed, `prev_signature` — the signature
    /// recorded at the previous non-empty version, supplied by the caller walking the
    /// log — is mixed in, matching what [`sign`](PersistentRegistry::sign) produced.
    pub fn verify(
        &self,
        version: Version,
        verifier: &mut dyn Verifier,
        signature: &[u8],
        prev_signature: Option<&SignatureBytes>,
    ) -> bool {
        verifier.init();
        let mut bytes_verified = 0;
        for field in self.fields.values() {
            bytes_verified += field.update_verifier(version, verifier);
        }
        if bytes_verified > 0 {
            if let Some(prev) = prev_signature {
                verifier.add_bytes(prev.bytes());
            }
        }
        verifier.finalize(signature)
    }

    /// The signature each field recorded at `version`. All fields with an entry at
    /// `version` share one signature; the first one found is returned.
    pub fn signature(&self, version: Version) -> Option<SignatureBytes> {
        self.fields
            .values()
            .find_map(|field| field.signature(version))
    }

    pub fn last_signed_version(&self) -> Version {
        self.chain.last_signed_version()
    }

    pub fn last_signature(&self) -> &SignatureBytes {
        self.chain.last_signature()
    }

    /// Seed the signature chain from recovered state. Idempotent for versions at or
    /// below the current chain tip.
    pub fn initialize_last_signature(&mut self, version: Version, signature: &[u8]) {
        self.chain.initialize(version, signature);
    }

    /// Re-seat the non-owning back-reference used for temporal queries. Called after the
    /// owning handle moves, and after state transfer.
    pub fn update_frontier_provider(
        &mut self,
        provider: Weak<dyn TemporalQueryFrontierProvider>,
    ) {
        self.temporal_frontier_provider = provider;
    }

    /// The current temporal query frontier, if the provider is still alive.
    pub fn temporal_query_frontier(&self) -> Option<Hlc> {
        self.temporal_frontier_provider
            .upgrade()
            .map(|provider| provider.temporal_query_frontier())
    }

    /// Install `version` as the calling thread's earliest-version-to-serialize frontier
    /// for the lifetime of the returned guard. Fields serialized on this thread leave out
    /// log entries below the frontier. Guards nest: dropping one restores the frontier
    /// that was in place when it was created, including on unwind.
    pub fn set_earliest_version_to_serialize(version: Version) -> SerializeFrontierGuard {
        let previous = EARLIEST_VERSION_TO_SERIALIZE.with(|cell| cell.replace(version.int()));
        SerializeFrontierGuard { previous }
    }

    /// The calling thread's current earliest-version-to-serialize frontier.
    pub fn earliest_version_to_serialize() -> Version {
        Version::new(EARLIEST_VERSION_TO_SERIALIZE.with(|cell| cell.get()))
    }
}

/// Scope guard holding one thread-local earliest-version-to-serialize override.
pub struct SerializeFrontierGuard {
    previous: i64,
}

impl Drop for SerializeFrontierGuard {
    fn drop(&mut self) {
        EARLIEST_VERSION_TO_SERIALIZE.with(|cell| cell.set(self.previous));
    }
}

struct NullFrontierProvider;

impl TemporalQueryFrontierProvider for NullFrontierProvider {
    fn temporal_query_frontier(&self) -> Hlc {
        Hlc::default()
    }
}

/// `hex(sha256(type_name)) "-" subgroup_index "-" shard_num`.
pub fn generate_prefix(
    type_name: &str,
    subgroup_index: SubgroupIndex,
    shard_num: ShardNum,
) -> String {
    let digest = Sha256::digest(type_name.as_bytes());
    let mut prefix = String::with_capacity(digest.len() * 2 + 24);
    for byte in digest {
        prefix.push_str(&format!("{:02x}", byte));
    }
    prefix.push_str(&format!("-{}-{}", subgroup_index.int(), shard_num.int()));
    prefix
}

/// Whether `str` begins with the prefix generated for the given subgroup coordinates.
/// Used when scanning persisted state directories.
pub fn match_prefix(
    str: &str,
    type_name: &str,
    subgroup_index: SubgroupIndex,
    shard_num: ShardNum,
) -> bool {
    str.starts_with(&generate_prefix(type_name, subgroup_index, shard_num))
}

/// Stable key for a field name: the first 8 bytes of its SHA-256 digest, little-endian.
fn field_key(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Error surfaced by the persistence pipeline.
#[derive(Debug)]
pub enum PersistenceError {
    Signer(SignerError),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Display for PersistenceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Signer(source) => write!(f, "signer rejected input: {}", source),
            PersistenceError::Io { path, source } => {
                write!(f, "cannot flush field log {}: {}", path.display(), source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_deterministic_and_matchable() {
        let prefix = generate_prefix("KvStore", SubgroupIndex::new(2), ShardNum::new(1));
        assert_eq!(
            prefix,
            generate_prefix("KvStore", SubgroupIndex::new(2), ShardNum::new(1))
        );
        assert!(prefix.ends_with("-2-1"));
        assert!(match_prefix(
            &format!("{}/field.log", prefix),
            "KvStore",
            SubgroupIndex::new(2),
            ShardNum::new(1)
        ));
        assert!(!match_prefix(
            &prefix,
            "KvStore",
            SubgroupIndex::new(3),
            ShardNum::new(1)
        ));
    }

    #[test]
    fn serialize_frontier_scopes_nest_and_restore() {
        assert!(PersistentRegistry::earliest_version_to_serialize().is_invalid());
        {
            let _outer = PersistentRegistry::set_earliest_version_to_serialize(Version::new(5));
            assert_eq!(
                PersistentRegistry::earliest_version_to_serialize(),
                Version::new(5)
            );
            {
                let _inner =
                    PersistentRegistry::set_earliest_version_to_serialize(Version::new(9));
                assert_eq!(
                    PersistentRegistry::earliest_version_to_serialize(),
                    Version::new(9)
                );
            }
            assert_eq!(
                PersistentRegistry::earliest_version_to_serialize(),
                Version::new(5)
            );
        }
        assert!(PersistentRegistry::earliest_version_to_serialize().is_invalid());
    }

    #[test]
    fn serialize_frontier_restores_across_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _guard = PersistentRegistry::set_earliest_version_to_serialize(Version::new(3));
            panic!("unwind through the guard");
        });
        assert!(result.is_err());
        assert!(PersistentRegistry::earliest_version_to_serialize().is_invalid());
    }

    #[test]
    fn min_frontiers_with_zero_fields_are_invalid() {
        let registry = PersistentRegistry::new(
            "Empty",
            SubgroupIndex::new(0),
            ShardNum::new(0),
            None,
        );
        assert!(registry.min_latest_version().is_invalid());
        assert!(registry.min_latest_persisted().is_invalid());
    }
}
