/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Tests for the persistent registry: version fan-out, the minimum frontiers, the
//! chained signature, trimming and truncation, and the earliest-version-to-serialize
//! frontier during state transfer.

use borsh::BorshSerialize;
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use shardcast::persistence::{Persistent, PersistentRegistry};
use shardcast::types::crypto_primitives::{
    sign_message, Ed25519Signer, Ed25519Verifier, Signer, ED25519_SIGNATURE_SIZE,
};
use shardcast::types::data_types::{Hlc, ShardNum, SignatureBytes, SubgroupIndex, Version};

fn fresh_registry(storage_root: Option<std::path::PathBuf>) -> PersistentRegistry {
    PersistentRegistry::new(
        "tests::LoggedCounter",
        SubgroupIndex::new(0),
        ShardNum::new(0),
        storage_root,
    )
}

#[test]
fn version_fanout_and_minimum_frontiers() {
    let mut registry = fresh_registry(None);
    let field_a = Persistent::new(&mut registry, "a", 0u64);
    let field_b = Persistent::new(&mut registry, "b", String::new());

    field_a.update(|value| *value = 7);
    field_b.update(|value| value.push_str("seven"));
    registry.make_version(Version::new(1), Hlc::new(100, 0));

    field_a.update(|value| *value = 8);
    registry.make_version(Version::new(2), Hlc::new(200, 0));

    assert_eq!(registry.min_latest_version(), Version::new(2));
    assert!(registry.min_latest_persisted().is_invalid());

    registry.persist(Version::new(2)).unwrap();

    assert_eq!(registry.min_latest_persisted(), Version::new(2));
    assert_eq!(field_a.get_by_version(Version::new(1)), Some(7));
    assert_eq!(field_a.get_by_version(Version::new(2)), Some(8));
    assert_eq!(
        field_b.get_by_version(Version::new(2)),
        Some("seven".to_string())
    );
}

#[test]
fn persist_writes_field_logs_under_the_subgroup_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = fresh_registry(Some(dir.path().to_path_buf()));
    let prefix = registry.subgroup_prefix().to_string();

    let _field_a = Persistent::new(&mut registry, "a", 1u32);
    let _field_b = Persistent::new(&mut registry, "b", 2u32);
    registry.make_version(Version::new(0), Hlc::new(1, 0));
    registry.persist(Version::new(0)).unwrap();

    let prefix_dir = dir.path().join(&prefix);
    let logs: Vec<_> = std::fs::read_dir(&prefix_dir).unwrap().collect();
    assert_eq!(logs.len(), 2);
    for entry in logs {
        assert!(entry.unwrap().metadata().unwrap().len() > 0);
    }
}

#[test]
fn signature_chain_covers_successive_versions() {
    let mut registry = fresh_registry(None);
    let field_a = Persistent::new(&mut registry, "a", 0u64);
    let field_b = Persistent::new(&mut registry, "b", 0u64);

    for version in 1..=3i64 {
        field_a.update(|value| *value += 1);
        field_b.update(|value| *value += 10);
        registry.make_version(Version::new(version), Hlc::new(version as u64, 0));
    }

    let signing_key = SigningKey::generate(&mut OsRng);
    let mut signer = Ed25519Signer::new(signing_key.clone());
    let mut signature = vec![0u8; signer.max_signature_size()];
    registry
        .sign(Version::new(3), &mut signer, &mut signature)
        .unwrap();

    assert_eq!(registry.last_signed_version(), Version::new(3));
    assert_eq!(registry.last_signature().bytes(), signature.as_slice());
    assert_eq!(
        registry.signature(Version::new(3)).unwrap().bytes(),
        signature.as_slice()
    );

    // Version 0 was empty, so its signature (the previous signature of version 1)
    // covers no field bytes and no chain input.
    let sig_v0 = sign_message(&signing_key, b"");
    let mut verifier = Ed25519Verifier::new(signing_key.verifying_key());
    assert!(registry.verify(
        Version::new(1),
        &mut verifier,
        registry.signature(Version::new(1)).unwrap().bytes(),
        Some(&sig_v0),
    ));
    for version in 2..=3i64 {
        assert!(registry.verify(
            Version::new(version),
            &mut verifier,
            registry.signature(Version::new(version)).unwrap().bytes(),
            registry.signature(Version::new(version - 1)).as_ref(),
        ));
    }
}

#[test]
fn verification_rejects_tampered_chain_links() {
    let mut registry = fresh_registry(None);
    let field = Persistent::new(&mut registry, "a", 0u64);
    field.update(|value| *value = 41);
    registry.make_version(Version::new(1), Hlc::new(1, 0));
    field.update(|value| *value = 42);
    registry.make_version(Version::new(2), Hlc::new(2, 0));

    let signing_key = SigningKey::generate(&mut OsRng);
    let mut signer = Ed25519Signer::new(signing_key.clone());
    let mut signature = vec![0u8; signer.max_signature_size()];
    registry
        .sign(Version::new(2), &mut signer, &mut signature)
        .unwrap();

    let mut verifier = Ed25519Verifier::new(signing_key.verifying_key());
    let sig_v1 = registry.signature(Version::new(1)).unwrap();
    let sig_v2 = registry.signature(Version::new(2)).unwrap();

    assert!(registry.verify(Version::new(2), &mut verifier, sig_v2.bytes(), Some(&sig_v1)));

    // A tampered previous signature breaks the chain.
    let forged_prev = SignatureBytes::zeroed(ED25519_SIGNATURE_SIZE);
    assert!(!registry.verify(
        Version::new(2),
        &mut verifier,
        sig_v2.bytes(),
        Some(&forged_prev)
    ));

    // A signature from the wrong version does not verify.
    assert!(!registry.verify(Version::new(2), &mut verifier, sig_v1.bytes(), Some(&sig_v1)));
}

#[test]
fn signing_empty_versions_advances_without_chaining() {
    let mut registry = fresh_registry(None);
    let _field = Persistent::new(&mut registry, "a", 0u64);

    let signing_key = SigningKey::generate(&mut OsRng);
    let mut signer = Ed25519Signer::new(signing_key.clone());
    let mut signature = vec![0u8; signer.max_signature_size()];

    // No field has an entry at version 0, so the signature covers no bytes and the
    // previous signature is not mixed in.
    registry
        .sign(Version::new(0), &mut signer, &mut signature)
        .unwrap();
    assert_eq!(registry.last_signed_version(), Version::new(0));
    assert_eq!(
        registry.last_signature().bytes(),
        sign_message(&signing_key, b"").bytes()
    );

    // Signing a version below the chain tip is a no-op.
    let before = registry.last_signature().clone();
    registry
        .sign(Version::INVALID, &mut signer, &mut signature)
        .unwrap();
    assert_eq!(registry.last_signed_version(), Version::new(0));
    assert_eq!(registry.last_signature(), &before);
}

#[test]
fn initialize_last_signature_only_advances() {
    let mut registry = fresh_registry(None);
    let seed_a = vec![1u8; ED25519_SIGNATURE_SIZE];
    let seed_b = vec![2u8; ED25519_SIGNATURE_SIZE];

    registry.initialize_last_signature(Version::new(5), &seed_a);
    assert_eq!(registry.last_signed_version(), Version::new(5));
    assert_eq!(registry.last_signature().bytes(), seed_a.as_slice());

    // Re-seeding with a stale version is ignored.
    registry.initialize_last_signature(Version::new(3), &seed_b);
    assert_eq!(registry.last_signed_version(), Version::new(5));
    assert_eq!(registry.last_signature().bytes(), seed_a.as_slice());

    registry.initialize_last_signature(Version::new(9), &seed_b);
    assert_eq!(registry.last_signed_version(), Version::new(9));
    assert_eq!(registry.last_signature().bytes(), seed_b.as_slice());
}

#[test]
fn trim_and_truncate_discard_the_right_ends() {
    let mut registry = fresh_registry(None);
    let field = Persistent::new(&mut registry, "a", 0u64);
    for version in 1..=4i64 {
        field.update(|value| *value = version as u64);
        registry.make_version(Version::new(version), Hlc::new(version as u64, 0));
    }

    registry.trim(Version::new(2));
    assert_eq!(field.get_by_version(Version::new(1)), None);
    assert_eq!(field.get_by_version(Version::new(2)), Some(2));

    registry.truncate(Version::new(3));
    assert_eq!(field.get_by_version(Version::new(4)), Some(3));
    assert_eq!(registry.min_latest_version(), Version::new(3));
}

#[test]
fn serialize_frontier_limits_the_transferred_log() {
    let mut registry = fresh_registry(None);
    let field = Persistent::new(&mut registry, "a", 0u64);
    for version in 1..=3i64 {
        field.update(|value| *value = version as u64);
        registry.make_version(Version::new(version), Hlc::new(version as u64, 0));
    }

    let full = field.to_bytes().unwrap();
    let clipped = {
        let _guard = PersistentRegistry::set_earliest_version_to_serialize(Version::new(3));
        field.to_bytes().unwrap()
    };
    assert!(clipped.len() < full.len());

    // A frontier installed in another scope no longer applies.
    assert_eq!(field.to_bytes().unwrap(), full);
}

#[test]
fn registration_with_the_same_name_overrides() {
    let mut registry = fresh_registry(None);
    let first = Persistent::new(&mut registry, "a", 1u64);
    first.update(|value| *value = 10);
    registry.make_version(Version::new(1), Hlc::new(1, 0));
    assert_eq!(registry.min_latest_version(), Version::new(1));

    // The replacement field takes over the slot: the registry sees only its log.
    let _second = Persistent::new(&mut registry, "a", 2u64);
    assert_eq!(registry.num_fields(), 1);
    assert!(registry.min_latest_version().is_invalid());
}

#[test]
fn field_wire_form_is_stable_across_a_round_trip() {
    let mut source_registry = fresh_registry(None);
    let field = Persistent::new(&mut source_registry, "a", 5u64);
    field.update(|value| *value = 6);
    source_registry.make_version(Version::new(0), Hlc::new(1, 0));
    let bytes = field.to_bytes().unwrap();

    let mut target_registry = fresh_registry(None);
    let mut ctx = shardcast::object::DeserializationContext {
        registry: &mut target_registry,
        rpc_manager: std::sync::Arc::new(shardcast::rpc::RpcManager::new(
            shardcast::types::data_types::NodeId::new(0),
        )),
    };
    let (rebuilt, consumed) = Persistent::<u64>::from_bytes(&mut ctx, &bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(rebuilt.get(), 6);
    assert_eq!(rebuilt.get_by_version(Version::new(0)), Some(6));
    assert_eq!(target_registry.num_fields(), 1);
    assert_eq!(rebuilt.to_bytes().unwrap(), bytes);
}

#[test]
fn versioned_values_round_trip_through_borsh() {
    // The registry signs exactly the bytes fields log, so the log bytes must be the
    // borsh encoding of the value.
    let mut registry = fresh_registry(None);
    let field = Persistent::new(&mut registry, "a", "state".to_string());
    registry.make_version(Version::new(0), Hlc::new(1, 0));

    let mut signer = CountingSigner::default();
    let mut out = [0u8; 8];
    registry.sign(Version::new(0), &mut signer, &mut out).unwrap();
    // The field's borsh-encoded value, plus the chained previous signature.
    let expected = "state".to_string().try_to_vec().unwrap().len() + signer.max_signature_size();
    assert_eq!(signer.bytes_seen, expected);
}

/// A signer that records how many bytes it was fed. Stands in for the real signer where
/// only the byte accounting matters.
#[derive(Default)]
struct CountingSigner {
    bytes_seen: usize,
}

impl Signer for CountingSigner {
    fn init(&mut self) {
        self.bytes_seen = 0;
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.bytes_seen += bytes.len();
    }

    fn finalize(
        &mut self,
        signature_out: &mut [u8],
    ) -> Result<usize, shardcast::types::crypto_primitives::SignerError> {
        let len = signature_out.len().min(8);
        signature_out[..len].fill(0xAB);
        Ok(len)
    }

    fn max_signature_size(&self) -> usize {
        8
    }
}
