/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Versioned, append-only logs of single values, and the [`Persistent<T>`] handle that
//! user objects hold over them.
//!
//! A persistent field is conceptually a map `version -> bytes` plus `version -> signature`
//! plus a "latest persisted" marker. [`make_version`](Persistent::make_version) snapshots
//! the field's current value under a version stamped with a hybrid logical clock;
//! [`persist`](PersistentField::persist) flushes snapshots up to a version into the
//! field's backing log file; [`trim`](PersistentField::trim) and
//! [`truncate`](PersistentField::truncate) discard the old and new ends of the log.
//!
//! The registry never sees the value type: it fans out over the object-safe
//! [`PersistentField`] trait. The log-entry format written to disk is owned by this
//! module and opaque to the rest of the core.

use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::object::DeserializationContext;
use crate::types::crypto_primitives::{Signer, Verifier};
use crate::types::data_types::{Hlc, SignatureBytes, Version};

use super::registry::{PersistentRegistry, PersistenceError};

/// Object-safe view of one persistent field, used by the
/// [registry](super::registry::PersistentRegistry) to fan out per-object operations.
pub trait PersistentField: Send {
    /// Materialize the current value under `version`, stamped with `hlc`.
    fn make_version(&self, version: Version, hlc: Hlc);

    /// The latest version materialized in this field's log. [`Version::INVALID`] if the
    /// log is empty.
    fn latest_version(&self) -> Version;

    /// Flush every log entry with version at most `version` to the backing store and
    /// advance the latest-persisted marker to `version`.
    fn persist(&self, version: Version) -> Result<(), PersistenceError>;

    /// The latest persisted version. [`Version::INVALID`] if nothing has persisted.
    fn latest_persisted(&self) -> Version;

    /// Discard log entries strictly older than `earliest_version`.
    fn trim(&self, earliest_version: Version);

    /// Discard log entries strictly newer than `latest_version`. Used to roll back
    /// incomplete tails on recovery.
    fn truncate(&self, latest_version: Version);

    /// Stream the bytes representing this field's state at `version` into `signer`.
    /// Returns the number of bytes streamed: 0 if the log has no entry at `version`.
    fn update_signature(&self, version: Version, signer: &mut dyn Signer) -> usize;

    /// Attach `signature` to the log entry at `version`, if one exists.
    fn add_signature(&self, version: Version, signature: &[u8]);

    /// Stream the bytes representing this field's state at `version` into `verifier`.
    /// Returns the number of bytes streamed.
    fn update_verifier(&self, version: Version, verifier: &mut dyn Verifier) -> usize;

    /// The signature attached to the log entry at `version`, if any.
    fn signature(&self, version: Version) -> Option<SignatureBytes>;
}

/// One snapshot in a field's log.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
struct LogEntry {
    hlc: Hlc,
    bytes: Vec<u8>,
    signature: Option<SignatureBytes>,
}

/// The frame appended to a field's log file for every persisted entry.
#[derive(BorshSerialize, BorshDeserialize)]
struct PersistedFrame {
    version: i64,
    hlc: Hlc,
    bytes: Vec<u8>,
    signature: Option<SignatureBytes>,
}

struct FieldLog<T> {
    name: String,
    current: T,
    entries: BTreeMap<i64, LogEntry>,
    latest_version: Version,
    latest_persisted: Version,
    storage_path: Option<PathBuf>,
}

/// The serialized form of a field produced for state transfer.
#[derive(BorshSerialize, BorshDeserialize)]
struct FieldWireForm {
    name: String,
    current: Vec<u8>,
    latest_version: i64,
    latest_persisted: i64,
    entries: Vec<(i64, Hlc, Vec<u8>, Option<SignatureBytes>)>,
}

/// A versioned persistent field holding one value of type `T`.
///
/// User objects own `Persistent<T>` handles; constructing one with
/// [`new`](Persistent::new) registers the field with the owning object's registry under
/// `name`, so registry-level fan-outs ([`make_version`](PersistentRegistry::make_version),
/// [`persist`](PersistentRegistry::persist), signing) reach it. The handle and the
/// registry share the underlying log.
pub struct Persistent<T> {
    log: Arc<Mutex<FieldLog<T>>>,
}

impl<T> Clone for Persistent<T> {
    fn clone(&self) -> Self {
        Persistent {
            log: Arc::clone(&self.log),
        }
    }
}

impl<T> Persistent<T>
where
    T: BorshSerialize + BorshDeserialize + Clone + Send + 'static,
{
    /// Create a field holding `initial` and register it with `registry` under `name`.
    ///
    /// Registering a second field with the same name overrides the first.
    pub fn new(registry: &mut PersistentRegistry, name: &str, initial: T) -> Persistent<T> {
        let storage_path = registry.field_storage_path(name);
        let log = Arc::new(Mutex::new(FieldLog {
            name: name.to_string(),
            current: initial,
            entries: BTreeMap::new(),
            latest_version: Version::INVALID,
            latest_persisted: Version::INVALID,
            storage_path,
        }));
        let field = Persistent { log };
        registry.register_field(name, Box::new(field.clone()));
        field
    }

    /// Read the field's current (not-yet-versioned) value through `f`.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let log = self.log.lock().unwrap();
        f(&log.current)
    }

    /// A clone of the field's current value.
    pub fn get(&self) -> T {
        self.log.lock().unwrap().current.clone()
    }

    /// Mutate the field's current value through `f`. The change becomes durable once a
    /// later [`make_version`](PersistentField::make_version) + `persist` covers it.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut log = self.log.lock().unwrap();
        f(&mut log.current)
    }

    /// The value the field held at `version`: the snapshot taken at the nearest
    /// materialized version at or below `version`. `None` if no such snapshot survives
    /// in the log.
    pub fn get_by_version(&self, version: Version) -> Option<T> {
        let log = self.log.lock().unwrap();
        let (_, entry) = log.entries.range(..=version.int()).next_back()?;
        T::try_from_slice(&entry.bytes).ok()
    }

    /// Serialize this field for state transfer.
    ///
    /// Log entries below the calling thread's
    /// [earliest-version-to-serialize](PersistentRegistry::set_earliest_version_to_serialize)
    /// frontier are left out of the stream.
    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let log = self.log.lock().unwrap();
        let earliest = PersistentRegistry::earliest_version_to_serialize();
        let entries = log
            .entries
            .iter()
            .filter(|(version, _)| earliest.is_invalid() || **version >= earliest.int())
            .map(|(version, entry)| {
                (*version, entry.hlc, entry.bytes.clone(), entry.signature.clone())
            })
            .collect();
        let wire = FieldWireForm {
            name: log.name.clone(),
            current: log.current.try_to_vec()?,
            latest_version: log.latest_version.int(),
            latest_persisted: log.latest_persisted.int(),
            entries,
        };
        wire.try_to_vec()
    }

    /// Deserialize a field from `bytes` and register it with the registry seeded into
    /// `ctx`, so the rebuilt field belongs to the receiving replica. Returns the field
    /// and the number of bytes consumed.
    pub fn from_bytes(
        ctx: &mut DeserializationContext,
        bytes: &[u8],
    ) -> Result<(Persistent<T>, usize), std::io::Error> {
        let mut slice = bytes;
        let wire = FieldWireForm::deserialize(&mut slice)?;
        let consumed = bytes.len() - slice.len();

        let current = T::try_from_slice(&wire.current)?;
        let field = Persistent::new(ctx.registry, &wire.name, current);
        {
            let mut log = field.log.lock().unwrap();
            log.latest_version = Version::new(wire.latest_version);
            // The stream only proves persistence on the sender; the local log starts
            // unflushed.
            log.latest_persisted = Version::INVALID;
            for (version, hlc, entry_bytes, signature) in wire.entries {
                log.entries.insert(
                    version,
                    LogEntry {
                        hlc,
                        bytes: entry_bytes,
                        signature,
                    },
                );
            }
        }
        Ok((field, consumed))
    }
}

impl<T> PersistentField for Persistent<T>
where
    T: BorshSerialize + BorshDeserialize + Clone + Send + 'static,
{
    fn make_version(&self, version: Version, hlc: Hlc) {
        let mut log = self.log.lock().unwrap();
        let bytes = log
            .current
            .try_to_vec()
            .expect("serializing an in-memory value cannot fail");
        log.entries.insert(
            version.int(),
            LogEntry {
                hlc,
                bytes,
                signature: None,
            },
        );
        if version > log.latest_version {
            log.latest_version = version;
        }
    }

    fn latest_version(&self) -> Version {
        self.log.lock().unwrap().latest_version
    }

    fn persist(&self, version: Version) -> Result<(), PersistenceError> {
        let mut log = self.log.lock().unwrap();
        if version <= log.latest_persisted {
            return Ok(());
        }

        if let Some(path) = log.storage_path.clone() {
            let range_start = log.latest_persisted.int() + 1;
            let frames: Vec<PersistedFrame> = log
                .entries
                .range(range_start..=version.int())
                .map(|(entry_version, entry)| PersistedFrame {
                    version: *entry_version,
                    hlc: entry.hlc,
                    bytes: entry.bytes.clone(),
                    signature: entry.signature.clone(),
                })
                .collect();
            if !frames.is_empty() {
                append_frames(&path, &frames).map_err(|source| PersistenceError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        log.latest_persisted = version;
        Ok(())
    }

    fn latest_persisted(&self) -> Version {
        self.log.lock().unwrap().latest_persisted
    }

    fn trim(&self, earliest_version: Version) {
        let mut log = self.log.lock().unwrap();
        log.entries = log.entries.split_off(&earliest_version.int());
    }

    fn truncate(&self, latest_version: Version) {
        let mut log = self.log.lock().unwrap();
        log.entries.split_off(&(latest_version.int() + 1));
        if log.latest_version > latest_version {
            log.latest_version = latest_version;
        }
        if log.latest_persisted > latest_version {
            log.latest_persisted = latest_version;
        }
    }

    fn update_signature(&self, version: Version, signer: &mut dyn Signer) -> usize {
        let log = self.log.lock().unwrap();
        match log.entries.get(&version.int()) {
            Some(entry) => {
                signer.add_bytes(&entry.bytes);
                entry.bytes.len()
            }
            None => 0,
        }
    }

    fn add_signature(&self, version: Version, signature: &[u8]) {
        let mut log = self.log.lock().unwrap();
        if let Some(entry) = log.entries.get_mut(&version.int()) {
            entry.signature = Some(SignatureBytes::new(signature.to_vec()));
        }
    }

    fn update_verifier(&self, version: Version, verifier: &mut dyn Verifier) -> usize {
        let log = self.log.lock().unwrap();
        match log.entries.get(&version.int()) {
            Some(entry) => {
                verifier.add_bytes(&entry.bytes);
                entry.bytes.len()
            }
            None => 0,
        }
    }

    fn signature(&self, version: Version) -> Option<SignatureBytes> {
        let log = self.log.lock().unwrap();
        log.entries
            .get(&version.int())
            .and_then(|entry| entry.signature.clone())
    }
}

fn append_frames(path: &PathBuf, frames: &[PersistedFrame]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for frame in frames {
        let frame_bytes = frame.try_to_vec()?;
        file.write_all(&(frame_bytes.len() as u64).to_le_bytes())?;
        file.write_all(&frame_bytes)?;
    }
    file.sync_data()
}
