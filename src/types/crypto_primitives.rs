/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The persistence pipeline signs and verifies log versions through the abstract
//! [`Signer`] and [`Verifier`] capabilities, which accumulate bytes incrementally and
//! finalize into (or against) a signature. [`Ed25519Signer`] and [`Ed25519Verifier`] are
//! the library-provided implementations, backed by `ed25519_dalek`.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::Path;

use super::data_types::SignatureBytes;

// re-exports below.
pub use sha2::{Digest, Sha256 as CryptoHasher};

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

/// Length of an Ed25519 signature in bytes.
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Length of an Ed25519 private-key seed in bytes.
pub const ED25519_SEED_SIZE: usize = 32;

/// Capability for producing a signature over incrementally accumulated bytes.
///
/// Usage protocol: [`init`](Signer::init), then any number of
/// [`add_bytes`](Signer::add_bytes), then [`finalize`](Signer::finalize). `finalize`
/// writes at most [`max_signature_size`](Signer::max_signature_size) bytes into the
/// output buffer and returns the number written.
pub trait Signer: Send {
    /// Reset the signer, discarding any accumulated bytes.
    fn init(&mut self);

    /// Accumulate `bytes` into the data to be signed.
    fn add_bytes(&mut self, bytes: &[u8]);

    /// Sign the accumulated bytes, writing the signature into `signature_out`.
    ///
    /// Returns the number of signature bytes written. Fails with
    /// [`SignerError::BufferTooSmall`] if `signature_out` is shorter than
    /// [`max_signature_size`](Signer::max_signature_size).
    fn finalize(&mut self, signature_out: &mut [u8]) -> Result<usize, SignerError>;

    /// The largest signature this signer can produce, in bytes.
    fn max_signature_size(&self) -> usize;
}

/// Capability for checking a signature over incrementally accumulated bytes.
///
/// Mirrors [`Signer`]: [`init`](Verifier::init), [`add_bytes`](Verifier::add_bytes),
/// then [`finalize`](Verifier::finalize) against a supplied signature.
pub trait Verifier: Send {
    /// Reset the verifier, discarding any accumulated bytes.
    fn init(&mut self);

    /// Accumulate `bytes` into the data to be verified.
    fn add_bytes(&mut self, bytes: &[u8]);

    /// Check `signature` against the accumulated bytes.
    fn finalize(&mut self, signature: &[u8]) -> bool;
}

/// A [`Signer`] that signs the accumulated bytes with an Ed25519 private key.
pub struct Ed25519Signer {
    signing_key: SigningKey,
    buffer: Vec<u8>,
}

impl Ed25519Signer {
    pub fn new(signing_key: SigningKey) -> Ed25519Signer {
        Ed25519Signer {
            signing_key,
            buffer: Vec::new(),
        }
    }

    /// Load the private key from a raw 32-byte seed file and construct a signer around it.
    pub fn from_key_file(path: &Path) -> Result<Ed25519Signer, KeyLoadError> {
        let signing_key = load_signing_key(path)?;
        Ok(Ed25519Signer::new(signing_key))
    }

    /// The public half of the loaded key, for constructing the matching
    /// [`Ed25519Verifier`].
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl Signer for Ed25519Signer {
    fn init(&mut self) {
        self.buffer.clear();
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn finalize(&mut self, signature_out: &mut [u8]) -> Result<usize, SignerError> {
        if signature_out.len() < ED25519_SIGNATURE_SIZE {
            return Err(SignerError::BufferTooSmall {
                required: ED25519_SIGNATURE_SIZE,
                provided: signature_out.len(),
            });
        }
        use ed25519_dalek::Signer as _;
        let signature = self.signing_key.sign(&self.buffer);
        signature_out[..ED25519_SIGNATURE_SIZE].copy_from_slice(&signature.to_bytes());
        Ok(ED25519_SIGNATURE_SIZE)
    }

    fn max_signature_size(&self) -> usize {
        ED25519_SIGNATURE_SIZE
    }
}

/// A [`Verifier`] that checks Ed25519 signatures produced by [`Ed25519Signer`].
pub struct Ed25519Verifier {
    verifying_key: VerifyingKey,
    buffer: Vec<u8>,
}

impl Ed25519Verifier {
    pub fn new(verifying_key: VerifyingKey) -> Ed25519Verifier {
        Ed25519Verifier {
            verifying_key,
            buffer: Vec::new(),
        }
    }
}

impl Verifier for Ed25519Verifier {
    fn init(&mut self) {
        self.buffer.clear();
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn finalize(&mut self, signature: &[u8]) -> bool {
        let signature_bytes: [u8; ED25519_SIGNATURE_SIZE] = match signature.try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        use ed25519_dalek::Verifier as _;
        let signature = Signature::from_bytes(&signature_bytes);
        self.verifying_key.verify(&self.buffer, &signature).is_ok()
    }
}

/// Read an Ed25519 signing key from a raw 32-byte seed file.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, KeyLoadError> {
    let bytes = fs::read(path).map_err(|source| KeyLoadError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let seed: [u8; ED25519_SEED_SIZE] =
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyLoadError::WrongLength {
                path: path.to_path_buf(),
                length: bytes.len(),
            })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Compute a [`SignatureBytes`] over `message` directly, without the incremental
/// protocol. Used by tests and by recovery tooling.
pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> SignatureBytes {
    use ed25519_dalek::Signer as _;
    SignatureBytes::new(signing_key.sign(message).to_bytes().to_vec())
}

/// Error when the configured private key file cannot be turned into a signing key.
#[derive(Debug)]
pub enum KeyLoadError {
    /// The signed persistent log is enabled but no private key file is configured.
    NotConfigured,
    Unreadable {
        path: std::path::PathBuf,
        source: io::Error,
    },
    WrongLength {
        path: std::path::PathBuf,
        length: usize,
    },
}

impl Display for KeyLoadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KeyLoadError::NotConfigured => write!(
                f,
                "the signed persistent log is enabled but no private key file is configured"
            ),
            KeyLoadError::Unreadable { path, source } => {
                write!(f, "cannot read private key file {}: {}", path.display(), source)
            }
            KeyLoadError::WrongLength { path, length } => write!(
                f,
                "private key file {} holds {} bytes, expected a {}-byte Ed25519 seed",
                path.display(),
                length,
                ED25519_SEED_SIZE
            ),
        }
    }
}

/// Error from a [`Signer`] primitive.
#[derive(Debug)]
pub enum SignerError {
    BufferTooSmall { required: usize, provided: usize },
}

impl Display for SignerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SignerError::BufferTooSmall { required, provided } => write!(
                f,
                "signature buffer holds {} bytes but the signer requires {}",
                provided, required
            ),
        }
    }
}
