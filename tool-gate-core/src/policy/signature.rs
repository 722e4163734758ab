// tool-gate-core/src/policy/signature.rs
// ============================================================================
// Module: Bundle Signatures
// Description: Ed25519 signing and verification of policy bundle bytes.
// Purpose: Gate bundle activation on a verifiable publisher signature.
// Dependencies: ed25519-dalek, base64, serde, sha2
// ============================================================================

//! ## Overview
//! A bundle ships with a companion `.sig` JSON document carrying the SHA-256
//! of the YAML bytes and an Ed25519 signature over that digest. Verification
//! recomputes the digest, compares it to the claimed value, and checks the
//! signature against the configured public key. Ed25519 signatures are
//! deterministic, so re-signing identical bytes with the same key and
//! `created` stamp reproduces the `.sig` byte for byte.

// ============================================================================
// SECTION: Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::hashing::hex_encode;
use crate::hashing::sha256_bytes;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Signature algorithm label accepted in `.sig` documents.
const SIGNATURE_ALG: &str = "Ed25519";
/// Prefix of public-key fingerprints.
const FINGERPRINT_PREFIX: &str = "toolgate:v1";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Signature verification failures (`SignatureInvalid` to callers).
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The `.sig` document could not be parsed.
    #[error("signature document malformed: {0}")]
    Malformed(String),
    /// The algorithm label is not Ed25519.
    #[error("unsupported signature algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    /// The claimed digest does not match the bundle bytes.
    #[error("sha256 mismatch between bundle bytes and signature document")]
    DigestMismatch,
    /// The public key could not be decoded.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    /// The signature bytes are invalid or do not verify.
    #[error("signature invalid: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Signature Document
// ============================================================================

/// Companion `.sig` JSON document for a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFile {
    /// Signature algorithm; always `Ed25519`.
    pub alg: String,
    /// Base64 SHA-256 digest of the bundle bytes.
    pub sha256: String,
    /// Base64 Ed25519 signature over the digest bytes.
    pub sig: String,
    /// Fingerprint of the signing public key.
    pub pubkey_fingerprint: String,
    /// RFC 3339 creation stamp.
    pub created: String,
}

impl SignatureFile {
    /// Parses a `.sig` JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Malformed`] when the JSON is invalid.
    pub fn parse(bytes: &[u8]) -> Result<Self, SignatureError> {
        serde_json::from_slice(bytes).map_err(|err| SignatureError::Malformed(err.to_string()))
    }

    /// Serializes the document to its canonical pretty JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Malformed`] when serialization fails.
    pub fn to_json(&self) -> Result<String, SignatureError> {
        serde_json::to_string_pretty(self).map_err(|err| SignatureError::Malformed(err.to_string()))
    }
}

// ============================================================================
// SECTION: Verification
// ============================================================================

/// Verifies bundle bytes against a `.sig` document and a base64 public key.
///
/// # Errors
///
/// Returns [`SignatureError`] describing the first check that failed.
pub fn verify_bundle(
    bundle_bytes: &[u8],
    signature: &SignatureFile,
    public_key_b64: &str,
) -> Result<(), SignatureError> {
    if signature.alg != SIGNATURE_ALG {
        return Err(SignatureError::UnsupportedAlgorithm(signature.alg.clone()));
    }
    let claimed = BASE64
        .decode(&signature.sha256)
        .map_err(|err| SignatureError::Malformed(format!("sha256 field: {err}")))?;
    let actual = sha256_bytes(bundle_bytes);
    if claimed != actual {
        return Err(SignatureError::DigestMismatch);
    }
    let key = decode_public_key(public_key_b64)?;
    let sig_bytes = BASE64
        .decode(&signature.sig)
        .map_err(|err| SignatureError::Malformed(format!("sig field: {err}")))?;
    let sig_array: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::Invalid("signature must be 64 bytes".to_string()))?;
    let sig = Signature::from_bytes(&sig_array);
    key.verify(&actual, &sig).map_err(|err| SignatureError::Invalid(err.to_string()))
}

/// Signs bundle bytes, producing the `.sig` document.
#[must_use]
pub fn sign_bundle(bundle_bytes: &[u8], key: &SigningKey, created: &str) -> SignatureFile {
    let digest = sha256_bytes(bundle_bytes);
    let sig = key.sign(&digest);
    SignatureFile {
        alg: SIGNATURE_ALG.to_string(),
        sha256: BASE64.encode(digest),
        sig: BASE64.encode(sig.to_bytes()),
        pubkey_fingerprint: fingerprint(&key.verifying_key()),
        created: created.to_string(),
    }
}

/// Decodes a base64 Ed25519 public key.
///
/// # Errors
///
/// Returns [`SignatureError::InvalidPublicKey`] on decode failure.
pub fn decode_public_key(public_key_b64: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = BASE64
        .decode(public_key_b64.trim())
        .map_err(|err| SignatureError::InvalidPublicKey(err.to_string()))?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidPublicKey("key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|err| SignatureError::InvalidPublicKey(err.to_string()))
}

/// Returns the short fingerprint of a public key.
#[must_use]
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = sha256_bytes(key.as_bytes());
    format!("{FINGERPRINT_PREFIX}:{}", hex_encode(&digest[..4]))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
