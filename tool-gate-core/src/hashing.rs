// tool-gate-core/src/hashing.rs
// ============================================================================
// Module: Tool Gate Canonical Hashing
// Description: RFC 8785 JSON canonicalization and SHA-256 content hashing.
// Purpose: Provide deterministic digests for audit chaining and bundle pins.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! Tool Gate hashes all canonical JSON using RFC 8785 (JCS) so digests are
//! stable across processes and replayable from exported audit logs. Binary
//! payloads (bundle bytes) are hashed directly over raw bytes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when computing canonical hashes.
#[derive(Debug, Error)]
pub enum HashError {
    /// JSON canonicalization failed.
    #[error("failed to canonicalize json: {0}")]
    Canonicalization(String),
}

// ============================================================================
// SECTION: Hashing Helpers
// ============================================================================

/// Returns canonical JSON bytes for a serializable value using RFC 8785.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    serde_jcs::to_vec(value).map_err(|err| HashError::Canonicalization(err.to_string()))
}

/// Hashes raw bytes with SHA-256 and returns the lowercase hex digest.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_encode(&sha256_bytes(bytes))
}

/// Hashes raw bytes with SHA-256 and returns the digest bytes.
#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hashes the canonical JSON form of a value and returns the hex digest.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn sha256_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    Ok(sha256_hex(&canonical_json_bytes(value)?))
}

/// Chains a digest onto a previous hex digest: `SHA-256(prev ∥ canonical)`.
///
/// # Errors
///
/// Returns [`HashError::Canonicalization`] when serialization fails.
pub fn chain_hash<T: Serialize + ?Sized>(prev_hash: &str, value: &T) -> Result<String, HashError> {
    let mut combined = prev_hash.as_bytes().to_vec();
    combined.extend_from_slice(&canonical_json_bytes(value)?);
    Ok(sha256_hex(&combined))
}

// ============================================================================
// SECTION: Hex Encoding
// ============================================================================

/// Encodes bytes as a lowercase hex string.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let hi = usize::from(byte >> 4);
        let lo = usize::from(byte & 0x0f);
        out.push(char::from(HEX[hi]));
        out.push(char::from(HEX[lo]));
    }
    out
}

// ============================================================================
// SECTION: Tests
// ============================================================================
