// tool-gate-mcp/src/callback.rs
// ============================================================================
// Module: Approval Callback Tokens
// Description: Signed, time-limited approval links for chat integrations.
// Purpose: Bind (pending_id, approver, action, exp) to an HMAC the server minted.
// Dependencies: hmac, sha2, base64
// ============================================================================

//! ## Overview
//! Chat systems render approve/deny buttons whose URLs carry a compact token:
//! `base64url(payload).base64url(hmac)` where the payload binds
//! `(pending_id, approver_id, action, exp)` and the HMAC-SHA-256 uses the
//! server's callback secret. Verification checks the tag in constant time
//! before trusting any field, then the expiry. The chat UI itself is out of
//! scope; this module is the whole wire contract.

// ============================================================================
// SECTION: Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;

use tool_gate_core::PendingId;
use tool_gate_core::SubjectId;
use tool_gate_core::Timestamp;
use tool_gate_core::runtime::ApprovalAction;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Callback token failures (`Unauthorized` to callers).
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Token structure malformed.
    #[error("callback token malformed")]
    Malformed,
    /// Signature does not verify.
    #[error("callback token signature invalid")]
    SignatureInvalid,
    /// Token expired.
    #[error("callback token expired")]
    Expired,
}

// ============================================================================
// SECTION: Token Claims
// ============================================================================

/// Payload bound by the token signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackClaims {
    /// Pending approval identifier.
    pub pending_id: PendingId,
    /// Approver the link was minted for.
    pub approver_id: SubjectId,
    /// Action the link records.
    pub action: ApprovalAction,
    /// Expiry, epoch seconds.
    pub exp: i64,
}

// ============================================================================
// SECTION: Signer
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Mints and verifies callback tokens with the server secret.
#[derive(Clone)]
pub struct CallbackSigner {
    /// Server callback secret.
    secret: Vec<u8>,
}

impl CallbackSigner {
    /// Creates a signer over the configured secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Mints a URL-safe token for the given claims.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Malformed`] when encoding fails.
    pub fn mint(&self, claims: &CallbackClaims) -> Result<String, CallbackError> {
        let payload = serde_json::to_vec(claims).map_err(|_| CallbackError::Malformed)?;
        let tag = self.tag(&payload)?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Verifies a token and returns its claims.
    ///
    /// The signature is checked (in constant time) before any field is
    /// trusted, then the expiry against `now`.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError`] naming the first failed check.
    pub fn verify(&self, token: &str, now: Timestamp) -> Result<CallbackClaims, CallbackError> {
        let (payload_b64, tag_b64) = token.split_once('.').ok_or(CallbackError::Malformed)?;
        let payload =
            URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| CallbackError::Malformed)?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).map_err(|_| CallbackError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| CallbackError::SignatureInvalid)?;
        mac.update(&payload);
        mac.verify_slice(&tag).map_err(|_| CallbackError::SignatureInvalid)?;
        let claims: CallbackClaims =
            serde_json::from_slice(&payload).map_err(|_| CallbackError::Malformed)?;
        if now.as_secs() > claims.exp {
            return Err(CallbackError::Expired);
        }
        Ok(claims)
    }

    /// Computes the HMAC tag for a payload.
    fn tag(&self, payload: &[u8]) -> Result<Vec<u8>, CallbackError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| CallbackError::SignatureInvalid)?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
