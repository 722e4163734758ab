// tool-gate-mcp/src/identity.rs
// ============================================================================
// Module: Identity & RBAC
// Description: Bearer token verification and role resolution.
// Purpose: Turn untrusted Authorization headers into verified principals.
// Dependencies: jsonwebtoken, reqwest, tool-gate-config
// ============================================================================

//! ## Overview
//! Two verification modes share one entry point: OIDC (RS256 against a cached
//! JWKS document, checking `iss`, `aud`, `exp`, and `nbf`) and a development
//! HS256 token signed with a configured secret. Verified claims resolve to a
//! [`Principal`] carrying `{tenant, subject, roles}`. Roles form a flat
//! capability set; `admin` implies the rest. All failures are fail-closed
//! `Unauthorized`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

use jsonwebtoken::Algorithm;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::Validation;
use jsonwebtoken::decode;
use jsonwebtoken::decode_header;
use jsonwebtoken::jwk::JwkSet;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use tool_gate_config::IdentityConfig;
use tool_gate_core::SubjectId;
use tool_gate_core::TenantId;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum Authorization header size accepted.
const MAX_AUTH_HEADER_BYTES: usize = 8 * 1024;
/// JWKS cache lifetime.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(300);
/// JWKS fetch timeout.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Tenant assigned when the token carries none.
const DEFAULT_TENANT: &str = "default";

// ============================================================================
// SECTION: Roles & Principal
// ============================================================================

/// Capability roles known to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full control; implies every other role.
    Admin,
    /// May record approval decisions.
    Approver,
    /// May read metrics, run the simulator, and export audit.
    Viewer,
}

impl Role {
    /// Parses a role label; unknown labels are ignored by callers.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "admin" => Some(Self::Admin),
            "approver" => Some(Self::Approver),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }

    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Approver => "approver",
            Self::Viewer => "viewer",
        }
    }
}

/// A verified caller.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Tenant resolved from the token.
    pub tenant: TenantId,
    /// Subject resolved from the token.
    pub subject: SubjectId,
    /// Role set; membership checks go through [`Principal::has_role`].
    pub roles: BTreeSet<Role>,
}

impl Principal {
    /// Returns true when the principal holds the role. `admin` implies all.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&Role::Admin) || self.roles.contains(&role)
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Identity verification failures (`Unauthorized` to callers).
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Authorization header missing or not a bearer scheme.
    #[error("missing bearer token")]
    MissingBearer,
    /// Header exceeded the size cap.
    #[error("authorization header too large")]
    HeaderTooLarge,
    /// Token failed verification in every configured mode.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// JWKS document could not be fetched or parsed.
    #[error("jwks fetch failed: {0}")]
    Jwks(String),
}

// ============================================================================
// SECTION: Claims
// ============================================================================

/// Claims read from verified tokens.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    /// Subject identifier.
    sub: Option<String>,
    /// Tenant claim.
    tenant: Option<String>,
    /// Role list claim.
    roles: Option<Value>,
    /// Singular role claim used by some issuers.
    role: Option<Value>,
}

impl TokenClaims {
    /// Resolves claims into a principal.
    fn into_principal(self) -> Principal {
        let mut roles = BTreeSet::new();
        for value in [self.roles, self.role].into_iter().flatten() {
            collect_roles(&value, &mut roles);
        }
        Principal {
            tenant: TenantId::new(self.tenant.unwrap_or_else(|| DEFAULT_TENANT.to_string())),
            subject: SubjectId::new(self.sub.unwrap_or_else(|| "unknown".to_string())),
            roles,
        }
    }
}

/// Accepts role claims shaped as a string or an array of strings.
fn collect_roles(value: &Value, out: &mut BTreeSet<Role>) {
    match value {
        Value::String(label) => {
            if let Some(role) = Role::parse(label) {
                out.insert(role);
            }
        }
        Value::Array(labels) => {
            for label in labels {
                if let Some(role) = label.as_str().and_then(Role::parse) {
                    out.insert(role);
                }
            }
        }
        _ => {}
    }
}

// ============================================================================
// SECTION: Verifier
// ============================================================================

/// Cached JWKS document.
struct CachedJwks {
    /// Parsed key set.
    keys: JwkSet,
    /// Fetch instant for TTL checks.
    fetched_at: Instant,
}

/// Bearer token verifier with JWKS caching.
pub struct IdentityVerifier {
    /// Identity configuration.
    config: IdentityConfig,
    /// HTTP client for JWKS fetches.
    http: reqwest::Client,
    /// JWKS cache.
    jwks: RwLock<Option<CachedJwks>>,
}

impl IdentityVerifier {
    /// Creates a verifier from configuration.
    #[must_use]
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            jwks: RwLock::new(None),
        }
    }

    /// Verifies an Authorization header value and resolves the principal.
    ///
    /// OIDC is attempted first when configured; the development HS256 mode is
    /// the fallback, mirroring how staged environments roll credentials.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] when no configured mode accepts the token.
    pub async fn verify_bearer(&self, header: Option<&str>) -> Result<Principal, IdentityError> {
        let token = parse_bearer(header)?;
        if self.config.oidc_enabled() {
            match self.verify_oidc(&token).await {
                Ok(principal) => return Ok(principal),
                Err(err) => {
                    if self.config.dev_jwt_secret.is_none() {
                        return Err(err);
                    }
                    tracing::debug!(error = %err, "oidc verification failed; trying dev mode");
                }
            }
        }
        self.verify_dev(&token)
    }

    /// Verifies an RS256 token against the cached JWKS.
    async fn verify_oidc(&self, token: &str) -> Result<Principal, IdentityError> {
        let header = decode_header(token)
            .map_err(|err| IdentityError::InvalidToken(err.to_string()))?;
        let kid = header.kid.ok_or_else(|| {
            IdentityError::InvalidToken("token header missing kid".to_string())
        })?;
        let jwk = self.find_key(&kid).await?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|err| IdentityError::Jwks(err.to_string()))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_nbf = true;
        if let Some(issuer) = &self.config.oidc_issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.config.oidc_audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        let data = decode::<TokenClaims>(token, &key, &validation)
            .map_err(|err| IdentityError::InvalidToken(err.to_string()))?;
        Ok(data.claims.into_principal())
    }

    /// Verifies a development HS256 token.
    fn verify_dev(&self, token: &str) -> Result<Principal, IdentityError> {
        let secret = self
            .config
            .dev_jwt_secret
            .as_deref()
            .ok_or_else(|| IdentityError::InvalidToken("no dev secret configured".to_string()))?;
        let key = DecodingKey::from_secret(secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        if let Some(issuer) = &self.config.dev_issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.config.oidc_audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        let data = decode::<TokenClaims>(token, &key, &validation)
            .map_err(|err| IdentityError::InvalidToken(err.to_string()))?;
        Ok(data.claims.into_principal())
    }

    /// Finds the JWKS key with the given id, refreshing the cache as needed.
    async fn find_key(&self, kid: &str) -> Result<jsonwebtoken::jwk::Jwk, IdentityError> {
        if let Some(cached) = self.jwks.read().await.as_ref()
            && cached.fetched_at.elapsed() < JWKS_CACHE_TTL
            && let Some(jwk) = cached.keys.find(kid)
        {
            return Ok(jwk.clone());
        }
        let url = self
            .config
            .oidc_jwks_url
            .as_deref()
            .ok_or_else(|| IdentityError::Jwks("no jwks url configured".to_string()))?;
        let keys: JwkSet = self
            .http
            .get(url)
            .timeout(JWKS_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|err| IdentityError::Jwks(err.to_string()))?
            .json()
            .await
            .map_err(|err| IdentityError::Jwks(err.to_string()))?;
        let jwk = keys
            .find(kid)
            .cloned()
            .ok_or_else(|| IdentityError::Jwks(format!("key '{kid}' not in jwks")))?;
        *self.jwks.write().await = Some(CachedJwks {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(jwk)
    }
}

/// Extracts the token from a bearer Authorization header.
fn parse_bearer(header: Option<&str>) -> Result<String, IdentityError> {
    let header = header.ok_or(IdentityError::MissingBearer)?;
    if header.len() > MAX_AUTH_HEADER_BYTES {
        return Err(IdentityError::HeaderTooLarge);
    }
    let mut parts = header.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(IdentityError::MissingBearer);
    }
    Ok(token.to_string())
}

// ============================================================================
// SECTION: Dev Token Minting
// ============================================================================

/// Claims encoded into minted development tokens.
#[derive(Debug, Serialize)]
struct DevClaims<'a> {
    /// Subject identifier.
    sub: &'a str,
    /// Tenant claim.
    tenant: &'a str,
    /// Role labels.
    roles: Vec<&'static str>,
    /// Issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<&'a str>,
    /// Audience.
    #[serde(skip_serializing_if = "Option::is_none")]
    aud: Option<&'a str>,
    /// Expiry, epoch seconds.
    exp: i64,
}

/// Mints a development HS256 bearer token.
///
/// # Errors
///
/// Returns [`IdentityError::InvalidToken`] when encoding fails.
pub fn mint_dev_token(
    config: &IdentityConfig,
    tenant: &TenantId,
    subject: &SubjectId,
    roles: &BTreeSet<Role>,
    expires_at_epoch_secs: i64,
) -> Result<String, IdentityError> {
    let secret = config
        .dev_jwt_secret
        .as_deref()
        .ok_or_else(|| IdentityError::InvalidToken("no dev secret configured".to_string()))?;
    let claims = DevClaims {
        sub: subject.as_str(),
        tenant: tenant.as_str(),
        roles: roles.iter().map(|role| role.as_str()).collect(),
        iss: config.dev_issuer.as_deref(),
        aud: config.oidc_audience.as_deref(),
        exp: expires_at_epoch_secs,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| IdentityError::InvalidToken(err.to_string()))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions.")]

    use std::collections::BTreeSet;

    use super::IdentityError;
    use super::IdentityVerifier;
    use super::Principal;
    use super::Role;
    use super::mint_dev_token;
    use tool_gate_config::IdentityConfig;
    use tool_gate_core::SubjectId;
    use tool_gate_core::TenantId;

    fn dev_config() -> IdentityConfig {
        IdentityConfig {
            oidc_issuer: None,
            oidc_jwks_url: None,
            oidc_audience: None,
            dev_jwt_secret: Some("dev-secret-dev-secret".to_string()),
            dev_issuer: Some("tool-gate-dev".to_string()),
        }
    }

    fn far_future() -> i64 {
        4_102_444_800 // 2100-01-01
    }

    fn mint(roles: &[Role]) -> String {
        mint_dev_token(
            &dev_config(),
            &TenantId::new("acme"),
            &SubjectId::new("agent-7"),
            &roles.iter().copied().collect::<BTreeSet<_>>(),
            far_future(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dev_token_round_trips_principal() {
        let verifier = IdentityVerifier::new(dev_config());
        let token = mint(&[Role::Approver, Role::Viewer]);
        let principal =
            verifier.verify_bearer(Some(&format!("Bearer {token}"))).await.unwrap();
        assert_eq!(principal.tenant, TenantId::new("acme"));
        assert_eq!(principal.subject, SubjectId::new("agent-7"));
        assert!(principal.has_role(Role::Approver));
        assert!(principal.has_role(Role::Viewer));
        assert!(!principal.has_role(Role::Admin));
    }

    #[tokio::test]
    async fn admin_implies_every_role() {
        let principal = Principal {
            tenant: TenantId::new("acme"),
            subject: SubjectId::new("root"),
            roles: [Role::Admin].into_iter().collect(),
        };
        assert!(principal.has_role(Role::Admin));
        assert!(principal.has_role(Role::Approver));
        assert!(principal.has_role(Role::Viewer));
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let verifier = IdentityVerifier::new(dev_config());
        let err = verifier.verify_bearer(None).await.unwrap_err();
        assert!(matches!(err, IdentityError::MissingBearer), "unexpected error {err}");
    }

    #[tokio::test]
    async fn non_bearer_scheme_is_rejected() {
        let verifier = IdentityVerifier::new(dev_config());
        let err = verifier.verify_bearer(Some("Basic dXNlcg==")).await.unwrap_err();
        assert!(matches!(err, IdentityError::MissingBearer), "unexpected error {err}");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let verifier = IdentityVerifier::new(dev_config());
        let token = mint_dev_token(
            &dev_config(),
            &TenantId::new("acme"),
            &SubjectId::new("agent-7"),
            &BTreeSet::new(),
            1_000_000, // long past
        )
        .unwrap();
        let err =
            verifier.verify_bearer(Some(&format!("Bearer {token}"))).await.unwrap_err();
        assert!(matches!(err, IdentityError::InvalidToken(_)), "unexpected error {err}");
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let mut other = dev_config();
        other.dev_jwt_secret = Some("another-secret-entirely".to_string());
        let verifier = IdentityVerifier::new(other);
        let token = mint(&[Role::Viewer]);
        let err =
            verifier.verify_bearer(Some(&format!("Bearer {token}"))).await.unwrap_err();
        assert!(matches!(err, IdentityError::InvalidToken(_)), "unexpected error {err}");
    }

    #[test]
    fn unknown_role_labels_are_ignored() {
        let mut roles = BTreeSet::new();
        super::collect_roles(&serde_json::json!(["admin", "sudo", 42]), &mut roles);
        assert_eq!(roles.len(), 1);
        assert!(roles.contains(&Role::Admin));
    }
}
