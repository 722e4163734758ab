// tool-gate-config/src/config.rs
// ============================================================================
// Module: Configuration Model
// Description: TOML configuration with env overrides and hard limits.
// Purpose: Provide strict, fail-closed config parsing for the gateway.
// Dependencies: serde, toml
// ============================================================================

//! ## Overview
//! [`ToolGateConfig`] is the single configuration document. `load` resolves
//! the file path, enforces a size cap, parses TOML with unknown keys
//! rejected, applies documented environment overrides, and validates every
//! section. Defaults keep a bare config usable for local development (stdio
//! transport, in-memory stores, dev HMAC identity) while production settings
//! are all explicit.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "tool-gate.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "TOOL_GATE_CONFIG";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum accepted request body size in bytes.
pub const MAX_BODY_BYTES_LIMIT: usize = 16 * 1024 * 1024;
/// Default maximum request body size in bytes.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
/// Default bind address for the HTTP transport.
pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
/// Default tenant QPS when no quota is configured.
pub const DEFAULT_QPS: f64 = 25.0;
/// Maximum configurable tenant QPS.
pub const MAX_QPS: f64 = 100_000.0;
/// Default approval TTL in seconds.
pub const DEFAULT_APPROVAL_TTL_SECONDS: u64 = 900;
/// Maximum approval TTL in seconds (one week).
pub const MAX_APPROVAL_TTL_SECONDS: u64 = 7 * 24 * 3_600;
/// Maximum synchronous approval wait in milliseconds (five minutes).
pub const MAX_SYNC_WAIT_MS: u64 = 300_000;
/// Minimum secret length for HMAC-based signing.
pub const MIN_SECRET_BYTES: usize = 16;
/// Maximum number of approver groups.
pub const MAX_APPROVER_GROUPS: usize = 128;
/// Maximum members per approver group.
pub const MAX_GROUP_MEMBERS: usize = 1_024;
/// Default callback link expiry in seconds.
pub const DEFAULT_CALLBACK_TTL_SECONDS: u64 = 3_600;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parse failure, including unknown keys.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A value failed validation.
    #[error("config invalid: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Configuration Types
// ============================================================================

/// Transport served by the gateway process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerTransport {
    /// Newline-delimited JSON-RPC on stdin/stdout.
    Stdio,
    /// JSON-RPC over HTTP POST plus the operator REST surface.
    Http,
}

impl Default for ServerTransport {
    fn default() -> Self {
        Self::Stdio
    }
}

/// Server section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Transport to serve.
    pub transport: ServerTransport,
    /// Bind address for the HTTP transport.
    pub bind: String,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: ServerTransport::default(),
            bind: DEFAULT_BIND.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ServerConfig {
    /// Validates the server section.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_body_bytes == 0 || self.max_body_bytes > MAX_BODY_BYTES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "server.max_body_bytes must be in 1..={MAX_BODY_BYTES_LIMIT}"
            )));
        }
        if self.transport == ServerTransport::Http {
            self.bind
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::Invalid(format!("server.bind '{}' invalid", self.bind)))?;
        }
        Ok(())
    }
}

/// Policy bundle section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyConfig {
    /// Path to the initial bundle YAML (`POLICY_FILE`).
    pub file: Option<PathBuf>,
    /// Path to the companion `.sig` document (`POLICY_SIG_PATH`).
    pub sig_path: Option<PathBuf>,
    /// Base64 Ed25519 public key (`POLICY_PUBLIC_KEY_B64`).
    pub public_key_b64: Option<String>,
    /// Refuse unsigned bundles (`POLICY_REQUIRE_SIGNATURE`).
    pub require_signature: bool,
    /// Directory receiving applied bundle versions.
    pub versions_dir: Option<PathBuf>,
    /// Seed for deterministic canary bucketing.
    pub rollout_seed: u64,
}

impl PolicyConfig {
    /// Validates the policy section.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.require_signature {
            if self.public_key_b64.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::Invalid(
                    "policy.require_signature needs policy.public_key_b64".to_string(),
                ));
            }
            if self.sig_path.is_none() {
                return Err(ConfigError::Invalid(
                    "policy.require_signature needs policy.sig_path".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One named approver group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalGroup {
    /// Group name referenced by rules' `approver_group`.
    pub name: String,
    /// Subject ids allowed to decide matching approvals.
    pub members: Vec<String>,
}

/// Approvals section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApprovalsConfig {
    /// Bounded synchronous wait in milliseconds (`APPROVAL_SYNC_WAIT_MS`).
    pub sync_wait_ms: u64,
    /// Pending record TTL in seconds (`APPROVAL_TTL_SECONDS`).
    pub ttl_seconds: u64,
    /// Named approver groups.
    pub groups: Vec<ApprovalGroup>,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            sync_wait_ms: 0,
            ttl_seconds: DEFAULT_APPROVAL_TTL_SECONDS,
            groups: Vec::new(),
        }
    }
}

impl ApprovalsConfig {
    /// Validates the approvals section.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_wait_ms > MAX_SYNC_WAIT_MS {
            return Err(ConfigError::Invalid(format!(
                "approvals.sync_wait_ms must be <= {MAX_SYNC_WAIT_MS}"
            )));
        }
        if self.ttl_seconds == 0 || self.ttl_seconds > MAX_APPROVAL_TTL_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "approvals.ttl_seconds must be in 1..={MAX_APPROVAL_TTL_SECONDS}"
            )));
        }
        if self.groups.len() > MAX_APPROVER_GROUPS {
            return Err(ConfigError::Invalid(format!(
                "approvals.groups must have <= {MAX_APPROVER_GROUPS} entries"
            )));
        }
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(ConfigError::Invalid("approver group name empty".to_string()));
            }
            if group.members.len() > MAX_GROUP_MEMBERS {
                return Err(ConfigError::Invalid(format!(
                    "approver group '{}' exceeds {MAX_GROUP_MEMBERS} members",
                    group.name
                )));
            }
        }
        Ok(())
    }
}

/// Identity section. OIDC settings and the dev HMAC fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IdentityConfig {
    /// Expected OIDC issuer (`OIDC_ISSUER`).
    pub oidc_issuer: Option<String>,
    /// JWKS document URL (`OIDC_JWKS_URL`).
    pub oidc_jwks_url: Option<String>,
    /// Expected audience (`OIDC_AUDIENCE`).
    pub oidc_audience: Option<String>,
    /// Dev HS256 secret (`DEV_JWT_SECRET`).
    pub dev_jwt_secret: Option<String>,
    /// Dev issuer (`DEV_ISSUER`).
    pub dev_issuer: Option<String>,
}

impl IdentityConfig {
    /// Returns true when OIDC verification is configured.
    #[must_use]
    pub fn oidc_enabled(&self) -> bool {
        self.oidc_issuer.is_some() && self.oidc_jwks_url.is_some()
    }

    /// Validates the identity section.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.oidc_issuer.is_some() != self.oidc_jwks_url.is_some() {
            return Err(ConfigError::Invalid(
                "identity.oidc_issuer and identity.oidc_jwks_url must be set together".to_string(),
            ));
        }
        if !self.oidc_enabled() {
            match self.dev_jwt_secret.as_deref() {
                Some(secret) if secret.len() >= MIN_SECRET_BYTES => {}
                Some(_) => {
                    return Err(ConfigError::Invalid(format!(
                        "identity.dev_jwt_secret must be >= {MIN_SECRET_BYTES} bytes"
                    )));
                }
                None => {
                    return Err(ConfigError::Invalid(
                        "identity requires oidc settings or identity.dev_jwt_secret".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Coordinating store section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoordinatorConfig {
    /// Store URL (`COORDINATOR_URL`); `memory:` is process-local.
    pub url: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: "memory:".to_string(),
        }
    }
}

/// Audit store section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuditConfig {
    /// Audit URL (`AUDIT_URL`); `memory:` or `file:<path>`.
    pub url: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            url: "memory:".to_string(),
        }
    }
}

impl AuditConfig {
    /// Returns the file path when the URL names a file-backed log.
    #[must_use]
    pub fn file_path(&self) -> Option<PathBuf> {
        self.url.strip_prefix("file:").map(PathBuf::from)
    }

    /// Validates the audit section.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url == "memory:" || self.file_path().is_some_and(|path| !path.as_os_str().is_empty())
        {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "audit.url '{}' must be 'memory:' or 'file:<path>'",
                self.url
            )))
        }
    }
}

/// Approval callback section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CallbackConfig {
    /// HMAC secret for signed callback links (`CALLBACK_SIGNING_SECRET`).
    pub signing_secret: Option<String>,
    /// Expiry of minted callback links, in seconds.
    pub token_ttl_seconds: Option<u64>,
}

impl CallbackConfig {
    /// Returns the effective link TTL.
    #[must_use]
    pub fn effective_ttl_seconds(&self) -> u64 {
        self.token_ttl_seconds.unwrap_or(DEFAULT_CALLBACK_TTL_SECONDS)
    }

    /// Validates the callback section.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(secret) = &self.signing_secret
            && secret.len() < MIN_SECRET_BYTES
        {
            return Err(ConfigError::Invalid(format!(
                "callback.signing_secret must be >= {MIN_SECRET_BYTES} bytes"
            )));
        }
        Ok(())
    }
}

/// Gateway-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LimitsConfig {
    /// QPS applied to tenants without an explicit quota.
    pub default_qps: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_qps: DEFAULT_QPS,
        }
    }
}

impl LimitsConfig {
    /// Validates the limits section.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=MAX_QPS).contains(&self.default_qps) {
            return Err(ConfigError::Invalid(format!(
                "limits.default_qps must be in 0..={MAX_QPS}"
            )));
        }
        Ok(())
    }
}

/// Top-level Tool Gate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolGateConfig {
    /// Server transport and limits.
    pub server: ServerConfig,
    /// Policy bundle settings.
    pub policy: PolicyConfig,
    /// Approval settings and groups.
    pub approvals: ApprovalsConfig,
    /// Identity verification settings.
    pub identity: IdentityConfig,
    /// Coordinating store settings.
    pub coordinator: CoordinatorConfig,
    /// Audit store settings.
    pub audit: AuditConfig,
    /// Approval callback settings.
    pub callback: CallbackConfig,
    /// Gateway-wide limits.
    pub limits: LimitsConfig,
}

impl ToolGateConfig {
    /// Loads configuration from disk, applies env overrides, and validates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading, parsing, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path);
        let mut config = if resolved.exists() {
            let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
            if bytes.len() > MAX_CONFIG_FILE_SIZE {
                return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
            }
            let content = std::str::from_utf8(&bytes)
                .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?
        } else if path.is_some() {
            return Err(ConfigError::Io(format!("config file '{}' not found", resolved.display())));
        } else {
            Self::default()
        };
        config.apply_env_overrides(&EnvSource::process());
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first failing value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.policy.validate()?;
        self.approvals.validate()?;
        self.identity.validate()?;
        self.audit.validate()?;
        self.callback.validate()?;
        self.limits.validate()?;
        Ok(())
    }

    /// Applies the documented environment overrides.
    fn apply_env_overrides(&mut self, env: &EnvSource) {
        if let Some(value) = env.get("POLICY_FILE") {
            self.policy.file = Some(PathBuf::from(value));
        }
        if let Some(value) = env.get("POLICY_SIG_PATH") {
            self.policy.sig_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env.get("POLICY_PUBLIC_KEY_B64") {
            self.policy.public_key_b64 = Some(value);
        }
        if let Some(value) = env.get("POLICY_REQUIRE_SIGNATURE") {
            self.policy.require_signature = parse_bool(&value);
        }
        if let Some(value) = env.get("COORDINATOR_URL") {
            self.coordinator.url = value;
        }
        if let Some(value) = env.get("AUDIT_URL") {
            self.audit.url = value;
        }
        if let Some(value) = env.get("APPROVAL_SYNC_WAIT_MS")
            && let Ok(parsed) = value.parse()
        {
            self.approvals.sync_wait_ms = parsed;
        }
        if let Some(value) = env.get("APPROVAL_TTL_SECONDS")
            && let Ok(parsed) = value.parse()
        {
            self.approvals.ttl_seconds = parsed;
        }
        if let Some(value) = env.get("OIDC_ISSUER") {
            self.identity.oidc_issuer = Some(value);
        }
        if let Some(value) = env.get("OIDC_JWKS_URL") {
            self.identity.oidc_jwks_url = Some(value);
        }
        if let Some(value) = env.get("OIDC_AUDIENCE") {
            self.identity.oidc_audience = Some(value);
        }
        if let Some(value) = env.get("DEV_JWT_SECRET") {
            self.identity.dev_jwt_secret = Some(value);
        }
        if let Some(value) = env.get("DEV_ISSUER") {
            self.identity.dev_issuer = Some(value);
        }
        if let Some(value) = env.get("CALLBACK_SIGNING_SECRET") {
            self.callback.signing_secret = Some(value);
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Environment lookup seam, overridable in tests.
struct EnvSource {
    /// Lookup function.
    lookup: fn(&str) -> Option<String>,
}

impl EnvSource {
    /// Reads from the process environment.
    fn process() -> Self {
        Self {
            lookup: |key| env::var(key).ok(),
        }
    }

    /// Looks up a variable.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.is_empty())
    }
}

/// Resolves the config path: explicit arg, env var, then the default name.
fn resolve_path(path: Option<&Path>) -> PathBuf {
    if let Some(path) = path {
        return path.to_path_buf();
    }
    if let Ok(value) = env::var(CONFIG_ENV_VAR)
        && !value.is_empty()
    {
        return PathBuf::from(value);
    }
    PathBuf::from(DEFAULT_CONFIG_NAME)
}

/// Parses permissive boolean strings (`1`, `true`, `yes`).
fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

// ============================================================================
// SECTION: Tests
// ============================================================================
