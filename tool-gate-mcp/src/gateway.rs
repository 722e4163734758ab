// tool-gate-mcp/src/gateway.rs
// ============================================================================
// Module: Gateway Assembly
// Description: Wires configuration into the decision pipeline and stores.
// Purpose: One construction path shared by the HTTP server, stdio, and tests.
// Dependencies: tool-gate-core, tool-gate-config
// ============================================================================

//! ## Overview
//! [`McpGateway`] owns every runtime component: the bundle store bootstrapped
//! from the configured policy file (or a fail-closed builtin), the
//! coordinating store, ledgers, approval store, audit log, identity verifier,
//! RBAC, tool registry, and the pipeline composed from them. Transports and
//! operator endpoints borrow the pieces they need. Construction validates
//! fail-closed: a signature requirement that cannot be satisfied refuses to
//! start the process.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::callback::CallbackSigner;
use crate::identity::IdentityVerifier;
use crate::rbac::ApproverDirectory;
use crate::rbac::RbacStore;
use crate::tools::ToolRegistry;
use tool_gate_config::ToolGateConfig;
use tool_gate_core::BundleStore;
use tool_gate_core::BundleStoreConfig;
use tool_gate_core::BundleStoreError;
use tool_gate_core::Clock;
use tool_gate_core::Coordinator;
use tool_gate_core::InMemoryCoordinator;
use tool_gate_core::SignatureFile;
use tool_gate_core::SystemClock;
use tool_gate_core::ToolName;
use tool_gate_core::policy::SignatureError;
use tool_gate_core::runtime::ApprovalStore;
use tool_gate_core::runtime::AuditLog;
use tool_gate_core::runtime::BudgetLedger;
use tool_gate_core::runtime::DecisionPipeline;
use tool_gate_core::runtime::FileAuditLog;
use tool_gate_core::runtime::InMemoryAuditLog;
use tool_gate_core::runtime::PipelineConfig;
use tool_gate_core::runtime::QuotaRegistry;
use tool_gate_core::runtime::RateLimiter;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Fail-closed bundle used when no policy file is configured.
const BUILTIN_BUNDLE: &str = r#"version: builtin
defaults:
  decision: deny
rules:
  - name: Estimator passthrough
    match: cloud.estimate
    action: allow
"#;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Gateway construction failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration value unusable at wiring time.
    #[error("gateway config error: {0}")]
    Config(String),
    /// Policy or signature file unreadable.
    #[error("gateway io error: {0}")]
    Io(String),
    /// Bundle rejected at bootstrap.
    #[error(transparent)]
    Bundle(#[from] BundleStoreError),
    /// Signature document malformed.
    #[error(transparent)]
    Signature(#[from] SignatureError),
    /// Audit log could not be opened.
    #[error(transparent)]
    Audit(#[from] tool_gate_core::runtime::AuditError),
}

// ============================================================================
// SECTION: Gateway
// ============================================================================

/// Fully wired gateway shared by all transports.
pub struct McpGateway {
    /// Loaded configuration.
    pub config: ToolGateConfig,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Bundle store with rollout state.
    pub bundles: Arc<BundleStore>,
    /// Tenant quota registry.
    pub quotas: QuotaRegistry,
    /// Budget ledger (admin reads of spend).
    pub budget: BudgetLedger,
    /// Durable approval store.
    pub approvals: ApprovalStore,
    /// Hash-chained audit log.
    pub audit: Arc<dyn AuditLog>,
    /// The decision pipeline.
    pub pipeline: DecisionPipeline,
    /// Bearer token verifier.
    pub identity: IdentityVerifier,
    /// Role assignments.
    pub rbac: RbacStore,
    /// Approver group membership.
    pub approver_groups: ApproverDirectory,
    /// Built-in tool surface.
    pub tools: ToolRegistry,
    /// Callback token signer, when a secret is configured.
    pub callback: Option<CallbackSigner>,
}

impl std::fmt::Debug for McpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpGateway").finish_non_exhaustive()
    }
}

impl McpGateway {
    /// Builds a gateway on the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when wiring fails.
    pub fn from_config(config: ToolGateConfig) -> Result<Self, GatewayError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a gateway with an injected clock (tests drive a manual one).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] when wiring fails.
    pub fn with_clock(
        config: ToolGateConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GatewayError> {
        let coordinator = build_coordinator(&config, clock.clone())?;
        let audit: Arc<dyn AuditLog> =
            Arc::new(crate::metrics::MeteredAuditLog::new(build_audit(&config, clock.clone())?));
        let bundles = Arc::new(build_bundle_store(&config, clock.clone())?);

        let quotas = QuotaRegistry::new(coordinator.clone());
        let rate = RateLimiter::new(coordinator.clone(), clock.clone());
        let budget = BudgetLedger::new(coordinator.clone(), clock.clone());
        let approvals = ApprovalStore::new(coordinator.clone(), clock.clone());

        let mut approval_exempt_tools = BTreeSet::new();
        approval_exempt_tools.insert(ToolName::new("cloud.estimate"));
        let pipeline = DecisionPipeline::new(
            bundles.clone(),
            quotas.clone(),
            rate,
            budget.clone(),
            approvals.clone(),
            audit.clone(),
            clock.clone(),
            PipelineConfig {
                default_capacity_qps: config.limits.default_qps,
                sync_wait: Duration::from_millis(config.approvals.sync_wait_ms),
                approval_ttl_seconds: config.approvals.ttl_seconds,
                approval_exempt_tools,
            },
        );

        let identity = IdentityVerifier::new(config.identity.clone());
        let rbac = RbacStore::new(coordinator);
        let approver_groups = ApproverDirectory::from_config(&config.approvals.groups);
        let callback =
            config.callback.signing_secret.as_deref().map(CallbackSigner::new);

        Ok(Self {
            config,
            clock,
            bundles,
            quotas,
            budget,
            approvals,
            audit,
            pipeline,
            identity,
            rbac,
            approver_groups,
            tools: ToolRegistry::new(),
            callback,
        })
    }
}

// ============================================================================
// SECTION: Component Builders
// ============================================================================

/// Builds the coordinating store from its URL.
fn build_coordinator(
    config: &ToolGateConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Coordinator>, GatewayError> {
    match config.coordinator.url.as_str() {
        "memory:" => Ok(Arc::new(InMemoryCoordinator::new(clock))),
        other => Err(GatewayError::Config(format!(
            "coordinator url '{other}' has no built-in backend; implement the Coordinator trait \
             for it and register the scheme"
        ))),
    }
}

/// Builds the audit log from its URL.
fn build_audit(
    config: &ToolGateConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn AuditLog>, GatewayError> {
    if let Some(path) = config.audit.file_path() {
        return Ok(Arc::new(FileAuditLog::open(&path, clock)?));
    }
    Ok(Arc::new(InMemoryAuditLog::new(clock)))
}

/// Bootstraps the bundle store from the configured policy file.
fn build_bundle_store(
    config: &ToolGateConfig,
    clock: Arc<dyn Clock>,
) -> Result<BundleStore, GatewayError> {
    let store_config = BundleStoreConfig {
        public_key_b64: config.policy.public_key_b64.clone(),
        require_signature: config.policy.require_signature,
        versions_dir: config.policy.versions_dir.clone(),
        seed: config.policy.rollout_seed,
    };
    let bytes = match &config.policy.file {
        Some(path) => fs::read(path).map_err(|err| {
            GatewayError::Io(format!("policy file '{}': {err}", path.display()))
        })?,
        None => {
            if config.policy.require_signature {
                return Err(GatewayError::Config(
                    "policy.require_signature needs policy.file".to_string(),
                ));
            }
            BUILTIN_BUNDLE.as_bytes().to_vec()
        }
    };
    let signature = match &config.policy.sig_path {
        Some(path) => {
            let raw = fs::read(path).map_err(|err| {
                GatewayError::Io(format!("signature file '{}': {err}", path.display()))
            })?;
            Some(SignatureFile::parse(&raw)?)
        }
        None => None,
    };
    Ok(BundleStore::bootstrap(store_config, clock, &bytes, signature.as_ref())?)
}

// ============================================================================
// SECTION: Tests
// ============================================================================
