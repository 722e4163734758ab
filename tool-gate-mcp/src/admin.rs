// tool-gate-mcp/src/admin.rs
// ============================================================================
// Module: Operator Surface
// Description: Admin REST, policy simulator/diff/apply, callback, telemetry.
// Purpose: Expose governance operations with role-gated, audited endpoints.
// Dependencies: axum, tool-gate-core
// ============================================================================

//! ## Overview
//! Everything the operator touches over HTTP lives here: tenant quotas and
//! rate limits, RBAC assignments, the policy simulator (trace returned
//! verbatim, no side effects), structural diff, signed apply with staged
//! rollout, rollback, audit export, the signed approval callback, and the
//! health/metrics probes. Mutating endpoints require `admin`; read and
//! simulate endpoints accept `viewer`, `approver`, or `admin`. Every
//! governance mutation appends to the audit chain.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::routing::put;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use crate::gateway::McpGateway;
use crate::identity::Principal;
use crate::identity::Role;
use crate::metrics;
use tool_gate_core::ApplyStrategy;
use tool_gate_core::BundleStoreError;
use tool_gate_core::BundleVersion;
use tool_gate_core::CompiledBundle;
use tool_gate_core::SignatureFile;
use tool_gate_core::SubjectId;
use tool_gate_core::TenantId;
use tool_gate_core::Timestamp;
use tool_gate_core::ToolCall;
use tool_gate_core::core::BudgetPeriod;
use tool_gate_core::evaluate;
use tool_gate_core::policy::compare;
use tool_gate_core::runtime::ApprovalStatus;
use tool_gate_core::runtime::AuditDraft;
use tool_gate_core::runtime::BudgetSpec;

// ============================================================================
// SECTION: Error Reply
// ============================================================================

/// REST error carrying a status and a stable error label.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status.
    status: StatusCode,
    /// Machine-readable error label.
    error: &'static str,
    /// Human-readable detail.
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            error,
            detail: detail.into(),
        }
    }

    fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", detail)
    }

    fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", detail)
    }

    fn bad_request(error: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, detail)
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }

    fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.error, "detail": self.detail});
        (self.status, Json(body)).into_response()
    }
}

// ============================================================================
// SECTION: Router
// ============================================================================

/// Builds the operator router; merged into the main app router.
#[must_use]
pub fn router() -> Router<Arc<McpGateway>> {
    Router::new()
        .route("/admin/tenants/:tenant/rate-limit", put(put_rate_limit))
        .route("/admin/tenants/:tenant/quota", put(put_quota))
        .route("/admin/rbac/:tenant/users/:subject", put(put_roles).get(get_roles))
        .route("/v1/policy/simulate", post(policy_simulate))
        .route("/v1/policy/diff", post(policy_diff))
        .route("/v1/policy/apply", post(policy_apply))
        .route("/v1/policy/status", get(policy_status))
        .route("/v1/policy/rollback", post(policy_rollback))
        .route("/v1/audit", get(audit_export))
        .route("/approvals/callback", get(approval_callback))
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

// ============================================================================
// SECTION: Auth Helpers
// ============================================================================

/// Authenticates the bearer header into a principal.
async fn authenticate(gateway: &McpGateway, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let header =
        headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok()).map(str::to_string);
    gateway
        .identity
        .verify_bearer(header.as_deref())
        .await
        .map_err(|err| ApiError::unauthorized(err.to_string()))
}

/// Requires the admin role.
fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    if principal.has_role(Role::Admin) {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin role required"))
    }
}

/// Requires any of viewer, approver, or admin.
fn require_viewer(principal: &Principal) -> Result<(), ApiError> {
    if principal.has_role(Role::Viewer) || principal.has_role(Role::Approver) {
        Ok(())
    } else {
        Err(ApiError::forbidden("requires viewer, approver, or admin role"))
    }
}

/// Appends a governance audit entry; failures are surfaced to the caller.
fn audit_governance(gateway: &McpGateway, draft: AuditDraft) -> Result<(), ApiError> {
    gateway.audit.append(draft).map(|_| ()).map_err(|err| ApiError::unavailable(err.to_string()))
}

// ============================================================================
// SECTION: Tenant Quotas
// ============================================================================

/// Body of the rate-limit endpoint.
#[derive(Debug, Deserialize)]
struct RateLimitBody {
    /// Admission rate in queries per second.
    qps: f64,
}

/// PUT /admin/tenants/{t}/rate-limit
async fn put_rate_limit(
    State(gateway): State<Arc<McpGateway>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RateLimitBody>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_admin(&principal)?;
    if !(0.0..=100_000.0).contains(&body.qps) {
        return Err(ApiError::bad_request("invalid_qps", "qps must be in 0..=100000"));
    }
    let tenant = TenantId::new(tenant);
    gateway
        .quotas
        .set_rate_limit(&tenant, body.qps)
        .await
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    audit_governance(
        &gateway,
        AuditDraft::new(tenant.clone(), principal.subject.clone(), "rate_limit_changed")
            .with_meta(json!({"qps": body.qps})),
    )?;
    Ok(Json(json!({"ok": true, "tenant": tenant, "qps": body.qps})))
}

/// Body of the quota endpoint.
#[derive(Debug, Deserialize)]
struct QuotaBody {
    /// Budget name.
    name: String,
    /// Accounting period.
    period: BudgetPeriod,
    /// Spend ceiling in USD.
    limit: f64,
}

/// PUT /admin/tenants/{t}/quota
async fn put_quota(
    State(gateway): State<Arc<McpGateway>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(body): Json<QuotaBody>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_admin(&principal)?;
    if body.limit < 0.0 || body.name.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_quota", "name and non-negative limit required"));
    }
    let tenant = TenantId::new(tenant);
    gateway
        .quotas
        .set_budget(
            &tenant,
            &body.name,
            BudgetSpec {
                period: body.period,
                limit_usd: body.limit,
            },
        )
        .await
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    audit_governance(
        &gateway,
        AuditDraft::new(tenant.clone(), principal.subject.clone(), "quota_changed")
            .with_meta(json!({"name": body.name, "period": body.period, "limit": body.limit})),
    )?;
    Ok(Json(json!({
        "ok": true,
        "tenant": tenant,
        "quota": body.name,
        "period": body.period,
        "limit": body.limit,
    })))
}

// ============================================================================
// SECTION: RBAC
// ============================================================================

/// Body of the role-assignment endpoint.
#[derive(Debug, Deserialize)]
struct RolesBody {
    /// Role labels; unknown labels are rejected.
    roles: Vec<String>,
}

/// PUT /admin/rbac/{tenant}/users/{subject}
async fn put_roles(
    State(gateway): State<Arc<McpGateway>>,
    Path((tenant, subject)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<RolesBody>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_admin(&principal)?;
    let mut roles = BTreeSet::new();
    for label in &body.roles {
        let role = Role::parse(label)
            .ok_or_else(|| ApiError::bad_request("unknown_role", format!("role '{label}'")))?;
        roles.insert(role);
    }
    let tenant = TenantId::new(tenant);
    let subject = SubjectId::new(subject);
    gateway
        .rbac
        .set_roles(&tenant, &subject, &roles)
        .await
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    audit_governance(
        &gateway,
        AuditDraft::new(tenant.clone(), principal.subject.clone(), "rbac_changed")
            .with_meta(json!({"subject": subject, "roles": body.roles})),
    )?;
    Ok(Json(json!({"ok": true, "tenant": tenant, "subject": subject, "roles": body.roles})))
}

/// GET /admin/rbac/{tenant}/users/{subject}
async fn get_roles(
    State(gateway): State<Arc<McpGateway>>,
    Path((tenant, subject)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_admin(&principal)?;
    let tenant = TenantId::new(tenant);
    let subject = SubjectId::new(subject);
    let roles = gateway
        .rbac
        .get_roles(&tenant, &subject)
        .await
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    let labels: Vec<&str> = roles.iter().map(|role| role.as_str()).collect();
    Ok(Json(json!({"tenant": tenant, "subject": subject, "roles": labels})))
}

// ============================================================================
// SECTION: Policy Simulator & Diff
// ============================================================================

/// Body of the simulator endpoint.
#[derive(Debug, Deserialize)]
struct SimulateBody {
    /// Tool name to evaluate.
    tool: String,
    /// Tool arguments.
    #[serde(default)]
    arguments: Value,
    /// Inline bundle to evaluate instead of the tenant's active bundle.
    bundle_yaml: Option<String>,
}

/// POST /v1/policy/simulate — no side effects, trace returned verbatim.
async fn policy_simulate(
    State(gateway): State<Arc<McpGateway>>,
    headers: HeaderMap,
    Json(body): Json<SimulateBody>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_viewer(&principal)?;
    let bundle = match &body.bundle_yaml {
        Some(yaml) => Arc::new(
            CompiledBundle::compile(yaml.as_bytes(), None)
                .map_err(|err| ApiError::bad_request("policy_invalid", err.to_string()))?,
        ),
        None => gateway
            .bundles
            .snapshot_for(&principal.tenant)
            .map_err(|err| ApiError::unavailable(err.to_string()))?,
    };
    let call = ToolCall::new(
        principal.tenant.clone(),
        principal.subject.clone(),
        body.tool,
        body.arguments,
        "simulate",
    );
    let decision = evaluate(&call, &bundle);
    let value = serde_json::to_value(&decision)
        .map_err(|err| ApiError::bad_request("serialization", err.to_string()))?;
    Ok(Json(value))
}

/// Body of the diff endpoint.
#[derive(Debug, Deserialize)]
struct DiffBody {
    /// Current bundle YAML; defaults to the tenant's active bundle.
    current: Option<String>,
    /// Proposed bundle YAML.
    proposed: String,
}

/// POST /v1/policy/diff
async fn policy_diff(
    State(gateway): State<Arc<McpGateway>>,
    headers: HeaderMap,
    Json(body): Json<DiffBody>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_viewer(&principal)?;
    let current = match body.current {
        Some(current) => current,
        None => gateway
            .bundles
            .snapshot_for(&principal.tenant)
            .map_err(|err| ApiError::unavailable(err.to_string()))?
            .source_yaml
            .clone(),
    };
    let diff = compare(&current, &body.proposed)
        .map_err(|err| ApiError::bad_request("policy_invalid", err.to_string()))?;
    let value = serde_json::to_value(&diff)
        .map_err(|err| ApiError::bad_request("serialization", err.to_string()))?;
    Ok(Json(value))
}

// ============================================================================
// SECTION: Policy Apply & Rollout
// ============================================================================

/// Body of the apply endpoint.
#[derive(Debug, Deserialize)]
struct ApplyBody {
    /// Proposed bundle YAML.
    bundle_yaml: String,
    /// Companion signature document.
    signature: Option<SignatureFile>,
    /// Rollout strategy: `active`, `canary_percent`, or `explicit`.
    strategy: String,
    /// Canary percentage for `canary_percent`.
    canary_percent: Option<u8>,
    /// Tenants pinned by `explicit`.
    #[serde(default)]
    tenants: Vec<String>,
}

/// POST /v1/policy/apply
async fn policy_apply(
    State(gateway): State<Arc<McpGateway>>,
    headers: HeaderMap,
    Json(body): Json<ApplyBody>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_admin(&principal)?;
    let strategy = match body.strategy.as_str() {
        "active" => ApplyStrategy::Active,
        "canary_percent" => ApplyStrategy::CanaryPercent(body.canary_percent.unwrap_or(0)),
        "explicit" => {
            ApplyStrategy::Explicit(body.tenants.iter().map(|t| TenantId::new(t.clone())).collect())
        }
        other => {
            return Err(ApiError::bad_request("invalid_strategy", format!("strategy '{other}'")));
        }
    };
    match gateway.bundles.apply(body.bundle_yaml.as_bytes(), body.signature.as_ref(), strategy) {
        Ok(outcome) => {
            audit_governance(
                &gateway,
                AuditDraft::new(principal.tenant.clone(), principal.subject.clone(), "bundle_applied")
                    .with_meta(json!({
                        "version": outcome.version,
                        "sha256": outcome.sha256,
                        "strategy": outcome.strategy,
                    })),
            )?;
            Ok(Json(json!({
                "ok": true,
                "version": outcome.version,
                "sha256": outcome.sha256,
                "strategy": outcome.strategy,
            })))
        }
        Err(err) => {
            let reason = apply_failure_reason(&err);
            audit_governance(
                &gateway,
                AuditDraft::new(
                    principal.tenant.clone(),
                    principal.subject.clone(),
                    "bundle_apply_failed",
                )
                .with_meta(json!({"reason": reason, "detail": err.to_string()})),
            )?;
            Err(match err {
                BundleStoreError::Signature(_) | BundleStoreError::MissingSignature => {
                    ApiError::bad_request("signature_invalid", err.to_string())
                }
                BundleStoreError::VersionConflict(_) => {
                    ApiError::new(StatusCode::CONFLICT, "version_conflict", err.to_string())
                }
                BundleStoreError::Io(_) | BundleStoreError::LockPoisoned => {
                    ApiError::unavailable(err.to_string())
                }
                _ => ApiError::bad_request("policy_invalid", err.to_string()),
            })
        }
    }
}

/// Stable failure label for apply audit entries.
fn apply_failure_reason(err: &BundleStoreError) -> &'static str {
    match err {
        BundleStoreError::Signature(_) | BundleStoreError::MissingSignature => "signature_invalid",
        BundleStoreError::VersionConflict(_) => "version_conflict",
        BundleStoreError::Io(_) | BundleStoreError::LockPoisoned => "store_unavailable",
        _ => "policy_invalid",
    }
}

/// GET /v1/policy/status
async fn policy_status(
    State(gateway): State<Arc<McpGateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_viewer(&principal)?;
    let status =
        gateway.bundles.status().map_err(|err| ApiError::unavailable(err.to_string()))?;
    let value = serde_json::to_value(&status)
        .map_err(|err| ApiError::bad_request("serialization", err.to_string()))?;
    Ok(Json(value))
}

/// Body of the rollback endpoint.
#[derive(Debug, Deserialize)]
struct RollbackBody {
    /// Previously registered version to restore.
    to_version: String,
}

/// POST /v1/policy/rollback
async fn policy_rollback(
    State(gateway): State<Arc<McpGateway>>,
    headers: HeaderMap,
    Json(body): Json<RollbackBody>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_admin(&principal)?;
    let version = BundleVersion::new(body.to_version);
    gateway.bundles.rollback(&version).map_err(|err| match err {
        BundleStoreError::UnknownVersion(_) => ApiError::not_found(err.to_string()),
        _ => ApiError::unavailable(err.to_string()),
    })?;
    audit_governance(
        &gateway,
        AuditDraft::new(principal.tenant.clone(), principal.subject.clone(), "bundle_applied")
            .with_meta(json!({"version": version, "strategy": "rollback"})),
    )?;
    Ok(Json(json!({"ok": true, "active_version": version})))
}

// ============================================================================
// SECTION: Audit Export
// ============================================================================

/// Query parameters of the audit export endpoint.
#[derive(Debug, Deserialize)]
struct AuditQuery {
    /// Range start, epoch seconds; defaults to 0.
    frm: Option<i64>,
    /// Range end, epoch seconds; defaults to now.
    to: Option<i64>,
}

/// GET /v1/audit?frm=&to= — entries in chain order.
async fn audit_export(
    State(gateway): State<Arc<McpGateway>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    let principal = authenticate(&gateway, &headers).await?;
    require_viewer(&principal)?;
    let frm = Timestamp::from_secs(query.frm.unwrap_or(0));
    let to = query.to.map_or_else(|| gateway.clock.now(), Timestamp::from_secs);
    let entries =
        gateway.audit.export(frm, to).map_err(|err| ApiError::unavailable(err.to_string()))?;
    let value = serde_json::to_value(&entries)
        .map_err(|err| ApiError::bad_request("serialization", err.to_string()))?;
    Ok(Json(value))
}

// ============================================================================
// SECTION: Approval Callback
// ============================================================================

/// Query parameters of the callback endpoint.
#[derive(Debug, Deserialize)]
struct CallbackQuery {
    /// Signed callback token.
    t: String,
}

/// GET /approvals/callback?t=<signed token>
///
/// The token authorizes one `(pending_id, approver, action)` tuple; the
/// bearer identity must match the approver the link was minted for, hold the
/// `approver` role, and belong to the record's approver group. Re-posting a
/// settled decision is a no-op.
async fn approval_callback(
    State(gateway): State<Arc<McpGateway>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(signer) = &gateway.callback else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "callback_disabled",
            "no callback signing secret configured",
        ));
    };
    let claims = signer
        .verify(&query.t, gateway.clock.now())
        .map_err(|err| ApiError::unauthorized(err.to_string()))?;
    let principal = authenticate(&gateway, &headers).await?;
    if principal.subject != claims.approver_id {
        return Err(ApiError::forbidden("token was minted for a different approver"));
    }

    let before = gateway
        .approvals
        .get(&claims.pending_id)
        .await
        .map_err(|err| ApiError::unavailable(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("pending approval not found or expired"))?;

    let roles = gateway
        .rbac
        .effective_roles(&before.tenant, &principal.subject, &principal.roles)
        .await
        .map_err(|err| ApiError::unavailable(err.to_string()))?;
    if !roles.contains(&Role::Approver) && !roles.contains(&Role::Admin) {
        return Err(ApiError::forbidden("approver role required"));
    }
    if !gateway
        .approver_groups
        .is_member(before.approver_group.as_deref(), &principal.subject)
    {
        return Err(ApiError::forbidden("not a member of the approver group"));
    }

    // Idempotency: a repeated post of the same decision changes nothing and
    // appends nothing.
    let repeated = before.status.is_terminal()
        || before
            .decisions
            .get(&claims.approver_id)
            .is_some_and(|existing| existing.action == claims.action);
    let after = gateway
        .approvals
        .record_decision(&claims.pending_id, &claims.approver_id, claims.action)
        .await
        .map_err(|err| ApiError::unavailable(err.to_string()))?;

    if !repeated {
        audit_governance(
            &gateway,
            AuditDraft::new(after.tenant.clone(), after.requester.clone(), "approval_decision")
                .with_tool(after.tool.clone())
                .with_approver(claims.approver_id.clone())
                .with_meta(json!({
                    "pending_id": claims.pending_id,
                    "action": claims.action.as_str(),
                    "status": after.status.as_str(),
                })),
        )?;
        if before.status == ApprovalStatus::Pending && after.status.is_terminal() {
            audit_governance(
                &gateway,
                AuditDraft::new(after.tenant.clone(), after.requester.clone(), "approval_resolved")
                    .with_tool(after.tool.clone())
                    .with_approver(claims.approver_id.clone())
                    .with_meta(json!({
                        "pending_id": claims.pending_id,
                        "status": after.status.as_str(),
                        "decisions": after.decisions.len(),
                    })),
            )?;
        }
    }

    Ok(Json(json!({
        "ok": true,
        "pending_id": claims.pending_id,
        "decision": claims.action.as_str(),
        "status": after.status.as_str(),
    })))
}

// ============================================================================
// SECTION: Telemetry Endpoints
// ============================================================================

/// GET /metrics — Prometheus text.
async fn metrics_endpoint() -> impl IntoResponse {
    metrics::record_http_request("GET", "/metrics", 200);
    ([("content-type", "text/plain; version=0.0.4")], metrics::render())
}

/// GET /healthz — liveness.
async fn healthz(State(gateway): State<Arc<McpGateway>>) -> Json<Value> {
    Json(json!({"status": "healthy", "timestamp": gateway.clock.now().as_secs()}))
}

/// GET /readyz — readiness: the bundle store must be serving.
async fn readyz(State(gateway): State<Arc<McpGateway>>) -> Result<Json<Value>, ApiError> {
    gateway.bundles.status().map_err(|err| ApiError::unavailable(err.to_string()))?;
    Ok(Json(json!({"status": "ready", "timestamp": gateway.clock.now().as_secs()})))
}
