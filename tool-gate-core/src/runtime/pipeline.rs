// tool-gate-core/src/runtime/pipeline.rs
// ============================================================================
// Module: Decision Pipeline
// Description: End-to-end orchestration of one tool-call decision.
// Purpose: Compose rate admission, policy, budgets, approvals, and audit.
// Dependencies: crate::{policy, runtime, coordinator}
// ============================================================================

//! ## Overview
//! The pipeline is the single canonical execution path for a tool call: admit
//! against the tenant's token bucket, select the tenant's bundle, evaluate
//! policy, then branch. Allows debit the declared cost atomically; denies
//! reply immediately; approvals create a durable pending record and
//! optionally wait a bounded window for resolution. Every outcome appends an
//! audit entry before the reply is returned, and an audit failure fails the
//! request closed. Coordinating-store failures surface as a `deny` with
//! reason `store_unavailable`, preserving fail-closed semantics.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use crate::core::Clock;
use crate::core::PendingId;
use crate::core::RuleName;
use crate::core::ToolCall;
use crate::core::ToolName;
use crate::policy::evaluate::Decision;
use crate::policy::evaluate::DecisionOutcome;
use crate::policy::evaluate::evaluate;
use crate::policy::store::BundleStore;
use crate::runtime::approvals::ApprovalStatus;
use crate::runtime::approvals::ApprovalStore;
use crate::runtime::approvals::PendingApproval;
use crate::runtime::audit::AuditDraft;
use crate::runtime::audit::AuditError;
use crate::runtime::audit::AuditLog;
use crate::runtime::ledger::BudgetLedger;
use crate::runtime::ledger::DEFAULT_CAPACITY_QPS;
use crate::runtime::ledger::DebitOutcome;
use crate::runtime::ledger::DebitReceipt;
use crate::runtime::ledger::QuotaRegistry;
use crate::runtime::ledger::RateDecision;
use crate::runtime::ledger::RateLimiter;
use crate::runtime::ledger::TenantQuotas;

// ============================================================================
// SECTION: Reply & Errors
// ============================================================================

/// Reasons carried by deny replies.
pub mod deny_reason {
    /// Admission refused by the token bucket.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// Atomic budget debit refused.
    pub const BUDGET_EXCEEDED: &str = "budget_exceeded";
    /// Coordinating store unreachable; fail closed.
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
    /// An approver denied the call.
    pub const DENIED_BY_APPROVER: &str = "denied_by_approver";
    /// The approval expired before resolution.
    pub const APPROVAL_EXPIRED: &str = "approval_expired";
}

/// Outcome of deciding one tool call.
#[derive(Debug, Clone)]
pub enum GateReply {
    /// The call is admitted; the caller may execute the tool.
    Allow {
        /// Winning rule, if a rule (rather than an approval) decided.
        rule: Option<RuleName>,
        /// Audit entry id for the decision.
        audit_id: u64,
    },
    /// The call is rejected.
    Deny {
        /// Machine-readable reason.
        reason: String,
        /// Winning rule, when policy decided.
        rule: Option<RuleName>,
        /// Audit entry id for the decision.
        audit_id: u64,
    },
    /// The call is paused awaiting human approval.
    NeedsApproval {
        /// Pending approval record id.
        pending_id: PendingId,
        /// Audit entry id for the request.
        audit_id: u64,
    },
}

/// Pipeline failures that cannot be expressed as a deny reply.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The audit log refused an append; the request fails closed.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// QPS applied to tenants without an explicit rate quota.
    pub default_capacity_qps: f64,
    /// Bounded synchronous wait for approvals; zero disables the wait.
    pub sync_wait: Duration,
    /// TTL for created pending approvals, in seconds.
    pub approval_ttl_seconds: u64,
    /// Tools never gated for approval (an `approval` verdict admits them).
    pub approval_exempt_tools: BTreeSet<ToolName>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut approval_exempt_tools = BTreeSet::new();
        approval_exempt_tools.insert(ToolName::new("cloud.estimate"));
        Self {
            default_capacity_qps: DEFAULT_CAPACITY_QPS,
            sync_wait: Duration::ZERO,
            approval_ttl_seconds: crate::runtime::approvals::DEFAULT_APPROVAL_TTL_SECONDS,
            approval_exempt_tools,
        }
    }
}

// ============================================================================
// SECTION: Pipeline
// ============================================================================

/// The synchronous decision pipeline.
pub struct DecisionPipeline {
    /// Bundle store with rollout resolution.
    bundles: Arc<BundleStore>,
    /// Tenant quota registry.
    quotas: QuotaRegistry,
    /// Token-bucket admission.
    rate: RateLimiter,
    /// Atomic budget ledger.
    budget: BudgetLedger,
    /// Durable approval store.
    approvals: ApprovalStore,
    /// Hash-chained audit log.
    audit: Arc<dyn AuditLog>,
    /// Time source for created records.
    clock: Arc<dyn Clock>,
    /// Tuning knobs.
    config: PipelineConfig,
}

impl DecisionPipeline {
    /// Assembles a pipeline from its components.
    #[must_use]
    pub fn new(
        bundles: Arc<BundleStore>,
        quotas: QuotaRegistry,
        rate: RateLimiter,
        budget: BudgetLedger,
        approvals: ApprovalStore,
        audit: Arc<dyn AuditLog>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            bundles,
            quotas,
            rate,
            budget,
            approvals,
            audit,
            clock,
            config,
        }
    }

    /// Returns the approval store backing this pipeline.
    #[must_use]
    pub fn approvals(&self) -> &ApprovalStore {
        &self.approvals
    }

    /// Decides one tool call end to end.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Audit`] when the audit log refuses an append;
    /// all other failures are expressed as deny replies.
    pub async fn decide(&self, call: &ToolCall) -> Result<GateReply, PipelineError> {
        // Admission before policy evaluation.
        let quotas = match self.quotas.quotas_for(&call.tenant).await {
            Ok(quotas) => quotas,
            Err(err) => return self.deny_store_unavailable(call, "quota_read", &err.to_string()),
        };
        let qps = quotas.capacity_qps.unwrap_or(self.config.default_capacity_qps);
        match self.rate.admit(&call.tenant, qps).await {
            Ok(RateDecision::Admitted) => {}
            Ok(RateDecision::Limited { retry_after_ms }) => {
                let audit_id = self.append(
                    self.draft_for(call, "rate_limited")
                        .with_meta(json!({"retry_after_ms": retry_after_ms, "capacity_qps": qps})),
                )?;
                return Ok(GateReply::Deny {
                    reason: deny_reason::RATE_LIMITED.to_string(),
                    rule: None,
                    audit_id,
                });
            }
            Err(err) => {
                return self.deny_store_unavailable(call, "rate_admit", &err.to_string());
            }
        }

        // Bundle selection and pure evaluation.
        let bundle = match self.bundles.snapshot_for(&call.tenant) {
            Ok(bundle) => bundle,
            Err(err) => {
                return self.deny_store_unavailable(call, "bundle_select", &err.to_string());
            }
        };
        let decision = evaluate(call, &bundle);

        match decision.decision {
            DecisionOutcome::Allow => self.complete_allow(call, &quotas, decision.rule_name).await,
            DecisionOutcome::Deny => {
                let reason = decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "blocked by policy".to_string());
                let audit_id = self.append(
                    self.draft_for(call, "deny")
                        .with_rule(decision.rule_name.clone())
                        .with_meta(json!({"reason": reason})),
                )?;
                Ok(GateReply::Deny {
                    reason,
                    rule: decision.rule_name,
                    audit_id,
                })
            }
            DecisionOutcome::Approval => {
                if self.config.approval_exempt_tools.contains(&call.tool) {
                    // The price estimator and friends are never paused; an
                    // approval verdict admits them directly.
                    return self.complete_allow(call, &quotas, decision.rule_name).await;
                }
                self.run_approval(call, &quotas, &decision).await
            }
        }
    }

    /// Allow path: debit declared cost, audit, reply.
    async fn complete_allow(
        &self,
        call: &ToolCall,
        quotas: &TenantQuotas,
        rule: Option<RuleName>,
    ) -> Result<GateReply, PipelineError> {
        let mut receipts: Vec<DebitReceipt> = Vec::new();
        if let Some(cost) = call.estimated_cost_usd() {
            match self.budget.debit(&call.tenant, quotas, cost).await {
                Ok(DebitOutcome::Applied { receipts: applied }) => receipts = applied,
                Ok(DebitOutcome::Exceeded { budget }) => {
                    let audit_id = self.append(
                        self.draft_for(call, "budget_exceeded")
                            .with_rule(rule.clone())
                            .with_meta(json!({"budget": budget, "attempted_usd": cost})),
                    )?;
                    return Ok(GateReply::Deny {
                        reason: deny_reason::BUDGET_EXCEEDED.to_string(),
                        rule,
                        audit_id,
                    });
                }
                Err(err) => {
                    return self.deny_store_unavailable(call, "budget_debit", &err.to_string());
                }
            }
        }
        let draft = self
            .draft_for(call, "allow")
            .with_rule(rule.clone())
            .with_meta(json!({"debited_usd": call.estimated_cost_usd()}));
        match self.append(draft) {
            Ok(audit_id) => Ok(GateReply::Allow { rule, audit_id }),
            Err(err) => {
                // The decision cannot be recorded, so the spend must not stand.
                self.budget.refund(&receipts).await;
                Err(err)
            }
        }
    }

    /// Approval path: create the pending record, audit, optionally wait.
    async fn run_approval(
        &self,
        call: &ToolCall,
        quotas: &TenantQuotas,
        decision: &Decision,
    ) -> Result<GateReply, PipelineError> {
        let record = self.pending_record(call, decision);
        let pending = match self.approvals.create(record).await {
            Ok(pending) => pending,
            Err(err) => {
                return self.deny_store_unavailable(call, "approval_create", &err.to_string());
            }
        };
        let audit_id = self.append(
            self.draft_for(call, "approval_requested")
                .with_rule(decision.rule_name.clone())
                .with_meta(json!({
                    "pending_id": pending.pending_id,
                    "required_approvals": pending.required_approvals,
                    "approver_group": pending.approver_group,
                    "ttl_seconds": pending.ttl_seconds,
                })),
        )?;

        if self.config.sync_wait.is_zero() {
            return Ok(GateReply::NeedsApproval {
                pending_id: pending.pending_id,
                audit_id,
            });
        }

        let resolved = self
            .approvals
            .wait_for_resolution(&pending.pending_id, self.config.sync_wait)
            .await;
        match resolved {
            Ok(ApprovalStatus::Allow) => {
                self.complete_allow(call, quotas, decision.rule_name.clone()).await
            }
            Ok(ApprovalStatus::Deny) => {
                let audit_id = self.append(
                    self.draft_for(call, "deny")
                        .with_rule(decision.rule_name.clone())
                        .with_meta(json!({
                            "reason": deny_reason::DENIED_BY_APPROVER,
                            "pending_id": pending.pending_id,
                        })),
                )?;
                Ok(GateReply::Deny {
                    reason: deny_reason::DENIED_BY_APPROVER.to_string(),
                    rule: decision.rule_name.clone(),
                    audit_id,
                })
            }
            Ok(ApprovalStatus::Expired) => {
                let audit_id = self.append(
                    self.draft_for(call, "deny")
                        .with_rule(decision.rule_name.clone())
                        .with_meta(json!({
                            "reason": deny_reason::APPROVAL_EXPIRED,
                            "pending_id": pending.pending_id,
                        })),
                )?;
                Ok(GateReply::Deny {
                    reason: deny_reason::APPROVAL_EXPIRED.to_string(),
                    rule: decision.rule_name.clone(),
                    audit_id,
                })
            }
            // Still pending after the window, or the store dropped the wait:
            // the approval persists and can resolve later.
            Ok(ApprovalStatus::Pending) | Err(_) => Ok(GateReply::NeedsApproval {
                pending_id: pending.pending_id,
                audit_id,
            }),
        }
    }

    /// Builds the pending record for an approval verdict.
    fn pending_record(&self, call: &ToolCall, decision: &Decision) -> PendingApproval {
        let mut summary =
            format!("[{}] {} requested by {}", call.tenant, call.tool, call.subject);
        if decision.required_approvals > 1 {
            summary.push_str(&format!(" (needs {} approvals)", decision.required_approvals));
        }
        PendingApproval {
            pending_id: PendingId::generate(),
            tenant: call.tenant.clone(),
            requester: call.subject.clone(),
            tool: call.tool.clone(),
            arguments: call.arguments.clone(),
            summary,
            required_approvals: decision.required_approvals,
            approver_group: decision.approver_group.clone(),
            decisions: Default::default(),
            status: ApprovalStatus::Pending,
            created_ts: self.clock.now(),
            ttl_seconds: self.config.approval_ttl_seconds,
            estimated_cost_usd: call.estimated_cost_usd(),
        }
    }

    /// Fail-closed deny for coordinating-store trouble.
    fn deny_store_unavailable(
        &self,
        call: &ToolCall,
        stage: &str,
        detail: &str,
    ) -> Result<GateReply, PipelineError> {
        let audit_id = self.append(
            self.draft_for(call, "deny").with_meta(json!({
                "reason": deny_reason::STORE_UNAVAILABLE,
                "stage": stage,
                "detail": detail,
            })),
        )?;
        Ok(GateReply::Deny {
            reason: deny_reason::STORE_UNAVAILABLE.to_string(),
            rule: None,
            audit_id,
        })
    }

    /// Base audit draft for a call.
    fn draft_for(&self, call: &ToolCall, event: &str) -> AuditDraft {
        AuditDraft::new(call.tenant.clone(), call.subject.clone(), event)
            .with_tool(call.tool.clone())
            .with_args_digest(call.args_digest())
            .with_request_id(call.request_id.clone())
    }

    /// Appends a draft, returning the entry id.
    fn append(&self, draft: AuditDraft) -> Result<u64, PipelineError> {
        Ok(self.audit.append(draft)?.record.id)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests;
