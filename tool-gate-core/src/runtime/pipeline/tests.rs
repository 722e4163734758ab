// tool-gate-core/src/runtime/pipeline/tests.rs
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions.")]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::DecisionPipeline;
use super::GateReply;
use super::PipelineConfig;
use super::deny_reason;
use crate::coordinator::InMemoryCoordinator;
use crate::core::Clock;
use crate::core::ManualClock;
use crate::core::SubjectId;
use crate::core::TenantId;
use crate::core::Timestamp;
use crate::core::ToolCall;
use crate::policy::store::BundleStore;
use crate::policy::store::BundleStoreConfig;
use crate::runtime::approvals::ApprovalAction;
use crate::runtime::approvals::ApprovalStore;
use crate::runtime::audit::AuditLog;
use crate::runtime::audit::GENESIS_HASH;
use crate::runtime::audit::InMemoryAuditLog;
use crate::runtime::audit::verify_chain;
use crate::runtime::ledger::BudgetLedger;
use crate::runtime::ledger::BudgetSpec;
use crate::runtime::ledger::QuotaRegistry;
use crate::runtime::ledger::RateLimiter;

const BUNDLE: &str = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: Allow intranet HTTP
    match: net.http
    where:
      host_in: ["intranet.api"]
    action: allow
  - name: High-cost cloud ops
    match: cloud.ops
    where:
      estimated_cost_usd_over: 10
    action: approval
  - name: Routine cloud ops
    match: cloud.ops
    action: allow
  - name: Estimator passthrough
    match: cloud.estimate
    action: approval
  - name: Dual-control write outside jail
    match: fs.write
    where:
      path_not_under: ["/sandbox/tmp"]
    action: approval
    required_approvals: 2
  - name: Block bulk mail
    match: mail.send
    action: deny
    reason: mail is disabled
"#;

struct Fixture {
    pipeline: DecisionPipeline,
    approvals: ApprovalStore,
    audit: Arc<InMemoryAuditLog>,
    quotas: QuotaRegistry,
    clock: Arc<ManualClock>,
}

fn fixture(config: PipelineConfig) -> Fixture {
    let clock = Arc::new(ManualClock::starting_at(Timestamp::from_secs(1_754_092_800)));
    let coordinator = Arc::new(InMemoryCoordinator::new(clock.clone()));
    let bundles = Arc::new(
        BundleStore::bootstrap(
            BundleStoreConfig::default(),
            clock.clone(),
            BUNDLE.as_bytes(),
            None,
        )
        .expect("bundle bootstrap"),
    );
    let quotas = QuotaRegistry::new(coordinator.clone());
    let approvals = ApprovalStore::new(coordinator.clone(), clock.clone());
    let audit = Arc::new(InMemoryAuditLog::new(clock.clone()));
    let pipeline = DecisionPipeline::new(
        bundles,
        quotas.clone(),
        RateLimiter::new(coordinator.clone(), clock.clone()),
        BudgetLedger::new(coordinator.clone(), clock.clone()),
        approvals.clone(),
        audit.clone(),
        clock.clone(),
        config,
    );
    Fixture {
        pipeline,
        approvals,
        audit,
        quotas,
        clock,
    }
}

fn call(tool: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall::new("acme", "agent-7", tool, arguments, "req-1")
}

#[tokio::test]
async fn allow_path_audits_and_replies() {
    let fx = fixture(PipelineConfig::default());
    let reply = fx
        .pipeline
        .decide(&call("net.http", json!({"method": "GET", "url": "https://intranet.api/status"})))
        .await
        .unwrap();
    let GateReply::Allow { rule, .. } = reply else {
        panic!("expected allow, got {reply:?}");
    };
    assert_eq!(rule.unwrap().as_str(), "Allow intranet HTTP");
    let entries = fx.audit.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record.event, "allow");
    verify_chain(GENESIS_HASH, &entries).unwrap();
}

#[tokio::test]
async fn deny_path_carries_rule_reason() {
    let fx = fixture(PipelineConfig::default());
    let reply = fx.pipeline.decide(&call("mail.send", json!({"to": "all@corp"}))).await.unwrap();
    let GateReply::Deny { reason, rule, .. } = reply else {
        panic!("expected deny, got {reply:?}");
    };
    assert_eq!(reason, "mail is disabled");
    assert_eq!(rule.unwrap().as_str(), "Block bulk mail");
}

#[tokio::test]
async fn unknown_tool_fails_closed() {
    let fx = fixture(PipelineConfig::default());
    let reply = fx.pipeline.decide(&call("shell.exec", json!({}))).await.unwrap();
    assert!(matches!(reply, GateReply::Deny { .. }), "expected deny, got {reply:?}");
}

#[tokio::test]
async fn rate_limit_denies_and_audits() {
    let fx = fixture(PipelineConfig::default());
    fx.quotas.set_rate_limit(&TenantId::new("acme"), 1.0).await.unwrap();
    let ok = fx.pipeline.decide(&call("cloud.ops", json!({"provider": "aws"}))).await.unwrap();
    assert!(matches!(ok, GateReply::Allow { .. }));
    let limited = fx.pipeline.decide(&call("cloud.ops", json!({"provider": "aws"}))).await.unwrap();
    let GateReply::Deny { reason, .. } = limited else {
        panic!("expected deny, got {limited:?}");
    };
    assert_eq!(reason, deny_reason::RATE_LIMITED);
    let events: Vec<String> =
        fx.audit.entries().unwrap().iter().map(|entry| entry.record.event.clone()).collect();
    assert_eq!(events, vec!["allow".to_string(), "rate_limited".to_string()]);
}

#[tokio::test]
async fn budget_exceeded_converts_allow_to_deny() {
    let fx = fixture(PipelineConfig::default());
    let tenant = TenantId::new("acme");
    fx.quotas
        .set_budget(
            &tenant,
            "cloud_usd",
            BudgetSpec {
                period: crate::core::BudgetPeriod::Day,
                limit_usd: 15.0,
            },
        )
        .await
        .unwrap();
    let first = fx
        .pipeline
        .decide(&call("cloud.ops", json!({"provider": "aws", "estimated_cost_usd": 9.0})))
        .await
        .unwrap();
    assert!(matches!(first, GateReply::Allow { .. }));
    let second = fx
        .pipeline
        .decide(&call("cloud.ops", json!({"provider": "aws", "estimated_cost_usd": 9.0})))
        .await
        .unwrap();
    let GateReply::Deny { reason, .. } = second else {
        panic!("expected deny, got {second:?}");
    };
    assert_eq!(reason, deny_reason::BUDGET_EXCEEDED);
    let events: Vec<String> =
        fx.audit.entries().unwrap().iter().map(|entry| entry.record.event.clone()).collect();
    assert_eq!(events, vec!["allow".to_string(), "budget_exceeded".to_string()]);
}

#[tokio::test]
async fn approval_without_wait_returns_pending() {
    let fx = fixture(PipelineConfig::default());
    let reply = fx
        .pipeline
        .decide(&call("fs.write", json!({"path": "/etc/hosts", "bytes": "aGk="})))
        .await
        .unwrap();
    let GateReply::NeedsApproval { pending_id, .. } = reply else {
        panic!("expected needs_approval, got {reply:?}");
    };
    let record = fx.approvals.get(&pending_id).await.unwrap().unwrap();
    assert_eq!(record.required_approvals, 2);
    assert_eq!(record.tenant, TenantId::new("acme"));
    let events: Vec<String> =
        fx.audit.entries().unwrap().iter().map(|entry| entry.record.event.clone()).collect();
    assert_eq!(events, vec!["approval_requested".to_string()]);
}

#[tokio::test]
async fn sync_wait_completes_as_allow_and_debits_budget() {
    let mut config = PipelineConfig::default();
    config.sync_wait = Duration::from_secs(20);
    let fx = fixture(config);
    let tenant = TenantId::new("acme");
    fx.quotas
        .set_budget(
            &tenant,
            "cloud_usd",
            BudgetSpec {
                period: crate::core::BudgetPeriod::Day,
                limit_usd: 15.0,
            },
        )
        .await
        .unwrap();

    let pipeline = Arc::new(fx.pipeline);
    let decide = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            pipeline
                .decide(&call(
                    "cloud.ops",
                    json!({"provider": "aws", "action": "run", "estimated_cost_usd": 12.0}),
                ))
                .await
        })
    };
    // Find the pending id from the audit trail, then approve.
    let pending_id = loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let entries = fx.audit.entries().unwrap();
        if let Some(entry) =
            entries.iter().find(|entry| entry.record.event == "approval_requested")
        {
            let id = entry.record.result_meta["pending_id"].as_str().unwrap().to_string();
            break crate::core::PendingId::new(id);
        }
    };
    fx.approvals
        .record_decision(&pending_id, &SubjectId::new("alice"), ApprovalAction::Approve)
        .await
        .unwrap();

    let reply = decide.await.unwrap().unwrap();
    assert!(matches!(reply, GateReply::Allow { .. }), "expected allow, got {reply:?}");

    // S4 second half: the 12.00 debit leaves no room for 9.00 more.
    let over = pipeline
        .decide(&call("cloud.ops", json!({"provider": "aws", "estimated_cost_usd": 9.0})))
        .await
        .unwrap();
    let GateReply::Deny { reason, .. } = over else {
        panic!("expected deny, got {over:?}");
    };
    assert_eq!(reason, deny_reason::BUDGET_EXCEEDED);
}

#[tokio::test]
async fn sync_wait_times_out_to_needs_approval() {
    let mut config = PipelineConfig::default();
    config.sync_wait = Duration::from_millis(30);
    let fx = fixture(config);
    let reply = fx
        .pipeline
        .decide(&call("fs.write", json!({"path": "/etc/hosts", "bytes": "aGk="})))
        .await
        .unwrap();
    assert!(matches!(reply, GateReply::NeedsApproval { .. }), "got {reply:?}");
}

#[tokio::test]
async fn sync_wait_denied_by_approver() {
    let mut config = PipelineConfig::default();
    config.sync_wait = Duration::from_secs(20);
    let fx = fixture(config);
    let pipeline = Arc::new(fx.pipeline);
    let decide = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            pipeline
                .decide(&call("fs.write", json!({"path": "/etc/hosts", "bytes": "aGk="})))
                .await
        })
    };
    let pending_id = loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let entries = fx.audit.entries().unwrap();
        if let Some(entry) =
            entries.iter().find(|entry| entry.record.event == "approval_requested")
        {
            break crate::core::PendingId::new(
                entry.record.result_meta["pending_id"].as_str().unwrap(),
            );
        }
    };
    fx.approvals
        .record_decision(&pending_id, &SubjectId::new("bob"), ApprovalAction::Deny)
        .await
        .unwrap();
    let reply = decide.await.unwrap().unwrap();
    let GateReply::Deny { reason, .. } = reply else {
        panic!("expected deny, got {reply:?}");
    };
    assert_eq!(reason, deny_reason::DENIED_BY_APPROVER);
}

#[tokio::test]
async fn estimator_is_never_paused() {
    let fx = fixture(PipelineConfig::default());
    // The bundle routes cloud.estimate to approval; the exemption admits it.
    let reply = fx
        .pipeline
        .decide(&call("cloud.estimate", json!({"provider": "aws", "action": "run", "units": 2})))
        .await
        .unwrap();
    assert!(matches!(reply, GateReply::Allow { .. }), "got {reply:?}");
}

#[tokio::test]
async fn audit_trail_stays_chained_across_outcomes() {
    let fx = fixture(PipelineConfig::default());
    let _ = fx
        .pipeline
        .decide(&call("net.http", json!({"url": "https://intranet.api/a"})))
        .await
        .unwrap();
    let _ = fx.pipeline.decide(&call("mail.send", json!({}))).await.unwrap();
    let _ = fx
        .pipeline
        .decide(&call("fs.write", json!({"path": "/etc/hosts", "bytes": ""})))
        .await
        .unwrap();
    let entries = fx.audit.entries().unwrap();
    assert_eq!(entries.len(), 3);
    verify_chain(GENESIS_HASH, &entries).unwrap();
    assert!(fx.clock.now() > Timestamp::from_millis(0));
}
