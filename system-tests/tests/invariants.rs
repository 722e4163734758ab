// system-tests/tests/invariants.rs
// ============================================================================
// Module: Concurrency Invariants
// Description: Safety properties exercised under parallel load.
// Purpose: Budget safety, rate bounds, idempotent callbacks, chain integrity.
// ============================================================================
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions.")]

mod common;

use serde_json::json;

use common::TestGate;
use tool_gate_core::BudgetPeriod;
use tool_gate_core::TenantId;
use tool_gate_core::runtime::ApprovalAction;
use tool_gate_core::runtime::verify_chain;
use tool_gate_mcp::Role;

const BUNDLE: &str = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: Cloud ops allowed
    match: cloud.ops
    action: allow
  - name: Writes need approval
    match: fs.write
    action: approval
    required_approvals: 2
    approver_group: sec-ops
  - name: Intranet allowed
    match: net.http
    where:
      host_in: ["intranet.api"]
    action: allow
"#;

/// Budget safety: concurrent debits never sum past the limit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_debits_respect_the_limit() {
    let gate = TestGate::start(BUNDLE, |config| {
        // Plenty of admission headroom so only the budget gates.
        config.limits.default_qps = 10_000.0;
    })
    .await;
    let admin = gate.token("acme", "root", &[Role::Admin]);
    gate.client
        .put(format!("{}/admin/tenants/acme/quota", gate.base_url))
        .bearer_auth(&admin)
        .json(&json!({"name": "cloud_usd", "period": "day", "limit": 10.0}))
        .send()
        .await
        .unwrap();

    let mut handles = Vec::new();
    for n in 0..24 {
        let gate_url = gate.base_url.clone();
        let client = gate.client.clone();
        let token = gate.token("acme", &format!("agent-{n}"), &[]);
        handles.push(tokio::spawn(async move {
            let body = json!({
                "jsonrpc": "2.0",
                "id": format!("debit-{n}"),
                "method": "tools/call",
                "params": {
                    "name": "cloud.ops",
                    "arguments": {
                        "provider": "aws",
                        "resource": "ec2",
                        "action": "run_instances",
                        "estimated_cost_usd": 3.0,
                    },
                },
            });
            let response = client
                .post(format!("{gate_url}/mcp"))
                .bearer_auth(token)
                .json(&body)
                .send()
                .await
                .unwrap();
            let envelope: serde_json::Value = response.json().await.unwrap();
            envelope["result"]["isError"] == json!(false)
        }));
    }
    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert!(allowed <= 3, "{allowed} debits of 3.00 admitted against a 10.00 limit");
    let used = gate
        .budget
        .used_usd(&TenantId::new("acme"), "cloud_usd", BudgetPeriod::Day)
        .await
        .unwrap();
    assert!(used <= 10.0, "spend {used} exceeds the limit");
}

/// Rate safety: admissions in a burst stay within capacity plus one token.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_admissions_stay_within_capacity() {
    let gate = TestGate::start(BUNDLE, |_| {}).await;
    let admin = gate.token("acme", "root", &[Role::Admin]);
    gate.client
        .put(format!("{}/admin/tenants/acme/rate-limit", gate.base_url))
        .bearer_auth(&admin)
        .json(&json!({"qps": 3.0}))
        .send()
        .await
        .unwrap();

    let token = gate.token("acme", "agent-7", &[]);
    let started = std::time::Instant::now();
    let mut admitted = 0u32;
    for _ in 0..12 {
        let result = gate
            .tools_call(
                &token,
                "net.http",
                json!({"method": "GET", "url": "https://intranet.api/ping"}),
            )
            .await;
        if result["isError"] == json!(false) {
            admitted += 1;
        }
    }
    // Capacity burst, plus one token of tolerance, plus whatever refilled
    // while the loop ran on the wall clock.
    let refilled = (started.elapsed().as_secs_f64() * 3.0).ceil() as u32;
    assert!(
        admitted <= 3 + 1 + refilled,
        "{admitted} admissions for a 3 qps bucket (refill allowance {refilled})"
    );
    assert!(admitted >= 1, "the bucket should admit at least its burst");
}

/// Idempotence: re-posting the same callback decision is a no-op.
#[tokio::test]
async fn repeated_callback_is_a_no_op() {
    let gate = TestGate::start(BUNDLE, |_| {}).await;
    let token = gate.token("acme", "agent-7", &[]);
    gate.tools_call(&token, "fs.write", json!({"path": "/etc/x", "bytes": "aGk="})).await;
    let pending_id = gate.latest_pending_id().await.expect("pending id");

    let (_, first) = gate.callback(&pending_id, "alice", ApprovalAction::Approve).await;
    let entries_after_first = gate.audit_entries().await.len();
    let (_, second) = gate.callback(&pending_id, "alice", ApprovalAction::Approve).await;
    assert_eq!(first["status"], second["status"]);
    let entries_after_second = gate.audit_entries().await.len();
    assert_eq!(
        entries_after_first, entries_after_second,
        "a repeated decision must not append audit entries"
    );

    // The tally still needs a second distinct approver.
    let record = gate.approvals.get(&pending_id).await.unwrap().unwrap();
    assert_eq!(record.decisions.len(), 1);
}

/// Group enforcement: a decision from outside the approver group is refused
/// and leaves the tally untouched.
#[tokio::test]
async fn outsider_cannot_decide_group_approvals() {
    let gate = TestGate::start(BUNDLE, |_| {}).await;
    let token = gate.token("acme", "agent-7", &[]);
    gate.tools_call(&token, "fs.write", json!({"path": "/etc/x", "bytes": "aGk="})).await;
    let pending_id = gate.latest_pending_id().await.expect("pending id");

    let (status, body) = gate.callback(&pending_id, "mallory", ApprovalAction::Deny).await;
    assert_eq!(status, 403, "outsider decision accepted: {body}");
    let record = gate.approvals.get(&pending_id).await.unwrap().unwrap();
    assert!(record.decisions.is_empty());
    assert_eq!(record.status, tool_gate_core::runtime::ApprovalStatus::Pending);
}

/// Audit chain integrity: a mixed workload leaves a verifiable chain.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn audit_chain_verifies_after_mixed_workload() {
    let gate = TestGate::start(BUNDLE, |config| {
        config.limits.default_qps = 10_000.0;
    })
    .await;
    let mut handles = Vec::new();
    for n in 0..16 {
        let gate_url = gate.base_url.clone();
        let client = gate.client.clone();
        let token = gate.token("acme", &format!("agent-{n}"), &[]);
        let tool = if n % 3 == 0 { "fs.write" } else { "net.http" };
        handles.push(tokio::spawn(async move {
            let body = json!({
                "jsonrpc": "2.0",
                "id": format!("mix-{n}"),
                "method": "tools/call",
                "params": {
                    "name": tool,
                    "arguments": {
                        "method": "GET",
                        "url": "https://intranet.api/x",
                        "path": "/etc/x",
                        "bytes": "aGk=",
                    },
                },
            });
            let _ = client.post(format!("{gate_url}/mcp")).bearer_auth(token).json(&body).send().await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    let entries = gate.audit_entries().await;
    assert!(entries.len() >= 16, "expected one entry per call, got {}", entries.len());
    verify_chain(tool_gate_core::runtime::audit::GENESIS_HASH, &entries).unwrap();
}
