// system-tests/tests/scenarios.rs
// ============================================================================
// Module: End-to-End Scenarios
// Description: The gateway's contract scenarios driven over real HTTP.
// Purpose: Cover allow, dual-control, deny precedence, budgets, signatures,
//          and rollout determinism end to end.
// ============================================================================
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions.")]

mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::SigningKey;
use serde_json::Value;
use serde_json::json;

use common::TestGate;
use tool_gate_core::BudgetPeriod;
use tool_gate_core::TenantId;
use tool_gate_core::policy::sign_bundle;
use tool_gate_core::policy::stable_bucket;
use tool_gate_core::runtime::ApprovalAction;
use tool_gate_core::runtime::ApprovalStatus;
use tool_gate_core::runtime::AuditLog;
use tool_gate_mcp::Role;

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
    approver_group: sec-ops
  - name: Routine cloud ops
    match: cloud.ops
    action: allow
  - name: Dual-control write outside jail
    match: fs.write
    where:
      path_not_under: ["/sandbox/tmp"]
    action: approval
    required_approvals: 2
    approver_group: sec-ops
"#;

/// S1 — allow intranet HTTP with the winning rule and host trace.
#[tokio::test]
async fn s1_allow_intranet_http() {
    let gate = TestGate::start(BUNDLE, |_| {}).await;
    let token = gate.token("acme", "agent-7", &[]);
    let result = gate
        .tools_call(
            &token,
            "net.http",
            json!({"method": "GET", "url": "https://intranet.api/status"}),
        )
        .await;
    assert_eq!(result["isError"], json!(false));
    assert_eq!(result["structuredContent"]["rule"], json!("Allow intranet HTTP"));

    // The simulator returns the evaluation trace verbatim.
    let viewer = gate.token("acme", "sim", &[Role::Viewer]);
    let response = gate
        .client
        .post(format!("{}/v1/policy/simulate", gate.base_url))
        .bearer_auth(viewer)
        .json(&json!({
            "tool": "net.http",
            "arguments": {"method": "GET", "url": "https://intranet.api/status"},
        }))
        .send()
        .await
        .unwrap();
    let decision: Value = response.json().await.unwrap();
    assert_eq!(decision["decision"], json!("allow"));
    assert_eq!(decision["rule_name"], json!("Allow intranet HTTP"));
    let explains: Vec<&Value> = decision["trace"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|entry| entry["explain"].as_array().unwrap())
        .collect();
    assert!(
        explains
            .iter()
            .any(|check| check["ok"] == json!(true)
                && check["msg"] == json!("host 'intranet.api' allowed")),
        "missing host explanation in {explains:?}"
    );
}

/// S2 — dual-control write reaches allow after two approvals, with the audit
/// chain recording both approve entries and the terminal transition.
#[tokio::test]
async fn s2_dual_control_write_outside_jail() {
    let gate = TestGate::start(BUNDLE, |_| {}).await;
    let token = gate.token("acme", "agent-7", &[]);
    let result = gate
        .tools_call(&token, "fs.write", json!({"path": "/etc/hosts", "bytes": "aGk="}))
        .await;
    assert_eq!(result["decision"], json!("approval"));
    let pending_id = gate.latest_pending_id().await.expect("pending id");

    let (status, body) = gate.callback(&pending_id, "alice", ApprovalAction::Approve).await;
    assert_eq!(status, 200, "alice callback failed: {body}");
    assert_eq!(body["status"], json!("pending"));
    let (status, body) = gate.callback(&pending_id, "bob", ApprovalAction::Approve).await;
    assert_eq!(status, 200, "bob callback failed: {body}");
    assert_eq!(body["status"], json!("allow"));

    let record = gate.approvals.get(&pending_id).await.unwrap().unwrap();
    assert_eq!(record.status, ApprovalStatus::Allow);

    let events: Vec<String> =
        gate.audit_entries().await.iter().map(|entry| entry.record.event.clone()).collect();
    let decisions = events.iter().filter(|event| *event == "approval_decision").count();
    assert_eq!(decisions, 2, "expected two approve entries in {events:?}");
    assert!(
        events.iter().any(|event| event == "approval_resolved"),
        "missing terminal transition in {events:?}"
    );
}

/// S3 — deny precedence: one deny terminates regardless of approvals, and a
/// late approve is a no-op.
#[tokio::test]
async fn s3_deny_precedence() {
    let gate = TestGate::start(BUNDLE, |_| {}).await;
    let token = gate.token("acme", "agent-7", &[]);
    gate.tools_call(&token, "fs.write", json!({"path": "/etc/hosts", "bytes": "aGk="})).await;
    let pending_id = gate.latest_pending_id().await.expect("pending id");

    let (_, body) = gate.callback(&pending_id, "alice", ApprovalAction::Approve).await;
    assert_eq!(body["status"], json!("pending"));
    let (_, body) = gate.callback(&pending_id, "bob", ApprovalAction::Deny).await;
    assert_eq!(body["status"], json!("deny"));

    // Carol arrives late; the terminal state is sticky.
    let (status, body) = gate.callback(&pending_id, "carol", ApprovalAction::Approve).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], json!("deny"));
    let record = gate.approvals.get(&pending_id).await.unwrap().unwrap();
    assert_eq!(record.status, ApprovalStatus::Deny);
    assert_eq!(record.decisions.len(), 2);
}

/// S4 — high-cost cloud op waits synchronously, the approval admits it, the
/// budget debits, and the next call over the remainder is refused.
#[tokio::test]
async fn s4_sync_wait_with_budget_debit() {
    let gate = TestGate::start(BUNDLE, |config| {
        config.approvals.sync_wait_ms = 20_000;
    })
    .await;
    let admin = gate.token("acme", "root", &[Role::Admin]);
    let response = gate
        .client
        .put(format!("{}/admin/tenants/acme/quota", gate.base_url))
        .bearer_auth(&admin)
        .json(&json!({"name": "cloud_usd", "period": "day", "limit": 15.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // The call blocks in the sync window; approve it from a second task.
    let approver_gate = gate.approvals.clone();
    let signer_task = {
        let gate_audit = gate.audit.clone();
        tokio::spawn(async move {
            // Poll the audit log for the pending id, then approve directly
            // against the shared store (the callback path is covered by S2).
            for _ in 0..400 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                let entries = gate_audit
                    .export(
                        tool_gate_core::Timestamp::from_millis(0),
                        tool_gate_core::Timestamp::from_millis(i64::MAX),
                    )
                    .unwrap();
                if let Some(entry) =
                    entries.iter().find(|entry| entry.record.event == "approval_requested")
                {
                    let pending_id = tool_gate_core::PendingId::new(
                        entry.record.result_meta["pending_id"].as_str().unwrap(),
                    );
                    approver_gate
                        .record_decision(
                            &pending_id,
                            &tool_gate_core::SubjectId::new("alice"),
                            ApprovalAction::Approve,
                        )
                        .await
                        .unwrap();
                    return;
                }
            }
            panic!("approval request never appeared");
        })
    };

    let token = gate.token("acme", "agent-7", &[]);
    let result = gate
        .tools_call(
            &token,
            "cloud.ops",
            json!({
                "provider": "aws",
                "resource": "ec2",
                "action": "run_instances",
                "estimated_cost_usd": 12.0,
            }),
        )
        .await;
    signer_task.await.unwrap();
    assert_eq!(result["isError"], json!(false), "sync-wait call should allow: {result}");

    let used = gate
        .budget
        .used_usd(&TenantId::new("acme"), "cloud_usd", BudgetPeriod::Day)
        .await
        .unwrap();
    assert_eq!(used, 12.0);

    // 9.00 more would breach the 15.00 ceiling.
    let second = gate
        .tools_call(
            &token,
            "cloud.ops",
            json!({
                "provider": "aws",
                "resource": "ec2",
                "action": "run_instances",
                "estimated_cost_usd": 9.0,
            }),
        )
        .await;
    assert_eq!(second["isError"], json!(true));
    assert_eq!(second["structuredContent"]["reason"], json!("budget_exceeded"));
    let used = gate
        .budget
        .used_usd(&TenantId::new("acme"), "cloud_usd", BudgetPeriod::Day)
        .await
        .unwrap();
    assert_eq!(used, 12.0, "failed debit must leave spend unchanged");
}

/// S5 — a tampered bundle is rejected at apply, the previous bundle stays
/// active, and the audit trail records the signature failure.
#[tokio::test]
async fn s5_signature_tamper_rejected() {
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let public_b64 = BASE64.encode(key.verifying_key().as_bytes());

    // Boot with a signed bundle and signatures required for every apply.
    let sig_dir = tempfile::tempdir().unwrap();
    let boot_sig = sign_bundle(BUNDLE.as_bytes(), &key, "2026-08-02T00:00:00Z");
    let sig_path = sig_dir.path().join("policy.yaml.sig");
    std::fs::write(&sig_path, boot_sig.to_json().unwrap()).unwrap();
    let gate = TestGate::start(BUNDLE, |config| {
        config.policy.public_key_b64 = Some(public_b64.clone());
        config.policy.require_signature = true;
        config.policy.sig_path = Some(sig_path.clone());
    })
    .await;
    let admin = gate.token("acme", "root", &[Role::Admin]);

    let v2 = BUNDLE.replace("version: v1", "version: v2");
    let signature = sign_bundle(v2.as_bytes(), &key, "2026-08-02T00:00:00Z");
    let mut tampered = v2.clone().into_bytes();
    tampered[0] ^= 0x01;
    let response = gate
        .client
        .post(format!("{}/v1/policy/apply", gate.base_url))
        .bearer_auth(&admin)
        .json(&json!({
            "bundle_yaml": String::from_utf8(tampered).unwrap(),
            "signature": signature,
            "strategy": "active",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("signature_invalid"));

    // Previous active bundle remains in effect.
    let status = gate.bundles.status().unwrap();
    assert_eq!(status.active_version.as_str(), "v1");

    let entries = gate.audit_entries().await;
    let failed = entries
        .iter()
        .find(|entry| entry.record.event == "bundle_apply_failed")
        .expect("bundle_apply_failed entry");
    assert_eq!(failed.record.result_meta["reason"], json!("signature_invalid"));

    // The untampered bundle applies cleanly with the same signature.
    let response = gate
        .client
        .post(format!("{}/v1/policy/apply", gate.base_url))
        .bearer_auth(&admin)
        .json(&json!({
            "bundle_yaml": v2,
            "signature": sign_bundle(v2.as_bytes(), &key, "2026-08-02T00:00:00Z"),
            "strategy": "active",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(gate.bundles.status().unwrap().active_version.as_str(), "v2");
}

/// S6 — canary rollout maps tenants deterministically by the stable bucket.
#[tokio::test]
async fn s6_rollout_determinism() {
    let gate = TestGate::start(BUNDLE, |config| {
        config.policy.rollout_seed = 42;
    })
    .await;
    let admin = gate.token("acme", "root", &[Role::Admin]);

    // v2 flips intranet HTTP to deny so the serving version is observable.
    let v2 = BUNDLE
        .replace("version: v1", "version: v2")
        .replace("    action: allow\n  - name: High-cost", "    action: deny\n  - name: High-cost");
    let response = gate
        .client
        .post(format!("{}/v1/policy/apply", gate.base_url))
        .bearer_auth(&admin)
        .json(&json!({
            "bundle_yaml": v2,
            "strategy": "canary_percent",
            "canary_percent": 10,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    for n in 0..40 {
        let tenant = format!("tenant-{n}");
        let expected_canary = stable_bucket(42, &TenantId::new(tenant.clone())) < 10;
        let bundle = gate.bundles.snapshot_for(&TenantId::new(tenant.clone())).unwrap();
        let version = if expected_canary { "v2" } else { "v1" };
        assert_eq!(bundle.version.as_str(), version, "tenant {tenant}");

        // The serving behavior agrees with the version mapping.
        let token = gate.token(&tenant, "agent", &[]);
        let result = gate
            .tools_call(
                &token,
                "net.http",
                json!({"method": "GET", "url": "https://intranet.api/status"}),
            )
            .await;
        assert_eq!(
            result["isError"],
            json!(expected_canary),
            "tenant {tenant} served wrong bundle"
        );
    }
}
