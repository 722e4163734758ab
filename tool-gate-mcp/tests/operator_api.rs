// tool-gate-mcp/tests/operator_api.rs
// ============================================================================
// Module: Operator API Integration
// Description: The admin REST surface over a live ephemeral-port server.
// Purpose: Role gating, RBAC round-trips, simulator, diff, status, export.
// ============================================================================
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions.")]

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use serde_json::Value;
use serde_json::json;

use tool_gate_config::ToolGateConfig;
use tool_gate_core::SubjectId;
use tool_gate_core::TenantId;
use tool_gate_mcp::McpGateway;
use tool_gate_mcp::Role;
use tool_gate_mcp::mint_dev_token;

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
"#;

struct Operator {
    base_url: String,
    config: ToolGateConfig,
    client: reqwest::Client,
    _policy_file: tempfile::NamedTempFile,
}

async fn operator() -> Operator {
    let mut policy_file = tempfile::NamedTempFile::new().unwrap();
    policy_file.write_all(BUNDLE.as_bytes()).unwrap();
    let mut config = ToolGateConfig::default();
    config.server.transport = tool_gate_config::ServerTransport::Http;
    config.identity.dev_jwt_secret = Some("operator-test-secret".to_string());
    config.policy.file = Some(policy_file.path().to_path_buf());
    let gateway = McpGateway::from_config(config.clone()).unwrap();
    let app = tool_gate_mcp::server::router(Arc::new(gateway));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    Operator {
        base_url: format!("http://{addr}"),
        config,
        client: reqwest::Client::new(),
        _policy_file: policy_file,
    }
}

impl Operator {
    fn token(&self, subject: &str, roles: &[Role]) -> String {
        mint_dev_token(
            &self.config.identity,
            &TenantId::new("acme"),
            &SubjectId::new(subject),
            &roles.iter().copied().collect::<BTreeSet<_>>(),
            4_102_444_800,
        )
        .unwrap()
    }
}

#[tokio::test]
async fn admin_endpoints_reject_missing_and_weak_credentials() {
    let op = operator().await;
    // No bearer at all.
    let response = op
        .client
        .put(format!("{}/admin/tenants/acme/rate-limit", op.base_url))
        .json(&json!({"qps": 10.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    // Viewer is not enough for a mutation.
    let viewer = op.token("vera", &[Role::Viewer]);
    let response = op
        .client
        .put(format!("{}/admin/tenants/acme/rate-limit", op.base_url))
        .bearer_auth(&viewer)
        .json(&json!({"qps": 10.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);

    // No role at all cannot even simulate.
    let nobody = op.token("nobody", &[]);
    let response = op
        .client
        .post(format!("{}/v1/policy/simulate", op.base_url))
        .bearer_auth(&nobody)
        .json(&json!({"tool": "net.http", "arguments": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test]
async fn rbac_assignments_round_trip_and_are_audited() {
    let op = operator().await;
    let admin = op.token("root", &[Role::Admin]);
    let response = op
        .client
        .put(format!("{}/admin/rbac/acme/users/alice", op.base_url))
        .bearer_auth(&admin)
        .json(&json!({"roles": ["approver", "viewer"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = op
        .client
        .get(format!("{}/admin/rbac/acme/users/alice", op.base_url))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["roles"], json!(["approver", "viewer"]));

    // Unknown role labels are rejected outright.
    let response = op
        .client
        .put(format!("{}/admin/rbac/acme/users/alice", op.base_url))
        .bearer_auth(&admin)
        .json(&json!({"roles": ["sudo"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    // The governance event landed on the audit chain.
    let viewer = op.token("vera", &[Role::Viewer]);
    let response = op
        .client
        .get(format!("{}/v1/audit", op.base_url))
        .query(&[("frm", "0"), ("to", "4102444800")])
        .bearer_auth(&viewer)
        .send()
        .await
        .unwrap();
    let entries: Vec<Value> = response.json().await.unwrap();
    assert!(
        entries.iter().any(|entry| entry["record"]["event"] == json!("rbac_changed")),
        "missing rbac_changed in {entries:?}"
    );
}

#[tokio::test]
async fn simulator_traces_inline_bundles_without_side_effects() {
    let op = operator().await;
    let viewer = op.token("vera", &[Role::Viewer]);
    let inline = r#"
defaults:
  decision: deny
rules:
  - name: inline allow
    match: mail.send
    action: allow
"#;
    let response = op
        .client
        .post(format!("{}/v1/policy/simulate", op.base_url))
        .bearer_auth(&viewer)
        .json(&json!({"tool": "mail.send", "arguments": {}, "bundle_yaml": inline}))
        .send()
        .await
        .unwrap();
    let decision: Value = response.json().await.unwrap();
    assert_eq!(decision["decision"], json!("allow"));
    assert_eq!(decision["rule_name"], json!("inline allow"));

    // Malformed inline bundles report policy_invalid.
    let response = op
        .client
        .post(format!("{}/v1/policy/simulate", op.base_url))
        .bearer_auth(&viewer)
        .json(&json!({
            "tool": "mail.send",
            "arguments": {},
            "bundle_yaml": "rules:\n  - name: bad\n    match: x\n    where:\n      bogus: 1\n    action: allow\n",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("policy_invalid"));

    // Simulation appended nothing to the audit chain.
    let response = op
        .client
        .get(format!("{}/v1/audit", op.base_url))
        .query(&[("frm", "0"), ("to", "4102444800")])
        .bearer_auth(&viewer)
        .send()
        .await
        .unwrap();
    let entries: Vec<Value> = response.json().await.unwrap();
    assert!(entries.is_empty(), "simulator must be side-effect free, got {entries:?}");
}

#[tokio::test]
async fn diff_defaults_to_the_active_bundle() {
    let op = operator().await;
    let viewer = op.token("vera", &[Role::Viewer]);
    let proposed = BUNDLE.replace("action: allow", "action: deny");
    let response = op
        .client
        .post(format!("{}/v1/policy/diff", op.base_url))
        .bearer_auth(&viewer)
        .json(&json!({"proposed": proposed}))
        .send()
        .await
        .unwrap();
    let diff: Value = response.json().await.unwrap();
    let modified = diff["modified"].as_array().unwrap();
    assert_eq!(modified.len(), 1);
    assert!(
        diff["headline"]
            .as_array()
            .unwrap()
            .iter()
            .any(|note| note.as_str().unwrap().contains("Action change")),
        "headline missed the action flip: {diff}"
    );
}

#[tokio::test]
async fn status_apply_and_rollback_drive_the_rollout() {
    let op = operator().await;
    let admin = op.token("root", &[Role::Admin]);
    let viewer = op.token("vera", &[Role::Viewer]);

    let response = op
        .client
        .get(format!("{}/v1/policy/status", op.base_url))
        .bearer_auth(&viewer)
        .send()
        .await
        .unwrap();
    let status: Value = response.json().await.unwrap();
    assert_eq!(status["active_version"], json!("v1"));

    let v2 = BUNDLE.replace("version: v1", "version: v2");
    let response = op
        .client
        .post(format!("{}/v1/policy/apply", op.base_url))
        .bearer_auth(&admin)
        .json(&json!({"bundle_yaml": v2, "strategy": "active"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response = op
        .client
        .post(format!("{}/v1/policy/rollback", op.base_url))
        .bearer_auth(&admin)
        .json(&json!({"to_version": "v1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let response = op
        .client
        .get(format!("{}/v1/policy/status", op.base_url))
        .bearer_auth(&viewer)
        .send()
        .await
        .unwrap();
    let status: Value = response.json().await.unwrap();
    assert_eq!(status["active_version"], json!("v1"));

    // Rolling back to a version that never existed is a 404.
    let response = op
        .client
        .post(format!("{}/v1/policy/rollback", op.base_url))
        .bearer_auth(&admin)
        .json(&json!({"to_version": "v99"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn probes_and_metrics_answer_without_auth() {
    let op = operator().await;
    let response =
        op.client.get(format!("{}/healthz", op.base_url)).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("healthy"));

    let response = op.client.get(format!("{}/readyz", op.base_url)).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let response =
        op.client.get(format!("{}/metrics", op.base_url)).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("http_requests_total"), "metrics text missing series: {text}");
}
