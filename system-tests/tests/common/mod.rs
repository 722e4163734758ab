// system-tests/tests/common/mod.rs
// ============================================================================
// Module: System Test Harness
// Description: Boots a gateway on an ephemeral port with in-process stores.
// Purpose: Give every suite one fixture for HTTP, tokens, and callbacks.
// ============================================================================
#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Shared test harness; not every suite uses every helper."
)]

use std::collections::BTreeSet;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use serde_json::json;

use tool_gate_config::ToolGateConfig;
use tool_gate_core::BundleStore;
use tool_gate_core::PendingId;
use tool_gate_core::SubjectId;
use tool_gate_core::TenantId;
use tool_gate_core::runtime::ApprovalAction;
use tool_gate_core::runtime::ApprovalStore;
use tool_gate_core::runtime::AuditEntry;
use tool_gate_core::runtime::AuditLog;
use tool_gate_core::runtime::BudgetLedger;
use tool_gate_mcp::CallbackClaims;
use tool_gate_mcp::CallbackSigner;
use tool_gate_mcp::McpGateway;
use tool_gate_mcp::Role;
use tool_gate_mcp::mint_dev_token;

/// Dev secret used by every suite.
pub const DEV_SECRET: &str = "system-test-dev-secret";
/// Callback secret used by every suite.
pub const CALLBACK_SECRET: &str = "system-test-callback-secret";
/// Token expiry far in the future.
pub const FAR_FUTURE: i64 = 4_102_444_800;

/// A gateway bound to an ephemeral port plus handles into its stores.
pub struct TestGate {
    /// Base URL of the running server.
    pub base_url: String,
    /// Identity settings for token minting.
    pub config: ToolGateConfig,
    /// Approval store handle (shares the gateway's coordinator).
    pub approvals: ApprovalStore,
    /// Budget ledger handle.
    pub budget: BudgetLedger,
    /// Audit log handle.
    pub audit: Arc<dyn AuditLog>,
    /// Bundle store handle.
    pub bundles: Arc<BundleStore>,
    /// Callback signer matching the server secret.
    pub signer: CallbackSigner,
    /// HTTP client.
    pub client: reqwest::Client,
    /// Keeps the policy file alive.
    _policy_file: tempfile::NamedTempFile,
}

impl TestGate {
    /// Boots a gateway serving `policy_yaml`, after applying `mutate` to the
    /// base configuration.
    pub async fn start(policy_yaml: &str, mutate: impl FnOnce(&mut ToolGateConfig)) -> Self {
        let mut policy_file = tempfile::NamedTempFile::new().expect("policy tempfile");
        policy_file.write_all(policy_yaml.as_bytes()).expect("write policy");

        let mut config = ToolGateConfig::default();
        config.server.transport = tool_gate_config::ServerTransport::Http;
        config.identity.dev_jwt_secret = Some(DEV_SECRET.to_string());
        config.callback.signing_secret = Some(CALLBACK_SECRET.to_string());
        config.policy.file = Some(policy_file.path().to_path_buf());
        config.approvals.groups = vec![tool_gate_config::ApprovalGroup {
            name: "sec-ops".to_string(),
            members: vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
        }];
        mutate(&mut config);

        let gateway = McpGateway::from_config(config.clone()).expect("gateway");
        let approvals = gateway.approvals.clone();
        let budget = gateway.budget.clone();
        let audit = gateway.audit.clone();
        let bundles = gateway.bundles.clone();

        let app = tool_gate_mcp::server::router(Arc::new(gateway));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr: SocketAddr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            config,
            approvals,
            budget,
            audit,
            bundles,
            signer: CallbackSigner::new(CALLBACK_SECRET),
            client: reqwest::Client::new(),
            _policy_file: policy_file,
        }
    }

    /// Mints a bearer token for the given identity.
    pub fn token(&self, tenant: &str, subject: &str, roles: &[Role]) -> String {
        mint_dev_token(
            &self.config.identity,
            &TenantId::new(tenant),
            &SubjectId::new(subject),
            &roles.iter().copied().collect::<BTreeSet<_>>(),
            FAR_FUTURE,
        )
        .expect("mint token")
    }

    /// Sends a `tools/call` and returns the JSON-RPC `result` payload.
    pub async fn tools_call(&self, token: &str, name: &str, arguments: Value) -> Value {
        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid_like(name),
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments},
        });
        let response = self
            .client
            .post(format!("{}/mcp", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .expect("mcp request");
        let envelope: Value = response.json().await.expect("mcp json");
        envelope
            .get("result")
            .cloned()
            .unwrap_or_else(|| panic!("no result in {envelope}"))
    }

    /// Posts a signed approval callback as the given approver.
    pub async fn callback(
        &self,
        pending_id: &PendingId,
        approver: &str,
        action: ApprovalAction,
    ) -> (u16, Value) {
        let token = self
            .signer
            .mint(&CallbackClaims {
                pending_id: pending_id.clone(),
                approver_id: SubjectId::new(approver),
                action,
                exp: FAR_FUTURE,
            })
            .expect("mint callback token");
        let bearer = self.token("acme", approver, &[Role::Approver]);
        let response = self
            .client
            .get(format!("{}/approvals/callback", self.base_url))
            .query(&[("t", token)])
            .bearer_auth(bearer)
            .send()
            .await
            .expect("callback request");
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Exports the full audit trail in chain order.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        let token = self.token("acme", "auditor", &[Role::Viewer]);
        let response = self
            .client
            .get(format!("{}/v1/audit", self.base_url))
            .query(&[("frm", "0"), ("to", &FAR_FUTURE.to_string())])
            .bearer_auth(token)
            .send()
            .await
            .expect("audit request");
        let value: Value = response.json().await.expect("audit json");
        serde_json::from_value(value).expect("audit entries")
    }

    /// Finds the newest pending id recorded in the audit trail.
    pub async fn latest_pending_id(&self) -> Option<PendingId> {
        self.audit_entries()
            .await
            .iter()
            .rev()
            .find(|entry| entry.record.event == "approval_requested")
            .and_then(|entry| entry.record.result_meta.get("pending_id"))
            .and_then(Value::as_str)
            .map(PendingId::new)
    }
}

/// Stable per-call request id without pulling a uuid dependency in.
fn uuid_like(tag: &str) -> String {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("req-{tag}-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}
