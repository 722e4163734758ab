// tool-gate-mcp/src/metrics.rs
// ============================================================================
// Module: Gateway Metrics
// Description: Prometheus counters, gauges, and latency histogram.
// Purpose: Export decision and transport telemetry at /metrics.
// Dependencies: prometheus, once_cell
// ============================================================================

//! ## Overview
//! Metrics register lazily in the process-default registry and render as
//! Prometheus text. Decision outcomes, approval backlog, audit writes, and
//! per-route HTTP traffic are the operator's first stop before the audit log.

// ============================================================================
// SECTION: Imports
// ============================================================================

use once_cell::sync::Lazy;
use prometheus::HistogramVec;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::TextEncoder;
use prometheus::register_histogram_vec;
use prometheus::register_int_counter;
use prometheus::register_int_counter_vec;
use prometheus::register_int_gauge;

// ============================================================================
// SECTION: Collectors
// ============================================================================

/// Decisions by outcome label.
static POLICY_DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "policy_decisions_total",
        "Tool-call decisions by outcome",
        &["outcome"]
    )
    .unwrap_or_else(|err| panic!("register policy_decisions_total: {err}"))
});

/// Currently pending approvals.
static APPROVALS_PENDING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("approvals_pending", "Pending approval records")
        .unwrap_or_else(|err| panic!("register approvals_pending: {err}"))
});

/// Audit entries appended.
static AUDIT_WRITES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("audit_writes_total", "Audit chain appends")
        .unwrap_or_else(|err| panic!("register audit_writes_total: {err}"))
});

/// HTTP requests by method, path, and status.
static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_requests_total",
        "HTTP requests served",
        &["method", "path", "status"]
    )
    .unwrap_or_else(|err| panic!("register http_requests_total: {err}"))
});

/// Request latency by path.
static REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "request_duration_seconds",
        "Request latency in seconds",
        &["path"],
        vec![0.001, 0.005, 0.025, 0.1, 0.25, 1.0, 5.0, 20.0]
    )
    .unwrap_or_else(|err| panic!("register request_duration_seconds: {err}"))
});

// ============================================================================
// SECTION: Recording API
// ============================================================================

/// Records one decision outcome.
pub fn record_decision(outcome: &str) {
    POLICY_DECISIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Adjusts the pending-approvals gauge.
pub fn add_pending_approvals(delta: i64) {
    APPROVALS_PENDING.add(delta);
}

/// Records one audit append.
pub fn record_audit_write() {
    AUDIT_WRITES_TOTAL.inc();
}

/// Records one served HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16) {
    HTTP_REQUESTS_TOTAL.with_label_values(&[method, path, &status.to_string()]).inc();
}

/// Records request latency for a path.
pub fn observe_latency(path: &str, seconds: f64) {
    REQUEST_DURATION_SECONDS.with_label_values(&[path]).observe(seconds);
}

/// Renders the default registry as Prometheus text.
#[must_use]
pub fn render() -> String {
    TextEncoder::new().encode_to_string(&prometheus::gather()).unwrap_or_default()
}

// ============================================================================
// SECTION: Metered Audit Log
// ============================================================================

/// Audit log decorator feeding the write counter and approvals gauge.
pub struct MeteredAuditLog {
    /// Wrapped log.
    inner: std::sync::Arc<dyn tool_gate_core::runtime::AuditLog>,
}

impl MeteredAuditLog {
    /// Wraps an audit log.
    #[must_use]
    pub fn new(inner: std::sync::Arc<dyn tool_gate_core::runtime::AuditLog>) -> Self {
        Self { inner }
    }
}

impl tool_gate_core::runtime::AuditLog for MeteredAuditLog {
    fn append(
        &self,
        draft: tool_gate_core::runtime::AuditDraft,
    ) -> Result<tool_gate_core::runtime::AuditEntry, tool_gate_core::runtime::AuditError> {
        let event = draft.event.clone();
        let entry = self.inner.append(draft)?;
        record_audit_write();
        match event.as_str() {
            "approval_requested" => add_pending_approvals(1),
            "approval_resolved" => add_pending_approvals(-1),
            _ => {}
        }
        Ok(entry)
    }

    fn export(
        &self,
        frm: tool_gate_core::Timestamp,
        to: tool_gate_core::Timestamp,
    ) -> Result<Vec<tool_gate_core::runtime::AuditEntry>, tool_gate_core::runtime::AuditError>
    {
        self.inner.export(frm, to)
    }

    fn head(&self) -> Result<String, tool_gate_core::runtime::AuditError> {
        self.inner.head()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
