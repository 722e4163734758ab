// tool-gate-core/src/core/toolcall.rs
// ============================================================================
// Module: Tool Call Model
// Description: The immutable tool invocation being decided by the gateway.
// Purpose: Carry tenant, subject, tool, and arguments through the pipeline.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! A [`ToolCall`] is created by the transport once the caller is
//! authenticated, consumed by the decision pipeline, and then discarded. It is
//! never mutated after construction; derived views (argument digest, declared
//! cost) are computed on demand.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::RequestId;
use crate::core::SubjectId;
use crate::core::TenantId;
use crate::core::ToolName;
use crate::hashing::sha256_canonical_json;

// ============================================================================
// SECTION: Tool Call
// ============================================================================

/// A single tool invocation awaiting a gateway decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tenant on whose behalf the call is made.
    pub tenant: TenantId,
    /// Agent or user originating the call.
    pub subject: SubjectId,
    /// Tool being invoked.
    pub tool: ToolName,
    /// Structured tool arguments as supplied by the caller.
    pub arguments: Value,
    /// JSON-RPC request identifier, unique per call.
    pub request_id: RequestId,
}

impl ToolCall {
    /// Builds a tool call from its parts.
    #[must_use]
    pub fn new(
        tenant: impl Into<TenantId>,
        subject: impl Into<SubjectId>,
        tool: impl Into<ToolName>,
        arguments: Value,
        request_id: impl Into<RequestId>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            subject: subject.into(),
            tool: tool.into(),
            arguments,
            request_id: request_id.into(),
        }
    }

    /// Returns the canonical SHA-256 digest of the arguments.
    ///
    /// Serialization of [`Value`] cannot fail; a digest of JSON `null` is
    /// returned for the degenerate case to keep audit appends total.
    #[must_use]
    pub fn args_digest(&self) -> String {
        sha256_canonical_json(&self.arguments)
            .unwrap_or_else(|_| sha256_canonical_json(&Value::Null).unwrap_or_default())
    }

    /// Returns the cost the caller declared for this call, if any.
    ///
    /// Reads `arguments.estimated_cost_usd`; non-numeric values read as
    /// absent, which downstream treats as "no budget impact".
    #[must_use]
    pub fn estimated_cost_usd(&self) -> Option<f64> {
        self.arguments.get("estimated_cost_usd").and_then(Value::as_f64)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
