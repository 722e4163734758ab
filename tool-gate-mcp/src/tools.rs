// tool-gate-mcp/src/tools.rs
// ============================================================================
// Module: Built-in Tool Registry
// Description: Tool definitions exposed by tools/list and the price book.
// Purpose: Describe the mediated tool surface; only the estimator executes.
// Dependencies: serde_json
// ============================================================================

//! ## Overview
//! The gateway decides tool calls but does not execute them; callers act on
//! an `allow` themselves. The one exception is `cloud.estimate`, which reads
//! a static price book keyed by `(provider, action)` and returns the cost
//! figure agents feed into `cloud.ops` calls. Definitions carry JSON-Schema
//! shaped `inputSchema` documents for `tools/list`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;

use tool_gate_core::ToolName;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Tool execution failures (estimator only).
#[derive(Debug, Error)]
pub enum ToolExecError {
    /// Required argument missing or mistyped.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// No price mapping for the provider/action pair.
    #[error("no price mapping for {provider}.{action}")]
    UnknownPrice {
        /// Requested provider.
        provider: String,
        /// Requested action.
        action: String,
    },
}

// ============================================================================
// SECTION: Definitions
// ============================================================================

/// One tool definition for `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Dotted tool name.
    pub name: String,
    /// Display title.
    pub title: String,
    /// Short description.
    pub description: String,
    /// JSON-Schema input document.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The mediated tool surface.
pub struct ToolRegistry {
    /// Registered definitions, in listing order.
    definitions: Vec<ToolDefinition>,
    /// Price book for the estimator.
    prices: Value,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Builds the registry with the built-in tools and price book.
    #[must_use]
    pub fn new() -> Self {
        Self {
            definitions: builtin_definitions(),
            prices: builtin_price_book(),
        }
    }

    /// Returns all definitions for `tools/list`.
    #[must_use]
    pub fn list(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    /// Returns true when the tool is registered.
    #[must_use]
    pub fn contains(&self, tool: &ToolName) -> bool {
        self.definitions.iter().any(|definition| definition.name == tool.as_str())
    }

    /// Executes the cost estimator against the static price book.
    ///
    /// # Errors
    ///
    /// Returns [`ToolExecError`] for missing arguments or unknown mappings.
    pub fn estimate(&self, arguments: &Value) -> Result<Value, ToolExecError> {
        let provider = require_str(arguments, "provider")?;
        let action = require_str(arguments, "action")?;
        let units = arguments
            .get("units")
            .and_then(Value::as_f64)
            .ok_or_else(|| ToolExecError::InvalidArguments("units must be a number".to_string()))?;
        if units < 0.0 {
            return Err(ToolExecError::InvalidArguments("units must be >= 0".to_string()));
        }
        let entry = self
            .prices
            .get(provider)
            .and_then(|actions| actions.get(action))
            .ok_or_else(|| ToolExecError::UnknownPrice {
                provider: provider.to_string(),
                action: action.to_string(),
            })?;
        let usd_per_unit = entry.get("usd_per_unit").and_then(Value::as_f64).unwrap_or(0.0);
        let unit = entry.get("unit").and_then(Value::as_str).unwrap_or("unit");
        let estimate = (usd_per_unit * units * 10_000.0).round() / 10_000.0;
        Ok(json!({
            "estimated_cost_usd": estimate,
            "unit": unit,
            "usd_per_unit": usd_per_unit,
            "source": "static-pricebook",
        }))
    }
}

/// Reads a required string argument.
fn require_str<'a>(arguments: &'a Value, field: &str) -> Result<&'a str, ToolExecError> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolExecError::InvalidArguments(format!("{field} must be a string")))
}

/// The built-in tool definitions.
fn builtin_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "net.http".to_string(),
            title: "HTTP Request".to_string(),
            description: "Outbound HTTP call, gated by host and method policy".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "method": {"type": "string"},
                    "url": {"type": "string"},
                    "body": {"type": "string"},
                },
                "required": ["method", "url"],
            }),
        },
        ToolDefinition {
            name: "fs.read".to_string(),
            title: "File Read".to_string(),
            description: "Read a file path, gated by path-prefix policy".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                },
                "required": ["path"],
            }),
        },
        ToolDefinition {
            name: "fs.write".to_string(),
            title: "File Write".to_string(),
            description: "Write bytes to a path, gated by path-prefix policy".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "bytes": {"type": "string", "description": "Base64 encoded data"},
                },
                "required": ["path", "bytes"],
            }),
        },
        ToolDefinition {
            name: "mail.send".to_string(),
            title: "Send Mail".to_string(),
            description: "Outbound mail, typically gated for approval".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "to": {"type": "string"},
                    "subject": {"type": "string"},
                    "body": {"type": "string"},
                },
                "required": ["to", "subject", "body"],
            }),
        },
        ToolDefinition {
            name: "cloud.ops".to_string(),
            title: "Cloud Operations".to_string(),
            description: "Cloud control-plane operation with a declared cost".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "provider": {"type": "string", "enum": ["aws", "gcp", "azure"]},
                    "resource": {"type": "string"},
                    "action": {"type": "string"},
                    "estimated_cost_usd": {"type": "number", "minimum": 0},
                },
                "required": ["provider", "resource", "action"],
            }),
        },
        ToolDefinition {
            name: "cloud.estimate".to_string(),
            title: "Cloud Cost Estimator".to_string(),
            description: "Static estimator for cloud ops; use before cloud.ops".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "provider": {"type": "string", "enum": ["aws", "gcp", "azure"]},
                    "action": {"type": "string"},
                    "units": {"type": "number", "minimum": 0},
                },
                "required": ["provider", "action", "units"],
            }),
        },
    ]
}

/// Static price book keyed by provider then action.
fn builtin_price_book() -> Value {
    json!({
        "aws": {
            "ec2.run_instances": {"unit": "instance-hour", "usd_per_unit": 0.0928},
            "s3.put_object": {"unit": "1k-requests", "usd_per_unit": 0.005},
            "rds.create_snapshot": {"unit": "gb-month", "usd_per_unit": 0.095},
        },
        "gcp": {
            "compute.instances.insert": {"unit": "instance-hour", "usd_per_unit": 0.0899},
            "storage.objects.insert": {"unit": "1k-requests", "usd_per_unit": 0.005},
        },
        "azure": {
            "vm.create": {"unit": "instance-hour", "usd_per_unit": 0.0960},
            "blob.put": {"unit": "1k-requests", "usd_per_unit": 0.0054},
        },
    })
}

// ============================================================================
// SECTION: Tests
// ============================================================================
