// tool-gate-mcp/src/lib.rs
// ============================================================================
// Module: Tool Gate MCP
// Description: Transports and operator surface over the decision core.
// Purpose: Serve JSON-RPC tool mediation plus admin, callback, and telemetry.
// Dependencies: tool-gate-core, tool-gate-config, axum, tokio
// ============================================================================

//! ## Overview
//! This crate wires configuration into a running gateway: JSON-RPC 2.0 over
//! HTTP POST `/mcp` and newline-delimited stdio, bearer identity (OIDC or dev
//! HMAC), the admin REST surface with the policy simulator and staged apply,
//! the signed approval callback, and Prometheus telemetry. All decisions flow
//! through [`tool_gate_core::DecisionPipeline`]; nothing here re-implements
//! policy semantics. Security posture: every transport input is untrusted.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod admin;
pub mod callback;
pub mod gateway;
pub mod identity;
pub mod metrics;
pub mod rbac;
pub mod server;
pub mod tools;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use callback::CallbackClaims;
pub use callback::CallbackError;
pub use callback::CallbackSigner;
pub use gateway::GatewayError;
pub use gateway::McpGateway;
pub use identity::IdentityError;
pub use identity::IdentityVerifier;
pub use identity::Principal;
pub use identity::Role;
pub use identity::mint_dev_token;
pub use rbac::ApproverDirectory;
pub use rbac::RbacStore;
pub use server::PROTOCOL_VERSION;
pub use server::ServerError;
pub use server::serve;
pub use tools::ToolDefinition;
pub use tools::ToolRegistry;
