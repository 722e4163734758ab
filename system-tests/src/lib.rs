// system-tests/src/lib.rs
// ============================================================================
// Module: System Tests
// Description: End-to-end scenario and invariant suites for Tool Gate.
// Purpose: Exercise the gateway over real HTTP with every store in-process.
// Dependencies: tool-gate-core, tool-gate-mcp (dev: reqwest, axum)
// ============================================================================

//! ## Overview
//! This crate carries no library code; the suites live under `tests/` and
//! drive a gateway bound to an ephemeral port through its public HTTP
//! surface, with the in-memory coordinator and audit log behind it.
