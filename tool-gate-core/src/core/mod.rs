// tool-gate-core/src/core/mod.rs
// ============================================================================
// Module: Core Data Model
// Description: Identifiers, time, and the tool-call record.
// Purpose: Group the pure data types shared by every subsystem.
// Dependencies: serde, chrono, uuid
// ============================================================================

//! ## Overview
//! Pure, side-effect-free data types: opaque identifiers, the clock seam, and
//! the immutable [`ToolCall`] consumed by the decision pipeline.

pub mod clock;
pub mod identifiers;
pub mod toolcall;

pub use clock::BudgetPeriod;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use clock::Timestamp;
pub use identifiers::BundleVersion;
pub use identifiers::PendingId;
pub use identifiers::RequestId;
pub use identifiers::RuleName;
pub use identifiers::SubjectId;
pub use identifiers::TenantId;
pub use identifiers::ToolName;
pub use toolcall::ToolCall;
