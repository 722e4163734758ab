// tool-gate-core/src/policy/mod.rs
// ============================================================================
// Module: Policy Subsystem
// Description: Bundle model, evaluator, signatures, rollout, store, and diff.
// Purpose: Group everything that turns signed YAML into explainable decisions.
// Dependencies: serde_yaml, globset, ed25519-dalek
// ============================================================================

//! ## Overview
//! The policy subsystem owns the signed-bundle lifecycle: parse and compile
//! (`bundle`), verify (`signature`), resolve per tenant (`rollout`, `store`),
//! evaluate (`evaluate`), and compare for review (`diff`). Evaluation is pure;
//! all I/O lives in the store.

pub mod bundle;
pub mod diff;
pub mod evaluate;
pub mod rollout;
pub mod signature;
pub mod store;

pub use bundle::BundleError;
pub use bundle::CompiledBundle;
pub use bundle::Predicate;
pub use bundle::RuleAction;
pub use diff::BundleDiff;
pub use diff::compare;
pub use evaluate::Decision;
pub use evaluate::DecisionOutcome;
pub use evaluate::PredicateCheck;
pub use evaluate::TraceEntry;
pub use evaluate::evaluate;
pub use rollout::Rollout;
pub use rollout::stable_bucket;
pub use signature::SignatureError;
pub use signature::SignatureFile;
pub use signature::sign_bundle;
pub use signature::verify_bundle;
pub use store::ApplyOutcome;
pub use store::ApplyStrategy;
pub use store::BundleStore;
pub use store::BundleStoreConfig;
pub use store::BundleStoreError;
pub use store::RolloutStatus;
