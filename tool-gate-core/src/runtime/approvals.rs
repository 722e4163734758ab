// tool-gate-core/src/runtime/approvals.rs
// ============================================================================
// Module: Approval Store
// Description: Durable pending approvals with dual-control tallying.
// Purpose: Record approver decisions atomically and wake synchronous waiters.
// Dependencies: crate::coordinator, serde, tokio, uuid (via core ids)
// ============================================================================

//! ## Overview
//! A pending approval is a durable record keyed by `pending_id` with a TTL,
//! an approver decision map, and a four-state lifecycle: `pending` moves to
//! `allow` once the approve tally reaches the quorum with no deny recorded,
//! to `deny` immediately on any deny (deny precedence), and to `expired` once
//! the TTL elapses. Terminal states are sticky. Decision recording is a
//! read-modify-write compare-and-swap; terminal transitions publish on the
//! record's channel so bounded synchronous waits wake without polling.
//! Waiters subscribe before re-reading state, closing the lost-wakeup window.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;

use crate::coordinator::Coordinator;
use crate::coordinator::CoordinatorError;
use crate::coordinator::Subscription;
use crate::core::Clock;
use crate::core::PendingId;
use crate::core::SubjectId;
use crate::core::TenantId;
use crate::core::Timestamp;
use crate::core::ToolName;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default TTL for pending approvals (15 minutes).
pub const DEFAULT_APPROVAL_TTL_SECONDS: u64 = 900;
/// Extra retention past the TTL so expired records stay inspectable.
const RETENTION_GRACE_SECONDS: u64 = 3_600;
/// CAS retries before reporting the record as contended.
const MAX_CAS_RETRIES: u32 = 16;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Approval store failures.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No record exists for the pending id.
    #[error("pending approval '{0}' not found")]
    NotFound(PendingId),
    /// Coordinating store failure.
    #[error(transparent)]
    Store(#[from] CoordinatorError),
    /// CAS contention exhausted its retry budget.
    #[error("approval record '{0}' stayed contended")]
    Contended(PendingId),
}

// ============================================================================
// SECTION: Approval Records
// ============================================================================

/// An approver's vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    /// Count toward the quorum.
    Approve,
    /// Terminate the approval as denied.
    Deny,
}

impl ApprovalAction {
    /// Stable lowercase label for audit records and callbacks.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
        }
    }
}

/// Lifecycle state of a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting decisions.
    Pending,
    /// Quorum reached with no deny.
    Allow,
    /// A deny was recorded.
    Deny,
    /// TTL elapsed before a terminal decision.
    Expired,
}

impl ApprovalStatus {
    /// Returns true for sticky terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Expired => "expired",
        }
    }
}

/// One recorded approver decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverDecision {
    /// The vote.
    pub action: ApprovalAction,
    /// When it was recorded.
    pub ts: Timestamp,
}

/// Durable pending approval record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Record identifier.
    pub pending_id: PendingId,
    /// Tenant of the paused call.
    pub tenant: TenantId,
    /// Subject that made the paused call.
    pub requester: SubjectId,
    /// Tool awaiting approval.
    pub tool: ToolName,
    /// Arguments of the paused call.
    pub arguments: Value,
    /// Human-readable summary shown to approvers.
    pub summary: String,
    /// Approve quorum.
    pub required_approvals: u32,
    /// Approver group constraint, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver_group: Option<String>,
    /// At most one decision per approver id.
    #[serde(default)]
    pub decisions: BTreeMap<SubjectId, ApproverDecision>,
    /// Current lifecycle state.
    pub status: ApprovalStatus,
    /// Creation instant.
    pub created_ts: Timestamp,
    /// Time-to-live in seconds.
    pub ttl_seconds: u64,
    /// Cost declared by the paused call, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
}

impl PendingApproval {
    /// Returns the instant after which the record expires.
    #[must_use]
    pub fn expires_at(&self) -> Timestamp {
        self.created_ts.plus_millis(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX) * 1_000)
    }

    /// Returns true when the TTL has elapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.expires_at()
    }

    /// Recomputes status from the decision map. Deny precedence: any deny is
    /// terminal regardless of approvals or their order.
    #[must_use]
    pub fn tally(&self) -> ApprovalStatus {
        let any_deny = self
            .decisions
            .values()
            .any(|decision| decision.action == ApprovalAction::Deny);
        if any_deny {
            return ApprovalStatus::Deny;
        }
        let approvals = self
            .decisions
            .values()
            .filter(|decision| decision.action == ApprovalAction::Approve)
            .count();
        if approvals >= self.required_approvals as usize {
            ApprovalStatus::Allow
        } else {
            ApprovalStatus::Pending
        }
    }
}

// ============================================================================
// SECTION: Approval Store
// ============================================================================

/// Durable approval store over the coordinating store.
#[derive(Clone)]
pub struct ApprovalStore {
    /// Coordinating store handle.
    coordinator: Arc<dyn Coordinator>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl ApprovalStore {
    /// Creates a store over the given coordinator and clock.
    #[must_use]
    pub fn new(coordinator: Arc<dyn Coordinator>, clock: Arc<dyn Clock>) -> Self {
        Self { coordinator, clock }
    }

    /// Creates a pending record. Concurrent creates for the same id are
    /// idempotent: the first write wins and later callers read it back.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Store`] on store failure.
    pub async fn create(&self, record: PendingApproval) -> Result<PendingApproval, ApprovalError> {
        let key = record_key(&record.pending_id);
        let ttl = retention(record.ttl_seconds);
        let encoded = encode(&record)?;
        let inserted =
            self.coordinator.compare_and_swap(&key, None, encoded, Some(ttl)).await?;
        if inserted {
            return Ok(record);
        }
        self.get(&record.pending_id)
            .await?
            .ok_or(ApprovalError::NotFound(record.pending_id))
    }

    /// Reads a record, surfacing lazily observed expiry.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Store`] on store failure.
    pub async fn get(&self, pending_id: &PendingId) -> Result<Option<PendingApproval>, ApprovalError> {
        let Some(bytes) = self.coordinator.get(&record_key(pending_id)).await? else {
            return Ok(None);
        };
        let mut record = decode(&bytes)?;
        if record.status == ApprovalStatus::Pending && record.is_expired_at(self.clock.now()) {
            record.status = ApprovalStatus::Expired;
        }
        Ok(Some(record))
    }

    /// Records an approver's decision atomically and re-evaluates status.
    ///
    /// At most one decision per approver; before a terminal state, the last
    /// write for that approver wins. Terminal states are sticky: repeated
    /// posts after resolution are no-ops returning the settled record. On a
    /// terminal transition the pending id is published for waiters.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] for unknown ids and
    /// [`ApprovalError::Store`]/[`ApprovalError::Contended`] on store trouble.
    pub async fn record_decision(
        &self,
        pending_id: &PendingId,
        approver: &SubjectId,
        action: ApprovalAction,
    ) -> Result<PendingApproval, ApprovalError> {
        let key = record_key(pending_id);
        for _ in 0..MAX_CAS_RETRIES {
            let Some(bytes) = self.coordinator.get(&key).await? else {
                return Err(ApprovalError::NotFound(pending_id.clone()));
            };
            let mut record = decode(&bytes)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            let now = self.clock.now();
            if record.is_expired_at(now) {
                record.status = ApprovalStatus::Expired;
                if self.swap(&key, &bytes, &record).await? {
                    self.notify(pending_id, record.status).await;
                    return Ok(record);
                }
                continue;
            }
            record.decisions.insert(approver.clone(), ApproverDecision { action, ts: now });
            record.status = record.tally();
            if self.swap(&key, &bytes, &record).await? {
                if record.status.is_terminal() {
                    self.notify(pending_id, record.status).await;
                }
                return Ok(record);
            }
        }
        Err(ApprovalError::Contended(pending_id.clone()))
    }

    /// Waits up to `timeout` for the record to reach a terminal state.
    ///
    /// Subscribes to the record's channel before re-reading state so a
    /// resolution landing between the read and the wait still wakes the
    /// caller. Returns the status observed when the wait ends; `pending`
    /// after a timeout is a valid outcome surfaced as `needs_approval`.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] for unknown ids and
    /// [`ApprovalError::Store`] on store failure.
    pub async fn wait_for_resolution(
        &self,
        pending_id: &PendingId,
        timeout: Duration,
    ) -> Result<ApprovalStatus, ApprovalError> {
        let mut subscription = self.coordinator.subscribe(&channel_key(pending_id)).await?;
        let read_status = |record: Option<PendingApproval>| -> Result<ApprovalStatus, ApprovalError> {
            record
                .map(|record| record.status)
                .ok_or(ApprovalError::NotFound(pending_id.clone()))
        };
        let status = read_status(self.get(pending_id).await?)?;
        if status.is_terminal() {
            return Ok(status);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return read_status(self.get(pending_id).await?);
            }
            match tokio::time::timeout(remaining, subscription.recv()).await {
                Ok(Some(_)) | Err(_) => {
                    let status = read_status(self.get(pending_id).await?)?;
                    if status.is_terminal() {
                        return Ok(status);
                    }
                    if Instant::now() >= deadline {
                        return Ok(status);
                    }
                }
                // Channel gone; fall back to the stored state.
                Ok(None) => return read_status(self.get(pending_id).await?),
            }
        }
    }

    /// Swaps a record in place, keeping its retention window.
    async fn swap(
        &self,
        key: &str,
        current: &[u8],
        record: &PendingApproval,
    ) -> Result<bool, ApprovalError> {
        let ttl = retention(record.ttl_seconds);
        Ok(self
            .coordinator
            .compare_and_swap(key, Some(current), encode(record)?, Some(ttl))
            .await?)
    }

    /// Publishes a terminal transition for waiters.
    async fn notify(&self, pending_id: &PendingId, status: ApprovalStatus) {
        let payload =
            json!({"pending_id": pending_id, "status": status.as_str()}).to_string();
        // A publish failure only delays waiters until their timeout re-read.
        let _ = self.coordinator.publish(&channel_key(pending_id), &payload).await;
    }
}

// ============================================================================
// SECTION: Keys & Codec
// ============================================================================

fn record_key(pending_id: &PendingId) -> String {
    format!("appr:{pending_id}")
}

fn channel_key(pending_id: &PendingId) -> String {
    format!("appr:notify:{pending_id}")
}

fn retention(ttl_seconds: u64) -> Duration {
    Duration::from_secs(ttl_seconds.saturating_add(RETENTION_GRACE_SECONDS))
}

fn encode(record: &PendingApproval) -> Result<Vec<u8>, ApprovalError> {
    serde_json::to_vec(record)
        .map_err(|err| CoordinatorError::Corrupt(format!("approval encode: {err}")).into())
}

fn decode(bytes: &[u8]) -> Result<PendingApproval, ApprovalError> {
    serde_json::from_slice(bytes)
        .map_err(|err| CoordinatorError::Corrupt(format!("approval decode: {err}")).into())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
