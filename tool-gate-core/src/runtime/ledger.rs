// tool-gate-core/src/runtime/ledger.rs
// ============================================================================
// Module: Rate & Budget Ledger
// Description: Per-tenant token buckets and atomic daily cost budgets.
// Purpose: Admit calls within QPS and debit declared costs without overshoot.
// Dependencies: crate::coordinator, serde, chrono (via core clock)
// ============================================================================

//! ## Overview
//! Admission and spend control share the coordinating store so every gateway
//! instance observes the same buckets and counters. The token bucket refills
//! continuously at `capacity_qps` tokens per second (capped at capacity) and
//! admits a call per whole token; updates go through compare-and-swap so
//! concurrent admissions never double-spend a token. Budgets are integer-cent
//! counters debited with one bounded atomic increment; a failed downstream
//! step refunds the debit, clamped at zero.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::coordinator::Coordinator;
use crate::coordinator::CoordinatorError;
use crate::core::BudgetPeriod;
use crate::core::Clock;
use crate::core::TenantId;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Milli-tokens representing one admission.
const TOKEN_MILLIS: i64 = 1_000;
/// CAS retries before reporting the bucket as unavailable.
const MAX_CAS_RETRIES: u32 = 16;
/// Default tenant QPS when no quota is configured.
pub const DEFAULT_CAPACITY_QPS: f64 = 25.0;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Coordinating store failure.
    #[error(transparent)]
    Store(#[from] CoordinatorError),
    /// CAS contention exhausted its retry budget.
    #[error("ledger contention on key '{0}'")]
    Contended(String),
}

// ============================================================================
// SECTION: Quotas
// ============================================================================

/// A named budget declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSpec {
    /// Accounting period.
    pub period: BudgetPeriod,
    /// Spend ceiling in USD.
    pub limit_usd: f64,
}

/// Per-tenant quota settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantQuotas {
    /// Admission rate; `None` uses the gateway default.
    pub capacity_qps: Option<f64>,
    /// Named budgets; an absent budget means unlimited spend.
    #[serde(default)]
    pub budgets: BTreeMap<String, BudgetSpec>,
}

/// Registry of tenant quotas behind the coordinating store.
#[derive(Clone)]
pub struct QuotaRegistry {
    /// Coordinating store handle.
    coordinator: Arc<dyn Coordinator>,
}

impl QuotaRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Reads quotas for a tenant; missing records read as defaults.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on store failure or a corrupt record.
    pub async fn quotas_for(&self, tenant: &TenantId) -> Result<TenantQuotas, LedgerError> {
        match self.coordinator.get(&quota_key(tenant)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).map_err(|err| {
                CoordinatorError::Corrupt(format!("quota record for '{tenant}': {err}"))
            })?),
            None => Ok(TenantQuotas::default()),
        }
    }

    /// Sets the admission rate for a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on store failure.
    pub async fn set_rate_limit(&self, tenant: &TenantId, qps: f64) -> Result<(), LedgerError> {
        let mut quotas = self.quotas_for(tenant).await?;
        quotas.capacity_qps = Some(qps);
        self.write(tenant, &quotas).await
    }

    /// Creates or replaces a named budget for a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on store failure.
    pub async fn set_budget(
        &self,
        tenant: &TenantId,
        name: &str,
        spec: BudgetSpec,
    ) -> Result<(), LedgerError> {
        let mut quotas = self.quotas_for(tenant).await?;
        quotas.budgets.insert(name.to_string(), spec);
        self.write(tenant, &quotas).await
    }

    /// Persists a quota record.
    async fn write(&self, tenant: &TenantId, quotas: &TenantQuotas) -> Result<(), LedgerError> {
        let bytes = serde_json::to_vec(quotas)
            .map_err(|err| CoordinatorError::Corrupt(format!("quota encode: {err}")))?;
        self.coordinator.put_ttl(&quota_key(tenant), bytes, None).await?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Token Bucket
// ============================================================================

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The call is admitted.
    Admitted,
    /// The bucket is empty.
    Limited {
        /// Milliseconds until one token accrues.
        retry_after_ms: u64,
    },
}

/// Persisted bucket state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    /// Remaining tokens in milli-tokens.
    tokens_milli: i64,
    /// Last refill instant, epoch milliseconds.
    refilled_at_ms: i64,
}

/// Per-tenant token-bucket rate limiter over the coordinating store.
#[derive(Clone)]
pub struct RateLimiter {
    /// Coordinating store handle.
    coordinator: Arc<dyn Coordinator>,
    /// Time source.
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter over the given store and clock.
    #[must_use]
    pub fn new(coordinator: Arc<dyn Coordinator>, clock: Arc<dyn Clock>) -> Self {
        Self { coordinator, clock }
    }

    /// Attempts to admit one call for the tenant at the given rate.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] when the store fails or the bucket stays
    /// contended past the retry budget; admission fails closed either way.
    pub async fn admit(
        &self,
        tenant: &TenantId,
        capacity_qps: f64,
    ) -> Result<RateDecision, LedgerError> {
        let key = rate_key(tenant);
        if capacity_qps <= f64::EPSILON {
            return Ok(RateDecision::Limited {
                retry_after_ms: u64::MAX,
            });
        }
        let capacity_milli = ((capacity_qps * 1_000.0).round() as i64).max(TOKEN_MILLIS);
        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();
            let current = self.coordinator.get(&key).await?;
            let state = match &current {
                Some(bytes) => serde_json::from_slice::<BucketState>(bytes).map_err(|err| {
                    CoordinatorError::Corrupt(format!("bucket for '{tenant}': {err}"))
                })?,
                None => BucketState {
                    tokens_milli: capacity_milli,
                    refilled_at_ms: now.as_millis(),
                },
            };
            let elapsed_ms = now.as_millis().saturating_sub(state.refilled_at_ms).max(0);
            let refill_milli = (elapsed_ms as f64 * capacity_qps).floor() as i64;
            let tokens = (state.tokens_milli.saturating_add(refill_milli)).min(capacity_milli);

            if tokens < TOKEN_MILLIS {
                let deficit = TOKEN_MILLIS - tokens;
                let retry_after_ms = (deficit as f64 / capacity_qps).ceil() as u64;
                return Ok(RateDecision::Limited { retry_after_ms });
            }

            let next = BucketState {
                tokens_milli: tokens - TOKEN_MILLIS,
                refilled_at_ms: now.as_millis(),
            };
            let encoded = serde_json::to_vec(&next)
                .map_err(|err| CoordinatorError::Corrupt(format!("bucket encode: {err}")))?;
            let swapped = self
                .coordinator
                .compare_and_swap(&key, current.as_deref(), encoded, None)
                .await?;
            if swapped {
                return Ok(RateDecision::Admitted);
            }
        }
        Err(LedgerError::Contended(key))
    }
}

// ============================================================================
// SECTION: Budget Ledger
// ============================================================================

/// One applied budget debit, held for potential refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitReceipt {
    /// Counter key that was debited.
    key: String,
    /// Debited amount in cents.
    cents: i64,
}

/// Result of a budget debit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    /// All configured budgets admitted the spend.
    Applied {
        /// Receipts for refunding on downstream failure.
        receipts: Vec<DebitReceipt>,
    },
    /// A budget would be exceeded; nothing was left debited.
    Exceeded {
        /// Name of the budget that refused the debit.
        budget: String,
    },
}

/// Atomic cost-budget ledger over the coordinating store.
#[derive(Clone)]
pub struct BudgetLedger {
    /// Coordinating store handle.
    coordinator: Arc<dyn Coordinator>,
    /// Time source for period keys.
    clock: Arc<dyn Clock>,
}

impl BudgetLedger {
    /// Creates a ledger over the given store and clock.
    #[must_use]
    pub fn new(coordinator: Arc<dyn Coordinator>, clock: Arc<dyn Clock>) -> Self {
        Self { coordinator, clock }
    }

    /// Debits a declared cost against every configured budget.
    ///
    /// Each budget is one atomic bounded increment; when a later budget
    /// refuses, the earlier debits are rolled back before returning, so a
    /// rejected call never consumes spend.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on store failure; partial debits are refunded
    /// on a best-effort basis before the error propagates.
    pub async fn debit(
        &self,
        tenant: &TenantId,
        quotas: &TenantQuotas,
        amount_usd: f64,
    ) -> Result<DebitOutcome, LedgerError> {
        let cents = usd_to_cents(amount_usd);
        if cents <= 0 || quotas.budgets.is_empty() {
            return Ok(DebitOutcome::Applied {
                receipts: Vec::new(),
            });
        }
        let now = self.clock.now();
        let mut receipts = Vec::new();
        for (name, spec) in &quotas.budgets {
            let key = budget_key(tenant, name, &spec.period.key_for(now));
            let limit_cents = usd_to_cents(spec.limit_usd);
            let outcome = match self.coordinator.incr_bounded(&key, cents, limit_cents).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.refund(&receipts).await;
                    return Err(err.into());
                }
            };
            if outcome.applied {
                receipts.push(DebitReceipt { key, cents });
            } else {
                self.refund(&receipts).await;
                return Ok(DebitOutcome::Exceeded {
                    budget: name.clone(),
                });
            }
        }
        Ok(DebitOutcome::Applied { receipts })
    }

    /// Refunds previously applied debits, clamped at zero.
    pub async fn refund(&self, receipts: &[DebitReceipt]) {
        for receipt in receipts {
            // Refund failures are swallowed: the counter self-corrects at the
            // period boundary and the call is already failing.
            let _ = self.coordinator.incr_bounded(&receipt.key, -receipt.cents, i64::MAX).await;
        }
    }

    /// Reads the spend recorded against a budget for the current period.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on store failure.
    pub async fn used_usd(
        &self,
        tenant: &TenantId,
        name: &str,
        period: BudgetPeriod,
    ) -> Result<f64, LedgerError> {
        let key = budget_key(tenant, name, &period.key_for(self.clock.now()));
        let cents = match self.coordinator.get(&key).await? {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or_else(|| CoordinatorError::Corrupt(format!("counter at '{key}'")))?,
            None => 0,
        };
        Ok(cents as f64 / 100.0)
    }
}

// ============================================================================
// SECTION: Keys & Conversion
// ============================================================================

/// Converts USD to integer cents, rounding half away from zero.
#[must_use]
pub fn usd_to_cents(usd: f64) -> i64 {
    (usd * 100.0).round() as i64
}

fn quota_key(tenant: &TenantId) -> String {
    format!("quota:{tenant}")
}

fn rate_key(tenant: &TenantId) -> String {
    format!("rate:{tenant}")
}

fn budget_key(tenant: &TenantId, name: &str, period_key: &str) -> String {
    format!("budget:{tenant}:{name}:{period_key}")
}

// ============================================================================
// SECTION: Tests
// ============================================================================
