// tool-gate-core/src/core/clock.rs
// ============================================================================
// Module: Tool Gate Clock
// Description: Millisecond timestamps, budget period keys, and a clock seam.
// Purpose: Make TTL and refill arithmetic deterministic under test.
// Dependencies: chrono, serde
// ============================================================================

//! ## Overview
//! All time-dependent subsystems (token buckets, approval TTLs, budget period
//! keys, audit timestamps) read time through [`Clock`] so tests can drive a
//! [`ManualClock`] across boundary conditions instead of sleeping.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// Milliseconds since the Unix epoch, UTC.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from epoch milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Creates a timestamp from epoch seconds.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Returns epoch milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns epoch seconds, truncated.
    #[must_use]
    pub const fn as_secs(self) -> i64 {
        self.0.div_euclid(1_000)
    }

    /// Returns this timestamp advanced by the given milliseconds.
    #[must_use]
    pub const fn plus_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Milliseconds elapsed from `earlier` to `self`, clamped at zero.
    #[must_use]
    pub const fn millis_since(self, earlier: Self) -> i64 {
        let delta = self.0.saturating_sub(earlier.0);
        if delta < 0 { 0 } else { delta }
    }

    /// Returns the UTC calendar view of this timestamp.
    #[must_use]
    pub fn to_utc(self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_utc().format("%Y-%m-%dT%H:%M:%S%.3fZ").fmt(f)
    }
}

// ============================================================================
// SECTION: Budget Periods
// ============================================================================

/// Budget accounting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    /// Resets at every UTC midnight.
    Day,
    /// Resets at every ISO week boundary, UTC.
    Week,
}

impl BudgetPeriod {
    /// Returns the period key for the given instant, e.g. `2026-08-02` or
    /// `2026-W31`.
    #[must_use]
    pub fn key_for(self, ts: Timestamp) -> String {
        let utc = ts.to_utc();
        match self {
            Self::Day => utc.format("%Y-%m-%d").to_string(),
            Self::Week => {
                let week = utc.iso_week();
                format!("{:04}-W{:02}", week.year(), week.week())
            }
        }
    }
}

// ============================================================================
// SECTION: Clock Trait
// ============================================================================

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Timestamp;
}

/// Wall clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(Utc::now().timestamp_millis())
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    /// Current instant in epoch milliseconds.
    now_millis: AtomicI64,
}

impl ManualClock {
    /// Creates a manual clock starting at the given instant.
    #[must_use]
    pub fn starting_at(ts: Timestamp) -> Self {
        Self {
            now_millis: AtomicI64::new(ts.as_millis()),
        }
    }

    /// Advances the clock by the given milliseconds.
    pub fn advance_millis(&self, millis: i64) {
        self.now_millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Moves the clock to an absolute instant.
    pub fn set(&self, ts: Timestamp) {
        self.now_millis.store(ts.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now_millis.load(Ordering::SeqCst))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
